//! Hour/minute/second time patterns
//!
//! A pattern field is one of:
//! - `*` matches every value
//! - `N` matches exactly N
//! - `/N` matches values divisible by N
//! - `a,b,c` matches any listed value
//!
//! Fields left out of a pattern are filled in from the most significant
//! field that was given: more significant fields become `*` and less
//! significant ones become `0`. `seconds: "0,30"` therefore fires twice a
//! minute, and `minutes: "/15"` fires at second 0 of every quarter hour.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::ScheduleError;

const MAX_HOUR: u32 = 23;
const MAX_MINUTE: u32 = 59;
const MAX_SECOND: u32 = 59;

/// One field of a [`TimePattern`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternField {
    Any,
    Exact(u32),
    Every(u32),
    List(Vec<u32>),
}

impl PatternField {
    /// Parse one field, validating values against `0..=max`
    pub fn parse(name: &'static str, raw: &str, max: u32) -> Result<Self, ScheduleError> {
        let raw = raw.trim();
        let invalid = || ScheduleError::InvalidPattern {
            field: name,
            value: raw.to_string(),
        };
        let parse_value = |s: &str| -> Result<u32, ScheduleError> {
            match s.trim().parse::<u32>() {
                Ok(v) if v <= max => Ok(v),
                _ => Err(invalid()),
            }
        };

        if raw == "*" {
            return Ok(Self::Any);
        }

        if let Some(divisor) = raw.strip_prefix('/') {
            let divisor = parse_value(divisor)?;
            if divisor == 0 {
                return Err(invalid());
            }
            return Ok(Self::Every(divisor));
        }

        if raw.contains(',') {
            let mut values = raw
                .split(',')
                .map(parse_value)
                .collect::<Result<Vec<_>, _>>()?;
            values.sort_unstable();
            values.dedup();
            return Ok(Self::List(values));
        }

        parse_value(raw).map(Self::Exact)
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(n) => value == *n,
            Self::Every(n) => value % n == 0,
            Self::List(values) => values.contains(&value),
        }
    }

    /// All matching values in `0..=max`, ascending
    fn values(&self, max: u32) -> Vec<u32> {
        (0..=max).filter(|v| self.matches(*v)).collect()
    }
}

impl fmt::Display for PatternField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(n) => write!(f, "{}", n),
            Self::Every(n) => write!(f, "/{}", n),
            Self::List(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Raw pattern as written in configuration
///
/// Each field accepts a string (`"/5"`, `"0,30"`, `"*"`) or a bare number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub hours: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub minutes: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub seconds: Option<String>,
}

impl PatternSpec {
    pub fn seconds(seconds: impl Into<String>) -> Self {
        Self {
            seconds: Some(seconds.into()),
            ..Self::default()
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    }))
}

/// A validated hour/minute/second pattern, evaluated in UTC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePattern {
    pub hours: PatternField,
    pub minutes: PatternField,
    pub seconds: PatternField,
}

impl TimePattern {
    /// Build a pattern from optional fields; at least one is required
    pub fn new(
        hours: Option<&str>,
        minutes: Option<&str>,
        seconds: Option<&str>,
    ) -> Result<Self, ScheduleError> {
        let (hours_default, minutes_default) = match (hours, minutes, seconds) {
            (None, None, None) => return Err(ScheduleError::EmptyPattern),
            (Some(_), _, _) => ("0", "0"),
            (None, Some(_), _) => ("*", "0"),
            (None, None, Some(_)) => ("*", "*"),
        };

        Ok(Self {
            hours: PatternField::parse("hours", hours.unwrap_or(hours_default), MAX_HOUR)?,
            minutes: PatternField::parse("minutes", minutes.unwrap_or(minutes_default), MAX_MINUTE)?,
            seconds: PatternField::parse("seconds", seconds.unwrap_or("0"), MAX_SECOND)?,
        })
    }

    /// Once a day at a fixed time of day
    pub fn daily_at(time: NaiveTime) -> Self {
        Self {
            hours: PatternField::Exact(time.hour()),
            minutes: PatternField::Exact(time.minute()),
            seconds: PatternField::Exact(time.second()),
        }
    }

    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        self.hours.matches(time.hour())
            && self.minutes.matches(time.minute())
            && self.seconds.matches(time.second())
    }

    /// The first whole second strictly after `after` that matches
    ///
    /// Every field matches at least one value, so a match always exists
    /// within the next day; `None` only comes back at the end of the
    /// representable time range.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_nanosecond(0)? + Duration::seconds(1);
        let (h0, m0, s0) = (start.hour(), start.minute(), start.second());

        let hours = self.hours.values(MAX_HOUR);
        let minutes = self.minutes.values(MAX_MINUTE);
        let seconds = self.seconds.values(MAX_SECOND);

        for day_offset in 0..=1 {
            let date = start.date_naive() + Duration::days(day_offset);
            let today = day_offset == 0;

            for &h in hours.iter().filter(|&&h| !today || h >= h0) {
                let same_hour = today && h == h0;
                for &m in minutes.iter().filter(|&&m| !same_hour || m >= m0) {
                    let same_minute = same_hour && m == m0;
                    if let Some(&s) = seconds.iter().find(|&&s| !same_minute || s >= s0) {
                        let naive = date.and_hms_opt(h, m, s)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
        }

        None
    }
}

impl TryFrom<&PatternSpec> for TimePattern {
    type Error = ScheduleError;

    fn try_from(spec: &PatternSpec) -> Result<Self, Self::Error> {
        Self::new(
            spec.hours.as_deref(),
            spec.minutes.as_deref(),
            spec.seconds.as_deref(),
        )
    }
}

impl fmt::Display for TimePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.hours, self.minutes, self.seconds)
    }
}

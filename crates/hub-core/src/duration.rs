//! Serde helpers for configuration durations
//!
//! Durations are written either as integer seconds or as `SS`, `MM:SS` or
//! `HH:MM:SS` strings, e.g. `grace_period: "00:01:10"` or `grace_period: 70`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*value))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

/// Render as `HH:MM:SS`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS`
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let parts = s
        .trim()
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| format!("invalid duration '{}'", s)))
        .collect::<Result<Vec<_>, _>>()?;

    let (h, m, sec) = match parts.as_slice() {
        [sec] => (0, 0, *sec),
        [m, sec] => (0, *m, *sec),
        [h, m, sec] => (*h, *m, *sec),
        _ => return Err(format!("invalid duration '{}'", s)),
    };

    h.checked_mul(3600)
        .and_then(|total| total.checked_add(m.checked_mul(60)?))
        .and_then(|total| total.checked_add(sec))
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, serde::Serialize)]
    struct Holder {
        #[serde(with = "super")]
        grace: Duration,
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_duration("70").unwrap(), Duration::from_secs(70));
        assert_eq!(parse_duration("1:10").unwrap(), Duration::from_secs(70));
        assert_eq!(parse_duration("01:00:05").unwrap(), Duration::from_secs(3605));
        assert!(parse_duration("1:2:3:4").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_overflowing_duration_is_an_error() {
        let huge = format!("{}:00:00", u64::MAX / 1000);
        assert_eq!(
            parse_duration(&huge),
            Err(format!("duration '{}' is too large", huge))
        );
        assert!(parse_duration(&format!("{}:00", u64::MAX)).is_err());
        assert!(parse_duration(&format!("0:0:{}", u64::MAX)).is_ok());
    }

    #[test]
    fn test_integer_and_string_inputs() {
        let a: Holder = serde_json::from_str(r#"{"grace": 70}"#).unwrap();
        let b: Holder = serde_json::from_str(r#"{"grace": "00:01:10"}"#).unwrap();
        assert_eq!(a.grace, b.grace);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            r#"{"grace":"00:01:10"}"#
        );
    }
}

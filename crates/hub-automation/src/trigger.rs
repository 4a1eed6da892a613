//! Trigger types
//!
//! Triggers are event detectors that start automations. Event-driven
//! triggers (`state`, `event`) are matched against bus events; time-driven
//! triggers (`time`, `time_pattern`, `interval`) are registered with the
//! scheduler.

use chrono::{DateTime, NaiveTime, Utc};
use hub_core::{Context, EntityId};
use hub_scheduler::{PatternSpec, TimePattern};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Trigger errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Invalid trigger configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid event data: {0}")]
    InvalidEventData(String),
}

/// Result type for trigger operations
pub type TriggerResult<T> = Result<T, TriggerError>;

/// Data provided when a trigger fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerData {
    /// Optional trigger ID for referencing in conditions
    pub id: Option<String>,

    /// Trigger platform type (e.g., "state", "time", "event")
    pub platform: String,

    /// Details of the match (entity id, old/new state, event data, ...)
    #[serde(flatten)]
    pub variables: HashMap<String, serde_json::Value>,

    /// When the trigger matched
    pub triggered_at: DateTime<Utc>,

    /// Context the action runs under, a child of whatever caused the match
    pub context: Context,
}

impl TriggerData {
    pub fn new(platform: impl Into<String>, triggered_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            platform: platform.into(),
            variables: HashMap::new(),
            triggered_at,
            context: Context::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Run the action as a consequence of `parent`
    pub fn caused_by(mut self, parent: &Context) -> Self {
        self.context = parent.child();
        self
    }
}

/// Trigger definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires when an entity's state changes
    State(StateTrigger),

    /// Fires on any event with optional data matching
    Event(EventTrigger),

    /// Fires once a day at a fixed time
    Time(TimeTrigger),

    /// Fires when the clock matches a pattern
    TimePattern(TimePatternTrigger),

    /// Fires every N seconds
    Interval(IntervalTrigger),
}

impl Trigger {
    /// Get the trigger's ID if set
    pub fn id(&self) -> Option<&str> {
        match self {
            Trigger::State(t) => t.id.as_deref(),
            Trigger::Event(t) => t.id.as_deref(),
            Trigger::Time(t) => t.id.as_deref(),
            Trigger::TimePattern(t) => t.id.as_deref(),
            Trigger::Interval(t) => t.id.as_deref(),
        }
    }

    /// Get the trigger platform name
    pub fn platform(&self) -> &'static str {
        match self {
            Trigger::State(_) => "state",
            Trigger::Event(_) => "event",
            Trigger::Time(_) => "time",
            Trigger::TimePattern(_) => "time_pattern",
            Trigger::Interval(_) => "interval",
        }
    }

    /// Whether the trigger is driven by the scheduler rather than events
    pub fn is_time_based(&self) -> bool {
        matches!(
            self,
            Trigger::Time(_) | Trigger::TimePattern(_) | Trigger::Interval(_)
        )
    }

    /// Reject configurations that could never match
    pub fn validate(&self) -> TriggerResult<()> {
        match self {
            Trigger::State(t) => t.entity_id.validate(),
            Trigger::Event(t) if t.event_type.trim().is_empty() => Err(
                TriggerError::InvalidConfig("event trigger needs an event_type".to_string()),
            ),
            Trigger::Event(_) | Trigger::Time(_) => Ok(()),
            Trigger::TimePattern(t) => t.time_pattern().map(|_| ()),
            Trigger::Interval(t) if t.every.as_secs() == 0 => Err(TriggerError::InvalidConfig(
                "interval must be at least one second".to_string(),
            )),
            Trigger::Interval(_) => Ok(()),
        }
    }
}

/// State change trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Entity IDs to monitor (can be single or list)
    pub entity_id: EntityIdSpec,

    /// Previous value to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<StateMatch>,

    /// New value to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<StateMatch>,

    /// Attribute to monitor instead of state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Don't trigger if coming from these values
    #[serde(default)]
    pub not_from: Vec<String>,

    /// Don't trigger if going to these values
    #[serde(default)]
    pub not_to: Vec<String>,
}

/// Event trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Event type to match
    pub event_type: String,

    /// Subset of the event data that must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<serde_json::Value>,

    /// Only events from this user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Daily time trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Time of day (HH:MM:SS, UTC)
    pub at: NaiveTime,
}

/// Time pattern trigger (cron-like)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimePatternTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(flatten)]
    pub pattern: PatternSpec,
}

impl TimePatternTrigger {
    pub fn time_pattern(&self) -> TriggerResult<TimePattern> {
        TimePattern::try_from(&self.pattern).map_err(|e| TriggerError::InvalidConfig(e.to_string()))
    }
}

/// Fixed interval trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Period (seconds or HH:MM:SS)
    #[serde(with = "hub_core::duration")]
    pub every: Duration,
}

// --- Supporting types ---

/// Entity ID specification (single or list)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityIdSpec {
    Single(String),
    List(Vec<String>),
}

impl EntityIdSpec {
    /// Get all entity IDs
    pub fn ids(&self) -> Vec<&str> {
        match self {
            EntityIdSpec::Single(id) => vec![id.as_str()],
            EntityIdSpec::List(ids) => ids.iter().map(|s| s.as_str()).collect(),
        }
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.ids().contains(&entity_id)
    }

    /// Every id must parse and the list must not be empty
    pub fn validate(&self) -> TriggerResult<()> {
        let ids = self.ids();
        if ids.is_empty() {
            return Err(TriggerError::InvalidConfig("entity_id list is empty".to_string()));
        }
        for id in ids {
            id.parse::<EntityId>()
                .map_err(|e| TriggerError::InvalidConfig(format!("'{}': {}", id, e)))?;
        }
        Ok(())
    }
}

/// State match specification (single value or list)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateMatch {
    Single(String),
    List(Vec<String>),
}

impl StateMatch {
    /// Check if a state matches
    pub fn matches(&self, state: &str) -> bool {
        match self {
            StateMatch::Single(s) => s == state,
            StateMatch::List(list) => list.iter().any(|s| s == state),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            StateMatch::Single(s) => vec![s.as_str()],
            StateMatch::List(list) => list.iter().map(String::as_str).collect(),
        }
    }
}

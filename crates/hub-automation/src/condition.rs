//! Condition types
//!
//! Conditions are pure checks over the state store and the clock, evaluated
//! after a trigger fires. All of a rule's conditions must hold for its action
//! to run.

use chrono::{NaiveTime, Weekday};
use hub_core::HubError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trigger::{EntityIdSpec, StateMatch};

/// Condition errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("Invalid condition configuration: {0}")]
    InvalidConfig(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid state value: {0}")]
    InvalidState(String),
}

/// Result type for condition operations
pub type ConditionResult<T> = Result<T, ConditionError>;

impl From<ConditionError> for HubError {
    fn from(err: ConditionError) -> Self {
        match err {
            ConditionError::InvalidConfig(msg) => HubError::Configuration(msg),
            other => HubError::InvariantViolation(other.to_string()),
        }
    }
}

/// Condition definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// Check entity state
    State(StateCondition),

    /// Check numeric value thresholds
    NumericState(NumericStateCondition),

    /// Check current time
    Time(TimeCondition),

    /// Check which trigger fired
    Trigger(TriggerCondition),

    /// All conditions must be true (AND)
    And(AndCondition),

    /// Any condition must be true (OR)
    Or(OrCondition),

    /// None of the conditions may be true (NOT)
    Not(NotCondition),
}

impl Condition {
    /// Create an AND condition
    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::And(AndCondition { conditions })
    }

    /// Create an OR condition
    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Or(OrCondition { conditions })
    }

    /// Create a NOT condition
    pub fn not(condition: Condition) -> Self {
        Condition::Not(NotCondition {
            conditions: vec![condition],
        })
    }

    /// Shorthand for a single-entity state check
    pub fn state(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Condition::State(StateCondition {
            entity_id: EntityIdSpec::Single(entity_id.into()),
            state: StateMatch::Single(state.into()),
            attribute: None,
            match_regex: false,
        })
    }

    /// Check the configuration without touching the store
    pub fn validate(&self) -> ConditionResult<()> {
        match self {
            Condition::State(c) => {
                validate_entities(&c.entity_id)?;
                if c.match_regex {
                    for pattern in c.state.values() {
                        regex::Regex::new(pattern).map_err(|e| {
                            ConditionError::InvalidConfig(format!("Invalid regex: {}", e))
                        })?;
                    }
                }
                Ok(())
            }
            Condition::NumericState(c) => {
                validate_entities(&c.entity_id)?;
                if c.above.is_none() && c.below.is_none() {
                    return Err(ConditionError::InvalidConfig(
                        "numeric_state needs above or below".to_string(),
                    ));
                }
                for value in [&c.above, &c.below].into_iter().flatten() {
                    if let NumericValue::Entity(id) = value {
                        validate_entity(id)?;
                    }
                }
                Ok(())
            }
            Condition::Time(c) => {
                if c.after.is_none() && c.before.is_none() && c.weekday.is_empty() {
                    return Err(ConditionError::InvalidConfig(
                        "time condition needs after, before or weekday".to_string(),
                    ));
                }
                Ok(())
            }
            Condition::Trigger(_) => Ok(()),
            Condition::And(c) => c.conditions.iter().try_for_each(Condition::validate),
            Condition::Or(c) => c.conditions.iter().try_for_each(Condition::validate),
            Condition::Not(c) => c.conditions.iter().try_for_each(Condition::validate),
        }
    }
}

fn validate_entities(spec: &EntityIdSpec) -> ConditionResult<()> {
    spec.validate()
        .map_err(|e| ConditionError::InvalidConfig(e.to_string()))
}

fn validate_entity(entity_id: &str) -> ConditionResult<()> {
    entity_id
        .parse::<hub_core::EntityId>()
        .map(|_| ())
        .map_err(|e| ConditionError::InvalidConfig(format!("'{}': {}", entity_id, e)))
}

/// State condition - check entity state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCondition {
    /// Entity IDs to check; all must match
    pub entity_id: EntityIdSpec,

    /// State to match (can be single or list)
    pub state: StateMatch,

    /// Attribute to check instead of state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Treat `state` as regular expressions
    #[serde(default)]
    pub match_regex: bool,
}

/// Numeric state condition - check numeric thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericStateCondition {
    /// Entity IDs to check; all must be in range
    pub entity_id: EntityIdSpec,

    /// Attribute to check (uses state if not set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Value must be above this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<NumericValue>,

    /// Value must be below this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<NumericValue>,
}

/// Time condition - check current UTC time of day and weekday
///
/// When `after` is later than `before` the window wraps midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<NaiveTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<NaiveTime>,

    /// Only on these weekdays
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekday: Vec<WeekdaySpec>,
}

/// Trigger condition - check which trigger fired
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Trigger ID(s) to match
    pub id: StateMatch,
}

/// AND condition - all must be true
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndCondition {
    pub conditions: Vec<Condition>,
}

/// OR condition - any must be true
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrCondition {
    pub conditions: Vec<Condition>,
}

/// NOT condition - none may be true
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotCondition {
    pub conditions: Vec<Condition>,
}

// --- Supporting types ---

/// Numeric value (literal or entity reference)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericValue {
    Literal(f64),
    Entity(String),
}

/// Weekday specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekdaySpec {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<WeekdaySpec> for Weekday {
    fn from(w: WeekdaySpec) -> Self {
        match w {
            WeekdaySpec::Mon => Weekday::Mon,
            WeekdaySpec::Tue => Weekday::Tue,
            WeekdaySpec::Wed => Weekday::Wed,
            WeekdaySpec::Thu => Weekday::Thu,
            WeekdaySpec::Fri => Weekday::Fri,
            WeekdaySpec::Sat => Weekday::Sat,
            WeekdaySpec::Sun => Weekday::Sun,
        }
    }
}

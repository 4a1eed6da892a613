//! Condition evaluation logic
//!
//! Evaluates conditions against the current contents of the state store and
//! the hub clock. Evaluation never writes anything.

use chrono::{Datelike, NaiveTime};
use hub_core::{SharedClock, State};
use hub_state_store::StateStore;
use regex::Regex;
use std::sync::Arc;
use tracing::trace;

use crate::condition::{
    Condition, ConditionError, ConditionResult, NumericStateCondition, NumericValue,
    StateCondition, TimeCondition, TriggerCondition,
};
use crate::trigger::{StateMatch, TriggerData};
use crate::trigger_eval::json_value_to_string;

/// Context for condition evaluation
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// The trigger that fired (if any)
    pub trigger: Option<TriggerData>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger(trigger: TriggerData) -> Self {
        Self {
            trigger: Some(trigger),
        }
    }
}

/// Condition evaluator
pub struct ConditionEvaluator {
    store: Arc<StateStore>,
    clock: SharedClock,
}

impl ConditionEvaluator {
    pub fn new(store: Arc<StateStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Evaluate a condition
    ///
    /// A reference to an entity the store does not know is an error, not a
    /// failed check.
    pub fn evaluate(&self, condition: &Condition, ctx: &EvalContext) -> ConditionResult<bool> {
        match condition {
            Condition::State(c) => self.eval_state(c),
            Condition::NumericState(c) => self.eval_numeric_state(c),
            Condition::Time(c) => Ok(self.eval_time(c)),
            Condition::Trigger(c) => Ok(eval_trigger(c, ctx)),
            Condition::And(c) => self.evaluate_all(&c.conditions, ctx),
            Condition::Or(c) => {
                for condition in &c.conditions {
                    if self.evaluate(condition, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(c) => {
                for condition in &c.conditions {
                    if self.evaluate(condition, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Evaluate multiple conditions (all must pass; empty passes)
    pub fn evaluate_all(&self, conditions: &[Condition], ctx: &EvalContext) -> ConditionResult<bool> {
        for condition in conditions {
            if !self.evaluate(condition, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn lookup(&self, entity_id: &str) -> ConditionResult<Arc<State>> {
        self.store
            .get(entity_id)
            .ok_or_else(|| ConditionError::EntityNotFound(entity_id.to_string()))
    }

    /// State string, or the named attribute rendered as a string
    fn value_of(&self, entity_id: &str, attribute: Option<&str>) -> ConditionResult<Option<String>> {
        let state = self.lookup(entity_id)?;
        Ok(match attribute {
            Some(attr) => state.attributes.get(attr).map(json_value_to_string),
            None => Some(state.state.clone()),
        })
    }

    fn eval_state(&self, condition: &StateCondition) -> ConditionResult<bool> {
        for entity_id in condition.entity_id.ids() {
            let Some(value) = self.value_of(entity_id, condition.attribute.as_deref())? else {
                trace!(entity_id, "Attribute missing");
                return Ok(false);
            };

            let matches = if condition.match_regex {
                matches_regex(&value, &condition.state)?
            } else {
                condition.state.matches(&value)
            };

            trace!(entity_id, value = %value, matches, "State check result");
            if !matches {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn eval_numeric_state(&self, condition: &NumericStateCondition) -> ConditionResult<bool> {
        let above = condition
            .above
            .as_ref()
            .map(|v| self.resolve_numeric_value(v))
            .transpose()?;
        let below = condition
            .below
            .as_ref()
            .map(|v| self.resolve_numeric_value(v))
            .transpose()?;

        for entity_id in condition.entity_id.ids() {
            let Some(raw) = self.value_of(entity_id, condition.attribute.as_deref())? else {
                return Ok(false);
            };
            // Non-numeric states such as "unavailable" simply fail the check
            let Ok(value) = raw.parse::<f64>() else {
                trace!(entity_id, raw = %raw, "Value is not numeric");
                return Ok(false);
            };

            if above.map(|threshold| value <= threshold).unwrap_or(false) {
                return Ok(false);
            }
            if below.map(|threshold| value >= threshold).unwrap_or(false) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn eval_time(&self, condition: &TimeCondition) -> bool {
        let now = self.clock.now();
        let current = now.time();

        if !condition.weekday.is_empty()
            && !condition
                .weekday
                .iter()
                .any(|w| chrono::Weekday::from(*w) == now.weekday())
        {
            return false;
        }

        in_window(current, condition.after, condition.before)
    }

    fn resolve_numeric_value(&self, value: &NumericValue) -> ConditionResult<f64> {
        match value {
            NumericValue::Literal(n) => Ok(*n),
            NumericValue::Entity(entity_id) => {
                let state = self.lookup(entity_id)?;
                state.state.parse().map_err(|_| {
                    ConditionError::InvalidState(format!("'{}' is not a number", state.state))
                })
            }
        }
    }
}

fn eval_trigger(condition: &TriggerCondition, ctx: &EvalContext) -> bool {
    ctx.trigger
        .as_ref()
        .and_then(|t| t.id.as_deref())
        .map(|id| condition.id.matches(id))
        .unwrap_or(false)
}

fn in_window(current: NaiveTime, after: Option<NaiveTime>, before: Option<NaiveTime>) -> bool {
    match (after, before) {
        (Some(after), Some(before)) if after > before => current >= after || current < before,
        (after, before) => {
            after.map(|a| current >= a).unwrap_or(true) && before.map(|b| current < b).unwrap_or(true)
        }
    }
}

fn matches_regex(value: &str, pattern: &StateMatch) -> ConditionResult<bool> {
    for pattern in pattern.values() {
        let re = Regex::new(pattern)
            .map_err(|e| ConditionError::InvalidConfig(format!("Invalid regex: {}", e)))?;
        if re.is_match(value) {
            return Ok(true);
        }
    }
    Ok(false)
}

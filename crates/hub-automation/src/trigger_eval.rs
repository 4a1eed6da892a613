//! Trigger evaluation and matching logic
//!
//! Matches bus events against event-driven triggers and builds the
//! [`TriggerData`] handed to conditions and actions.

use chrono::{DateTime, Utc};
use hub_core::events::{StateChangedData, STATE_CHANGED};
use hub_core::Event;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::trigger::{EventTrigger, StateTrigger, Trigger, TriggerData, TriggerError, TriggerResult};

/// Evaluate a trigger against an event
///
/// Returns `Some(TriggerData)` if the trigger matched. Time-based triggers
/// never match events.
pub fn evaluate(trigger: &Trigger, event: &Event) -> TriggerResult<Option<TriggerData>> {
    let data = match trigger {
        Trigger::State(t) => eval_state_trigger(t, event)?,
        Trigger::Event(t) => eval_event_trigger(t, event),
        Trigger::Time(_) | Trigger::TimePattern(_) | Trigger::Interval(_) => None,
    };

    Ok(data.map(|data| data.caused_by(&event.context)))
}

/// Trigger data for a scheduler firing of a time-based trigger
pub fn time_trigger_data(trigger: &Trigger, now: DateTime<Utc>) -> TriggerData {
    let mut data = TriggerData::new(trigger.platform(), now).with_var("now", json!(now));
    if let Some(id) = trigger.id() {
        data = data.with_id(id);
    }
    data
}

fn eval_state_trigger(trigger: &StateTrigger, event: &Event) -> TriggerResult<Option<TriggerData>> {
    if event.event_type.as_str() != STATE_CHANGED {
        return Ok(None);
    }

    let state_data: StateChangedData = serde_json::from_value(event.data.clone())
        .map_err(|e| TriggerError::InvalidEventData(e.to_string()))?;

    let entity_id = state_data.entity_id.to_string();
    if !trigger.entity_id.contains(&entity_id) {
        return Ok(None);
    }

    let (old_value, new_value) = match &trigger.attribute {
        Some(attr) => (
            state_data
                .old_state
                .as_ref()
                .and_then(|s| s.attributes.get(attr))
                .map(json_value_to_string),
            state_data
                .new_state
                .as_ref()
                .and_then(|s| s.attributes.get(attr))
                .map(json_value_to_string),
        ),
        None => (
            state_data.old_state.as_ref().map(|s| s.state.clone()),
            state_data.new_state.as_ref().map(|s| s.state.clone()),
        ),
    };

    trace!(entity_id = %entity_id, ?old_value, ?new_value, "Evaluating state trigger");

    if let Some(old) = &old_value {
        if trigger.not_from.contains(old) {
            return Ok(None);
        }
    }
    if let Some(new) = &new_value {
        if trigger.not_to.contains(new) {
            return Ok(None);
        }
    }

    if let Some(from) = &trigger.from {
        if !old_value.as_deref().map(|v| from.matches(v)).unwrap_or(false) {
            return Ok(None);
        }
    }
    if let Some(to) = &trigger.to {
        if !new_value.as_deref().map(|v| to.matches(v)).unwrap_or(false) {
            return Ok(None);
        }
    }

    let changed = if trigger.from.is_none() && trigger.to.is_none() && trigger.attribute.is_none() {
        // Any state or attribute change; a rewrite with identical values is not one
        state_data.old_state != state_data.new_state
    } else {
        old_value != new_value
    };
    if !changed {
        trace!("No actual change");
        return Ok(None);
    }

    let mut data = TriggerData::new("state", event.time_fired)
        .with_var("entity_id", json!(entity_id))
        .with_var("from_state", serde_json::to_value(&state_data.old_state).unwrap_or_default())
        .with_var("to_state", serde_json::to_value(&state_data.new_state).unwrap_or_default());

    if let Some(id) = &trigger.id {
        data = data.with_id(id);
    }
    if let Some(attr) = &trigger.attribute {
        data = data.with_var("attribute", json!(attr));
    }

    debug!(entity_id = %entity_id, "State trigger matched");
    Ok(Some(data))
}

fn eval_event_trigger(trigger: &EventTrigger, event: &Event) -> Option<TriggerData> {
    if event.event_type.as_str() != trigger.event_type {
        return None;
    }

    if let Some(expected) = &trigger.event_data {
        if !json_matches(&event.data, expected) {
            trace!("Event data doesn't match");
            return None;
        }
    }

    if let Some(user_id) = &trigger.user_id {
        if event.context.user_id.as_deref() != Some(user_id.as_str()) {
            return None;
        }
    }

    let mut data = TriggerData::new("event", event.time_fired)
        .with_var("event_type", json!(trigger.event_type))
        .with_var("event", event.data.clone());

    if let Some(id) = &trigger.id {
        data = data.with_id(id);
    }

    debug!(event_type = %trigger.event_type, "Event trigger matched");
    Some(data)
}

/// Render an attribute value the way it would appear as a state string
pub(crate) fn json_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Check if actual JSON matches expected pattern
///
/// Objects match when every expected key matches; other values must be equal.
fn json_matches(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual_obj), Value::Object(expected_obj)) => {
            expected_obj.iter().all(|(key, expected_val)| {
                actual_obj
                    .get(key)
                    .map(|actual_val| json_matches(actual_val, expected_val))
                    .unwrap_or(false)
            })
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{EntityIdSpec, StateMatch};
    use chrono::TimeZone;
    use hub_core::{Attributes, Context, EntityId, State};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()
    }

    fn state(entity_id: &str, value: &str, attrs: Value) -> State {
        let id: EntityId = entity_id.parse().unwrap();
        let attrs: Attributes = serde_json::from_value(attrs).unwrap();
        State::new(id, value, attrs, Context::new(), t0())
    }

    fn state_changed(entity_id: &str, old: Option<State>, new: Option<State>) -> Event {
        Event::typed(
            StateChangedData {
                entity_id: entity_id.parse().unwrap(),
                old_state: old,
                new_state: new,
            },
            Context::with_user("admin"),
        )
        .into_json()
    }

    fn state_trigger(from: Option<&str>, to: Option<&str>) -> Trigger {
        Trigger::State(StateTrigger {
            id: Some("presence".to_string()),
            entity_id: EntityIdSpec::Single("device_tracker.phone".to_string()),
            from: from.map(|s| StateMatch::Single(s.to_string())),
            to: to.map(|s| StateMatch::Single(s.to_string())),
            attribute: None,
            not_from: vec![],
            not_to: vec![],
        })
    }

    #[test]
    fn test_state_trigger_from_to() {
        let event = state_changed(
            "device_tracker.phone",
            Some(state("device_tracker.phone", "not_home", json!({}))),
            Some(state("device_tracker.phone", "home", json!({}))),
        );

        let data = evaluate(&state_trigger(Some("not_home"), Some("home")), &event)
            .unwrap()
            .unwrap();
        assert_eq!(data.id.as_deref(), Some("presence"));
        assert_eq!(data.variables["entity_id"], "device_tracker.phone");
        assert_eq!(data.variables["to_state"]["state"], "home");
        assert_eq!(
            data.context.parent_id.as_deref(),
            Some(event.context.id.as_str())
        );

        assert!(evaluate(&state_trigger(Some("home"), None), &event).unwrap().is_none());
    }

    #[test]
    fn test_rewrite_with_same_value_does_not_match() {
        let event = state_changed(
            "device_tracker.phone",
            Some(state("device_tracker.phone", "home", json!({}))),
            Some(state("device_tracker.phone", "home", json!({}))),
        );

        assert!(evaluate(&state_trigger(None, Some("home")), &event).unwrap().is_none());
        assert!(evaluate(&state_trigger(None, None), &event).unwrap().is_none());
    }

    #[test]
    fn test_any_change_includes_attributes() {
        let event = state_changed(
            "device_tracker.phone",
            Some(state("device_tracker.phone", "home", json!({"battery": 50}))),
            Some(state("device_tracker.phone", "home", json!({"battery": 49}))),
        );

        assert!(evaluate(&state_trigger(None, None), &event).unwrap().is_some());
    }

    #[test]
    fn test_attribute_trigger_and_filters() {
        let trigger = Trigger::State(StateTrigger {
            id: None,
            entity_id: EntityIdSpec::List(vec!["light.desk".to_string()]),
            from: None,
            to: Some(StateMatch::List(vec!["100".to_string(), "255".to_string()])),
            attribute: Some("brightness".to_string()),
            not_from: vec!["0".to_string()],
            not_to: vec![],
        });

        let up = state_changed(
            "light.desk",
            Some(state("light.desk", "on", json!({"brightness": 10}))),
            Some(state("light.desk", "on", json!({"brightness": 255}))),
        );
        assert!(evaluate(&trigger, &up).unwrap().is_some());

        let from_off = state_changed(
            "light.desk",
            Some(state("light.desk", "on", json!({"brightness": 0}))),
            Some(state("light.desk", "on", json!({"brightness": 100}))),
        );
        assert!(evaluate(&trigger, &from_off).unwrap().is_none());

        let other_entity = state_changed(
            "light.porch",
            None,
            Some(state("light.porch", "on", json!({"brightness": 255}))),
        );
        assert!(evaluate(&trigger, &other_entity).unwrap().is_none());
    }

    #[test]
    fn test_event_trigger_data_subset() {
        let trigger = Trigger::Event(EventTrigger {
            id: None,
            event_type: "button_pressed".to_string(),
            event_data: Some(json!({"button": "a"})),
            user_id: Some("admin".to_string()),
        });

        let matching = Event::new(
            "button_pressed",
            json!({"button": "a", "count": 2}),
            Context::with_user("admin"),
        );
        let data = evaluate(&trigger, &matching).unwrap().unwrap();
        assert_eq!(data.platform, "event");
        assert_eq!(data.variables["event"]["count"], 2);

        let wrong_button = Event::new("button_pressed", json!({"button": "b"}), Context::with_user("admin"));
        assert!(evaluate(&trigger, &wrong_button).unwrap().is_none());

        let wrong_user = Event::new("button_pressed", json!({"button": "a"}), Context::new());
        assert!(evaluate(&trigger, &wrong_user).unwrap().is_none());
    }

    #[test]
    fn test_malformed_state_changed_is_an_error() {
        let event = Event::new(STATE_CHANGED, json!({"nope": 1}), Context::new());
        assert!(matches!(
            evaluate(&state_trigger(None, None), &event),
            Err(TriggerError::InvalidEventData(_))
        ));
    }

    #[test]
    fn test_time_trigger_data() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"trigger": "time", "id": "wake", "at": "06:30:00"}"#).unwrap();
        let data = time_trigger_data(&trigger, t0());

        assert_eq!(data.platform, "time");
        assert_eq!(data.id.as_deref(), Some("wake"));
        assert_eq!(data.triggered_at, t0());
    }
}

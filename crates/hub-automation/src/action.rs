//! Automation actions
//!
//! The engine treats actions as opaque callables. Automations loaded from
//! configuration get an action that fires `call_service` events for each of
//! their configured service calls.

use hub_core::events::CallServiceData;
use hub_event_bus::EventBus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::automation::{AutomationError, AutomationResult};
use crate::trigger::TriggerData;

/// Callable run when an automation's trigger and conditions hold
pub type Action = Arc<dyn Fn(&TriggerData) -> anyhow::Result<()> + Send + Sync>;

/// One service call, written as `domain.service`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl ServiceCall {
    /// Split `light.turn_on` into `("light", "turn_on")`
    pub fn parse(&self) -> AutomationResult<(&str, &str)> {
        match self.service.split_once('.') {
            Some((domain, service)) if !domain.is_empty() && !service.is_empty() => {
                Ok((domain, service))
            }
            _ => Err(AutomationError::InvalidConfig(format!(
                "service '{}' must be written as domain.service",
                self.service
            ))),
        }
    }

    fn to_event_data(&self) -> AutomationResult<CallServiceData> {
        let (domain, service) = self.parse()?;
        Ok(CallServiceData {
            domain: domain.to_string(),
            service: service.to_string(),
            service_data: self.data.clone(),
        })
    }
}

/// An action firing one `call_service` event per call, under the trigger's
/// context
pub fn service_call_action(
    event_bus: Arc<EventBus>,
    calls: Vec<ServiceCall>,
) -> AutomationResult<Action> {
    let events = calls
        .iter()
        .map(ServiceCall::to_event_data)
        .collect::<AutomationResult<Vec<_>>>()?;

    Ok(Arc::new(move |trigger: &TriggerData| {
        for data in &events {
            debug!(domain = %data.domain, service = %data.service, "Calling service");
            event_bus.fire_typed(data.clone(), trigger.context.clone());
        }
        Ok(())
    }))
}

/// An action that does nothing
pub fn noop_action() -> Action {
    Arc::new(|_: &TriggerData| Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hub_core::events::CALL_SERVICE;
    use hub_core::{Context, Event, ManualClock};
    use hub_worker_pool::WorkerPool;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_service_call_parse() {
        let call = ServiceCall {
            service: "light.turn_on".to_string(),
            data: json!({}),
        };
        assert_eq!(call.parse().unwrap(), ("light", "turn_on"));

        let bad = ServiceCall {
            service: "turn_on".to_string(),
            data: json!({}),
        };
        assert!(matches!(bad.parse(), Err(AutomationError::InvalidConfig(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_call_action_fires_events() {
        let pool = WorkerPool::new(1);
        let bus = Arc::new(EventBus::new(pool.clone(), Arc::new(ManualClock::at(Utc::now()))));

        let seen: Arc<Mutex<Vec<Event<CallServiceData>>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let _sub = bus.listen_typed::<CallServiceData, _>(move |event| {
            recorded.lock().unwrap().push(event.clone());
            Ok(())
        });

        let action = service_call_action(
            bus.clone(),
            vec![
                ServiceCall {
                    service: "light.turn_on".to_string(),
                    data: json!({"entity_id": "light.hall"}),
                },
                ServiceCall {
                    service: "notify.phone".to_string(),
                    data: serde_json::Value::Null,
                },
            ],
        )
        .unwrap();

        let trigger = TriggerData::new("manual", Utc::now()).caused_by(&Context::with_user("admin"));
        action(&trigger).unwrap();
        pool.drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_type.as_str(), CALL_SERVICE);
        assert_eq!(seen[0].data.domain, "light");
        assert_eq!(seen[0].data.service_data["entity_id"], "light.hall");
        assert_eq!(seen[1].data.service, "phone");
        assert_eq!(seen[0].context, trigger.context);
    }
}

//! Core types for the home hub
//!
//! This crate provides the vocabulary shared by every other crate: entity
//! ids, immutable state snapshots, events, causality contexts, the clock
//! abstraction and the hub-wide error taxonomy.

mod clock;
mod context;
pub mod duration;
mod entity_id;
mod error;
mod event;
mod state;
pub mod util;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use error::{HubError, HubResult};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use state::{Attributes, State};

/// Event type that subscribes to every event
pub const MATCH_ALL: &str = "*";

/// Presence state of a tracked device that was seen recently
pub const STATE_HOME: &str = "home";

/// Presence state of a tracked device that has not been seen
pub const STATE_NOT_HOME: &str = "not_home";

/// Standard event types fired by the hub
pub mod events {
    use super::*;
    use chrono::{DateTime, Utc};

    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired by the scheduler once per tick
    pub const TIME_CHANGED: &str = "time_changed";

    pub const CALL_SERVICE: &str = "call_service";

    pub const AUTOMATION_TRIGGERED: &str = "automation_triggered";

    pub const HUB_START: &str = "hub_start";

    pub const HUB_STOP: &str = "hub_stop";

    /// Data for STATE_CHANGED events
    ///
    /// `old_state` is `None` the first time an entity is written and
    /// `new_state` is `None` when it is removed.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct TimeChangedData {
        pub now: DateTime<Utc>,
    }

    impl EventData for TimeChangedData {
        fn event_type() -> &'static str {
            TIME_CHANGED
        }
    }

    /// Data for CALL_SERVICE events
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        #[serde(default)]
        pub service_data: serde_json::Value,
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct AutomationTriggeredData {
        pub automation_id: String,
        pub name: String,
    }

    impl EventData for AutomationTriggeredData {
        fn event_type() -> &'static str {
            AUTOMATION_TRIGGERED
        }
    }
}

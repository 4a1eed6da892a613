//! Automation Engine
//!
//! Automations are rules that run an action when one of their triggers
//! fires and all of their conditions hold.
//!
//! ```text
//! AUTOMATION = TRIGGER → CONDITIONS → ACTION
//! ```
//!
//! - **Triggers**: state changes, bus events, and time (daily, pattern, interval)
//! - **Conditions**: checks over the state store and the clock at run time
//! - **Actions**: opaque callables, or `call_service` events from config
//!
//! # Key Types
//!
//! - [`Trigger`] - Event that starts an automation
//! - [`Condition`] - State check that must pass
//! - [`Automation`] - Complete automation definition
//! - [`AutomationEngine`] - Wires automations to the bus, scheduler and pool

pub mod action;
pub mod automation;
pub mod condition;
pub mod engine;
pub mod eval;
pub mod trigger;
pub mod trigger_eval;

pub use action::{noop_action, service_call_action, Action, ServiceCall};
pub use automation::{
    Automation, AutomationConfig, AutomationError, AutomationManager, AutomationResult,
    ExecutionMode, ModeName, RunOutcome,
};
pub use condition::{Condition, ConditionError, ConditionResult};
pub use engine::AutomationEngine;
pub use eval::{ConditionEvaluator, EvalContext};
pub use trigger::{Trigger, TriggerData, TriggerError, TriggerResult};

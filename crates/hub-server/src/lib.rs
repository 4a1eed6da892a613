//! Home hub server
//!
//! Configuration loading and the [`Hub`] context object that wires the
//! worker pool, event bus, state store, scheduler, device tracker and
//! automation engine together.

mod config;
mod hub;

pub use config::{ConfigError, ConfigResult, HubConfig};
pub use hub::{ComponentStatus, Hub};

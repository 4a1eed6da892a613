//! Automation management
//!
//! An automation ties together triggers, conditions, and an action.
//! The AutomationManager handles the lifecycle of all automations.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hub_core::HubError;
use hub_worker_pool::PoolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::action::{Action, ServiceCall};
use crate::condition::Condition;
use crate::trigger::Trigger;

/// Automation errors
#[derive(Debug, Error, PartialEq)]
pub enum AutomationError {
    #[error("Automation not found: {0}")]
    NotFound(String),

    #[error("Invalid automation configuration: {0}")]
    InvalidConfig(String),

    #[error("Automation already exists: {0}")]
    AlreadyExists(String),

    #[error("Automation is disabled: {0}")]
    Disabled(String),

    #[error("Cannot run automation: {0}")]
    Pool(#[from] PoolError),
}

/// Result type for automation operations
pub type AutomationResult<T> = Result<T, AutomationError>;

impl From<AutomationError> for HubError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::InvalidConfig(_) | AutomationError::AlreadyExists(_) => {
                HubError::Configuration(err.to_string())
            }
            other => HubError::InvariantViolation(other.to_string()),
        }
    }
}

/// Execution mode for automations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Default - ignore new triggers while running
    #[default]
    Single,

    /// Run simultaneously (up to max)
    Parallel { max: usize },
}

/// Mode name as written in configuration; `max` sits next to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModeName {
    #[default]
    Single,
    Parallel,
}

fn default_max_parallel() -> usize {
    10
}

/// Automation configuration from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Unique ID (optional, auto-generated if not provided)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Triggers that start the automation
    #[serde(default, alias = "trigger")]
    pub triggers: Vec<Trigger>,

    /// Conditions that must be met
    #[serde(default, alias = "condition")]
    pub conditions: Vec<Condition>,

    /// Service calls fired when loaded through the engine's config path
    #[serde(default, alias = "action")]
    pub actions: Vec<ServiceCall>,

    #[serde(default)]
    pub mode: ModeName,

    /// Maximum concurrent runs in parallel mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,

    /// Whether the automation is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AutomationConfig {
    /// Resolve `mode` and `max` into the runtime mode
    pub fn execution_mode(&self) -> ExecutionMode {
        match self.mode {
            ModeName::Single => ExecutionMode::Single,
            ModeName::Parallel => ExecutionMode::Parallel {
                max: self.max.unwrap_or_else(default_max_parallel),
            },
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The action ran and returned Ok
    Completed,
    /// Conditions did not pass
    Skipped,
    /// Conditions or the action failed
    Failed(String),
}

/// A registered automation
#[derive(Clone)]
pub struct Automation {
    /// Unique identifier
    pub id: String,

    pub alias: Option<String>,

    pub description: Option<String>,

    pub triggers: Vec<Trigger>,

    pub conditions: Vec<Condition>,

    pub action: Action,

    pub mode: ExecutionMode,

    pub enabled: bool,

    /// When the action last completed
    pub last_triggered: Option<DateTime<Utc>>,

    /// Message of the most recent failed run
    pub last_error: Option<String>,

    /// Runs accepted and not yet finished
    pub current_runs: usize,
}

impl fmt::Debug for Automation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Automation")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("triggers", &self.triggers)
            .field("conditions", &self.conditions)
            .field("mode", &self.mode)
            .field("enabled", &self.enabled)
            .field("last_triggered", &self.last_triggered)
            .field("last_error", &self.last_error)
            .field("current_runs", &self.current_runs)
            .finish_non_exhaustive()
    }
}

impl Automation {
    /// Create from config
    pub fn from_config(config: AutomationConfig, action: Action) -> Self {
        let mode = config.execution_mode();
        let id = config.id.unwrap_or_else(|| ulid::Ulid::new().to_string());

        Self {
            id,
            alias: config.alias,
            description: config.description,
            triggers: config.triggers,
            conditions: config.conditions,
            action,
            mode,
            enabled: config.enabled,
            last_triggered: None,
            last_error: None,
            current_runs: 0,
        }
    }

    /// Get display name (alias or ID)
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    /// Reject triggers and conditions that could never work
    pub fn validate(&self) -> AutomationResult<()> {
        if self.id.trim().is_empty() {
            return Err(AutomationError::InvalidConfig("id must not be empty".to_string()));
        }
        if let ExecutionMode::Parallel { max: 0 } = self.mode {
            return Err(AutomationError::InvalidConfig(
                "parallel mode needs max of at least 1".to_string(),
            ));
        }
        for trigger in &self.triggers {
            trigger
                .validate()
                .map_err(|e| AutomationError::InvalidConfig(format!("{}: {}", self.id, e)))?;
        }
        for condition in &self.conditions {
            condition
                .validate()
                .map_err(|e| AutomationError::InvalidConfig(format!("{}: {}", self.id, e)))?;
        }
        Ok(())
    }

    /// Check if a new run fits the execution mode
    pub fn can_run(&self) -> bool {
        if !self.enabled {
            return false;
        }

        match self.mode {
            ExecutionMode::Single => self.current_runs == 0,
            ExecutionMode::Parallel { max } => self.current_runs < max,
        }
    }
}

/// Manages all automations
pub struct AutomationManager {
    automations: DashMap<String, Automation>,
}

impl AutomationManager {
    pub fn new() -> Self {
        Self {
            automations: DashMap::new(),
        }
    }

    /// Validate and register an automation
    pub fn add(&self, automation: Automation) -> AutomationResult<String> {
        automation.validate()?;

        match self.automations.entry(automation.id.clone()) {
            Entry::Occupied(_) => Err(AutomationError::AlreadyExists(automation.id)),
            Entry::Vacant(slot) => {
                info!(
                    "Added automation: {} ({})",
                    automation.display_name(),
                    automation.id
                );
                let id = automation.id.clone();
                slot.insert(automation);
                Ok(id)
            }
        }
    }

    /// Get an automation by ID
    pub fn get(&self, id: &str) -> Option<Automation> {
        self.automations.get(id).map(|a| a.value().clone())
    }

    /// All automations, ordered by id
    pub fn all(&self) -> Vec<Automation> {
        let mut all: Vec<Automation> = self.automations.iter().map(|a| a.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn count(&self) -> usize {
        self.automations.len()
    }

    /// Visit every enabled automation in place
    ///
    /// Map shards stay read-locked while `f` runs, so `f` must not call
    /// back into the manager.
    pub fn for_each_enabled(&self, mut f: impl FnMut(&Automation)) {
        for entry in self.automations.iter() {
            if entry.enabled {
                f(entry.value());
            }
        }
    }

    pub fn enable(&self, id: &str) -> AutomationResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> AutomationResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> AutomationResult<()> {
        let mut automation = self
            .automations
            .get_mut(id)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;

        automation.enabled = enabled;
        info!(
            "{} automation: {}",
            if enabled { "Enabled" } else { "Disabled" },
            automation.display_name()
        );
        Ok(())
    }

    pub fn remove(&self, id: &str) -> AutomationResult<Automation> {
        self.automations
            .remove(id)
            .map(|(_, a)| a)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))
    }

    /// Reserve a run slot
    ///
    /// Returns a snapshot of the automation when the run was accepted and
    /// `None` when the execution mode is at capacity.
    pub fn try_begin_run(&self, id: &str) -> AutomationResult<Option<Automation>> {
        let mut automation = self
            .automations
            .get_mut(id)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;

        if !automation.enabled {
            return Err(AutomationError::Disabled(id.to_string()));
        }
        if !automation.can_run() {
            debug!(
                automation_id = %id,
                mode = ?automation.mode,
                current_runs = automation.current_runs,
                "Dropping trigger, execution mode at capacity"
            );
            return Ok(None);
        }

        automation.current_runs += 1;
        Ok(Some(automation.clone()))
    }

    /// Release a run slot and record its outcome
    pub fn finish_run(&self, id: &str, outcome: RunOutcome, now: DateTime<Utc>) {
        let Some(mut automation) = self.automations.get_mut(id) else {
            // Removed while running
            return;
        };

        automation.current_runs = automation.current_runs.saturating_sub(1);
        match outcome {
            RunOutcome::Completed => {
                automation.last_triggered = Some(now);
                automation.last_error = None;
            }
            RunOutcome::Skipped => {}
            RunOutcome::Failed(message) => automation.last_error = Some(message),
        }
        debug!(
            "Automation {} runs: {}",
            automation.display_name(),
            automation.current_runs
        );
    }
}

impl Default for AutomationManager {
    fn default() -> Self {
        Self::new()
    }
}

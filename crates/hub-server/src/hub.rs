//! The hub context object
//!
//! Owns one instance of every component and wires them together. There are
//! no globals: tests build as many hubs as they like, each with its own
//! clock.

use hub_automation::AutomationEngine;
use hub_core::events::{HUB_START, HUB_STOP};
use hub_core::{Context, HubResult, SharedClock};
use hub_device_tracker::{DeviceScanner, DeviceTracker};
use hub_event_bus::EventBus;
use hub_scheduler::{ScheduleHandle, Scheduler};
use hub_state_store::StateStore;
use hub_worker_pool::WorkerPool;
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::HubConfig;

/// Startup result of one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentStatus {
    pub component: String,
    pub initialized: bool,
}

impl ComponentStatus {
    fn new(component: &str, initialized: bool) -> Self {
        Self {
            component: component.to_string(),
            initialized,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.initialized {
            "initialized"
        } else {
            "Failed to initialize"
        };
        write!(f, "{}: {}", self.component, outcome)
    }
}

/// A running home hub
pub struct Hub {
    clock: SharedClock,
    pool: Arc<WorkerPool>,
    bus: Arc<EventBus>,
    states: Arc<StateStore>,
    scheduler: Arc<Scheduler>,
    device_tracker: Option<Arc<DeviceTracker>>,
    automations: AutomationEngine,
    status: Vec<ComponentStatus>,
    scan_handle: Mutex<Option<ScheduleHandle>>,
}

impl Hub {
    /// Build every component from `config`
    ///
    /// Must be called inside a tokio runtime. A component that fails to set
    /// up is reported in [`Hub::status`] and left out; the rest of the hub
    /// still comes up. The device tracker is only set up when a scanner is
    /// given.
    pub fn new(
        config: &HubConfig,
        clock: SharedClock,
        scanner: Option<Arc<dyn DeviceScanner>>,
    ) -> Self {
        let pool = WorkerPool::from_config(&config.worker_pool);
        let bus = Arc::new(EventBus::new(pool.clone(), clock.clone()));
        let states = Arc::new(StateStore::new(bus.clone()));
        let scheduler = Arc::new(Scheduler::new(bus.clone(), config.scheduler.clone()));

        let mut status = vec![
            ComponentStatus::new("worker_pool", true),
            ComponentStatus::new("event_bus", true),
            ComponentStatus::new("state_store", true),
            ComponentStatus::new("scheduler", true),
        ];

        let device_tracker = scanner.and_then(|scanner| {
            match DeviceTracker::setup(states.clone(), clock.clone(), scanner, &config.device_tracker) {
                Ok(tracker) => {
                    status.push(ComponentStatus::new("device_tracker", true));
                    Some(tracker)
                }
                Err(e) => {
                    warn!(error = %e, "Device tracker setup failed");
                    status.push(ComponentStatus::new("device_tracker", false));
                    None
                }
            }
        });

        let automations = AutomationEngine::new(states.clone(), scheduler.clone());
        let mut rejected = 0;
        for automation in &config.automations {
            if let Err(e) = automations.add_from_config(automation.clone()) {
                warn!(
                    automation = automation.alias.as_deref().or(automation.id.as_deref()).unwrap_or("unnamed"),
                    error = %e,
                    "Rejected automation"
                );
                rejected += 1;
            }
        }
        status.push(ComponentStatus::new("automation", rejected == 0));

        for line in &status {
            info!("{}", line);
        }

        Self {
            clock,
            pool,
            bus,
            states,
            scheduler,
            device_tracker,
            automations,
            status,
            scan_handle: Mutex::new(None),
        }
    }

    /// Start the tick loop, presence scans and automations, then fire
    /// `hub_start`
    pub fn start(&self) -> HubResult<()> {
        info!("Starting hub");
        self.scheduler.start()?;

        if let Some(tracker) = &self.device_tracker {
            let handle = tracker.start(&self.scheduler)?;
            *self.scan_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        self.automations.start()?;
        self.bus.fire_event(HUB_START, json!({}), Context::new());
        Ok(())
    }

    /// Fire `hub_stop`, stop producing work and let queued work finish
    pub async fn stop(&self) {
        info!("Stopping hub");
        self.bus.fire_event(HUB_STOP, json!({}), Context::new());

        self.automations.stop();
        if let Some(handle) = self.scan_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.cancel();
        }
        self.scheduler.stop().await;
        self.pool.shutdown().await;
        info!("Hub stopped");
    }

    /// One entry per component, in startup order
    pub fn status(&self) -> &[ComponentStatus] {
        &self.status
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn device_tracker(&self) -> Option<&Arc<DeviceTracker>> {
        self.device_tracker.as_ref()
    }

    pub fn automations(&self) -> &AutomationEngine {
        &self.automations
    }
}

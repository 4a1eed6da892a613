//! Automation execution engine
//!
//! The `AutomationEngine` drives the trigger→condition→action pipeline. Event
//! triggers are matched inside a bus listener, time triggers are registered
//! with the scheduler, and every accepted run is submitted to the worker
//! pool, so actions never execute on a publisher's call stack.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hub_core::events::AutomationTriggeredData;
use hub_core::{Event, HubError, SharedClock};
use hub_event_bus::{EventBus, Subscription};
use hub_scheduler::{ScheduleHandle, Scheduler, TimePattern};
use hub_state_store::StateStore;
use hub_worker_pool::{Job, JobPriority, WorkerPool};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, trace, warn};

use crate::action::{service_call_action, Action};
use crate::automation::{
    Automation, AutomationConfig, AutomationError, AutomationManager, AutomationResult, RunOutcome,
};
use crate::eval::{ConditionEvaluator, EvalContext};
use crate::trigger::{Trigger, TriggerData};
use crate::trigger_eval;

struct EngineInner {
    manager: AutomationManager,
    event_bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    clock: SharedClock,
    evaluator: ConditionEvaluator,
    running: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
    /// Scheduler handles per automation id
    timers: DashMap<String, Vec<ScheduleHandle>>,
}

/// Automation engine that orchestrates trigger→condition→action flow
#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
}

impl AutomationEngine {
    /// Create an engine over the store's bus and the scheduler's pool
    pub fn new(store: Arc<StateStore>, scheduler: Arc<Scheduler>) -> Self {
        let clock = store.clock().clone();
        let inner = EngineInner {
            manager: AutomationManager::new(),
            event_bus: store.event_bus().clone(),
            pool: scheduler.pool().clone(),
            evaluator: ConditionEvaluator::new(store, clock.clone()),
            clock,
            scheduler,
            running: AtomicBool::new(false),
            subscription: Mutex::new(None),
            timers: DashMap::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Register an automation with an opaque action
    pub fn add(&self, config: AutomationConfig, action: Action) -> AutomationResult<String> {
        let automation = Automation::from_config(config, action);
        let id = self.inner.manager.add(automation)?;

        if self.is_running() {
            if let Err(e) = self.inner.arm_timers(&id) {
                self.inner.manager.remove(&id)?;
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Register an automation whose action fires its configured service calls
    pub fn add_from_config(&self, config: AutomationConfig) -> AutomationResult<String> {
        let action = service_call_action(self.inner.event_bus.clone(), config.actions.clone())?;
        self.add(config, action)
    }

    /// Remove an automation and cancel its timers
    ///
    /// A run already submitted still completes.
    pub fn remove(&self, id: &str) -> AutomationResult<Automation> {
        let automation = self.inner.manager.remove(id)?;
        self.inner.disarm_timers(id);
        Ok(automation)
    }

    pub fn enable(&self, id: &str) -> AutomationResult<()> {
        self.inner.manager.enable(id)
    }

    pub fn disable(&self, id: &str) -> AutomationResult<()> {
        self.inner.manager.disable(id)
    }

    pub fn get(&self, id: &str) -> Option<Automation> {
        self.inner.manager.get(id)
    }

    pub fn all(&self) -> Vec<Automation> {
        self.inner.manager.all()
    }

    /// Manually trigger an automation
    ///
    /// Conditions are still evaluated. Returns whether a run was accepted;
    /// a single-mode automation that is already running drops the request.
    pub fn trigger(&self, id: &str) -> AutomationResult<bool> {
        let data = TriggerData::new("manual", self.inner.clock.now());
        self.inner.dispatch(id, data)
    }

    /// Start listening for events and arm time triggers
    pub fn start(&self) -> AutomationResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Automation engine already running");
            return Ok(());
        }

        info!("Starting automation engine");

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.event_bus.listen_all(move |event: &Event| {
            if let Some(inner) = weak.upgrade() {
                inner.process_event(event);
            }
            Ok(())
        });
        *self.inner.lock_subscription() = Some(subscription);

        for automation in self.inner.manager.all() {
            if let Err(e) = self.inner.arm_timers(&automation.id) {
                warn!(automation_id = %automation.id, error = %e, "Failed to arm time triggers");
            }
        }
        Ok(())
    }

    /// Stop reacting to events and timers; runs already submitted complete
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping automation engine");
        if let Some(subscription) = self.inner.lock_subscription().take() {
            subscription.cancel();
        }
        let ids: Vec<String> = self.inner.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.inner.disarm_timers(&id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of automations
    pub fn count(&self) -> usize {
        self.inner.manager.count()
    }
}

impl EngineInner {
    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<Subscription>> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Match an event against the event-driven triggers of every enabled
    /// automation
    fn process_event(self: &Arc<Self>, event: &Event) {
        trace!(event_type = %event.event_type, "Processing event");

        let mut matched = Vec::new();
        self.manager.for_each_enabled(|automation| {
            for trigger in &automation.triggers {
                match trigger_eval::evaluate(trigger, event) {
                    Ok(Some(data)) => {
                        debug!(
                            automation_id = %automation.id,
                            trigger_platform = %data.platform,
                            "Trigger matched"
                        );
                        matched.push((automation.id.clone(), data));
                        // One run per event, however many triggers match
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            automation_id = %automation.id,
                            error = %e,
                            "Error evaluating trigger"
                        );
                    }
                }
            }
        });

        for (id, data) in matched {
            self.dispatch_logged(&id, data);
        }
    }

    fn dispatch_logged(self: &Arc<Self>, id: &str, data: TriggerData) {
        match self.dispatch(id, data) {
            Ok(_) | Err(AutomationError::Disabled(_)) | Err(AutomationError::NotFound(_)) => {}
            Err(e) => warn!(automation_id = %id, error = %e, "Failed to start automation"),
        }
    }

    /// Reserve a run slot and submit the run to the pool
    fn dispatch(self: &Arc<Self>, id: &str, data: TriggerData) -> AutomationResult<bool> {
        let Some(automation) = self.manager.try_begin_run(id)? else {
            return Ok(false);
        };

        let label = format!("automation {}", automation.id);
        let inner = self.clone();
        let job = Job::new(JobPriority::Default, label, move || {
            inner.run(automation, data);
            Ok(())
        });

        if let Err(e) = self.pool.submit(job) {
            self.manager
                .finish_run(id, RunOutcome::Skipped, self.clock.now());
            return Err(e.into());
        }
        Ok(true)
    }

    /// Evaluate conditions and invoke the action; always releases the slot
    fn run(&self, automation: Automation, data: TriggerData) {
        debug!(automation_id = %automation.id, "Running automation");

        let ctx = EvalContext::with_trigger(data.clone());
        let outcome = match self.evaluator.evaluate_all(&automation.conditions, &ctx) {
            Ok(false) => {
                debug!(automation_id = %automation.id, "Conditions not met");
                RunOutcome::Skipped
            }
            Err(e) => {
                let err = HubError::from(e);
                warn!(automation_id = %automation.id, error = %err, "Error evaluating conditions");
                RunOutcome::Failed(err.to_string())
            }
            Ok(true) => match catch_unwind(AssertUnwindSafe(|| (automation.action)(&data))) {
                Ok(Ok(())) => RunOutcome::Completed,
                Ok(Err(e)) => {
                    warn!(automation_id = %automation.id, error = %e, "Automation action failed");
                    RunOutcome::Failed(format!("{:#}", e))
                }
                Err(_) => {
                    warn!(automation_id = %automation.id, "Automation action panicked");
                    RunOutcome::Failed("action panicked".to_string())
                }
            },
        };

        let completed = outcome == RunOutcome::Completed;
        self.manager
            .finish_run(&automation.id, outcome, self.clock.now());

        if completed {
            info!(automation_id = %automation.id, "Automation triggered");
            self.event_bus.fire_typed(
                AutomationTriggeredData {
                    automation_id: automation.id.clone(),
                    name: automation.display_name().to_string(),
                },
                data.context,
            );
        }
    }

    /// Register the time-based triggers of one automation with the scheduler
    fn arm_timers(self: &Arc<Self>, id: &str) -> AutomationResult<()> {
        let Some(automation) = self.manager.get(id) else {
            return Err(AutomationError::NotFound(id.to_string()));
        };

        let mut handles = Vec::new();
        for trigger in automation.triggers.iter().filter(|t| t.is_time_based()) {
            match self.arm_timer(id, trigger) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    handles.iter().for_each(|h: &ScheduleHandle| {
                        h.cancel();
                    });
                    return Err(e);
                }
            }
        }

        if !handles.is_empty() {
            debug!(automation_id = %id, timers = handles.len(), "Armed time triggers");
            if let Some(previous) = self.timers.insert(id.to_string(), handles) {
                previous.iter().for_each(|h| {
                    h.cancel();
                });
            }
        }
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, id: &str, trigger: &Trigger) -> AutomationResult<ScheduleHandle> {
        let weak = Arc::downgrade(self);
        let automation_id = id.to_string();
        let timer_trigger = trigger.clone();
        let callback = move |now: DateTime<Utc>| -> anyhow::Result<()> {
            if let Some(inner) = weak.upgrade() {
                let data = trigger_eval::time_trigger_data(&timer_trigger, now);
                inner.dispatch_logged(&automation_id, data);
            }
            Ok(())
        };

        let invalid = |e: &dyn std::fmt::Display| AutomationError::InvalidConfig(e.to_string());
        match trigger {
            Trigger::Time(t) => self
                .scheduler
                .track_time_pattern(callback, TimePattern::daily_at(t.at))
                .map_err(|e| invalid(&e)),
            Trigger::TimePattern(t) => {
                let pattern = t.time_pattern().map_err(|e| invalid(&e))?;
                self.scheduler
                    .track_time_pattern(callback, pattern)
                    .map_err(|e| invalid(&e))
            }
            Trigger::Interval(t) => self
                .scheduler
                .track_time_interval(callback, t.every)
                .map_err(|e| invalid(&e)),
            Trigger::State(_) | Trigger::Event(_) => Err(AutomationError::InvalidConfig(
                format!("{} trigger is not time based", trigger.platform()),
            )),
        }
    }

    fn disarm_timers(&self, id: &str) {
        if let Some((_, handles)) = self.timers.remove(id) {
            for handle in handles {
                handle.cancel();
            }
        }
    }
}

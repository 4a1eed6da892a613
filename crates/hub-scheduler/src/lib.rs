//! Time-based job scheduling for the home hub
//!
//! The [`Scheduler`] owns every timer in the hub. A tick loop calls
//! [`Scheduler::tick`] once per `tick_interval`; each tick reads the clock,
//! hands every due firing to the worker pool and fires `time_changed` on
//! the bus. Callbacks never run on the tick loop itself.
//!
//! Three kinds of timer exist:
//! - point in time: fires once, then is forgotten
//! - interval: fires every period, first one period after registration
//! - pattern: fires whenever the UTC wall clock matches a [`TimePattern`]

mod pattern;

pub use pattern::{PatternField, PatternSpec, TimePattern};

use chrono::{DateTime, Utc};
use hub_core::events::TimeChangedData;
use hub_core::{Context, HubError, SharedClock};
use hub_event_bus::EventBus;
use hub_worker_pool::{Job, JobPriority, WorkerPool};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("time pattern needs at least one of hours, minutes or seconds")]
    EmptyPattern,

    #[error("invalid {field} pattern '{value}'")]
    InvalidPattern { field: &'static str, value: String },

    #[error("interval must be at least one second and end within the calendar")]
    InvalidPeriod,

    #[error("tick interval must be greater than zero")]
    InvalidTickInterval,
}

impl From<ScheduleError> for HubError {
    fn from(err: ScheduleError) -> Self {
        HubError::Configuration(err.to_string())
    }
}

/// Callback run on the worker pool, receiving the tick time
pub type ScheduleCallback = Arc<dyn Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync>;

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between ticks
    #[serde(default = "default_tick_interval", with = "hub_core::duration")]
    pub tick_interval: Duration,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.tick_interval.is_zero() {
            return Err(ScheduleError::InvalidTickInterval);
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

#[derive(Debug, Clone)]
enum Schedule {
    PointInTime,
    Interval(chrono::Duration),
    Pattern(TimePattern),
}

struct ScheduledJob {
    id: u64,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
    callback: ScheduleCallback,
    active: Arc<AtomicBool>,
}

impl ScheduledJob {
    fn label(&self) -> String {
        match &self.schedule {
            Schedule::PointInTime => format!("timer {} (once)", self.id),
            Schedule::Interval(period) => format!("timer {} (every {}s)", self.id, period.num_seconds()),
            Schedule::Pattern(pattern) => format!("timer {} ({})", self.id, pattern),
        }
    }

    /// Move `next_fire` past `now`, or return false if the job is done
    fn rearm(&mut self, now: DateTime<Utc>) -> bool {
        match &self.schedule {
            Schedule::PointInTime => false,
            Schedule::Interval(period) => {
                // Skip periods missed while the hub was busy
                let missed = (now - self.next_fire).num_milliseconds() / period.num_milliseconds();
                let next = i32::try_from(missed + 1)
                    .ok()
                    .and_then(|steps| period.checked_mul(steps))
                    .and_then(|step| self.next_fire.checked_add_signed(step));
                match next {
                    Some(next) => {
                        self.next_fire = next;
                        true
                    }
                    None => {
                        warn!(job = self.id, "Interval runs past the end of the calendar");
                        false
                    }
                }
            }
            Schedule::Pattern(pattern) => match pattern.next_after(now) {
                Some(next) => {
                    self.next_fire = next;
                    true
                }
                None => {
                    warn!(job = self.id, "Time pattern has no future firing");
                    false
                }
            },
        }
    }
}

/// Handle to a registered timer
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    id: u64,
    active: Arc<AtomicBool>,
}

impl ScheduleHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Prevent future firings; a firing already handed to the pool still
    /// runs. Returns `true` only for the first call.
    pub fn cancel(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            trace!(job = self.id, "Timer cancelled");
        }
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Owns the hub's timers and the tick loop
pub struct Scheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    next_job_id: AtomicU64,
    event_bus: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    clock: SharedClock,
    config: SchedulerConfig,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tick_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler using the bus's worker pool and clock
    pub fn new(event_bus: Arc<EventBus>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            jobs: Mutex::new(Vec::new()),
            next_job_id: AtomicU64::new(1),
            pool: event_bus.pool().clone(),
            clock: event_bus.clock().clone(),
            event_bus,
            config,
            running: AtomicBool::new(false),
            shutdown_tx,
            tick_loop: Mutex::new(None),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        schedule: Schedule,
        next_fire: DateTime<Utc>,
        callback: ScheduleCallback,
    ) -> ScheduleHandle {
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));

        debug!(job = id, next_fire = %next_fire, "Registering timer");
        self.lock_jobs().push(ScheduledJob {
            id,
            schedule,
            next_fire,
            callback,
            active: active.clone(),
        });

        ScheduleHandle { id, active }
    }

    /// Fire once at `when`; a time already past fires on the next tick
    pub fn track_point_in_time<F>(&self, callback: F, when: DateTime<Utc>) -> ScheduleHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Schedule::PointInTime, when, Arc::new(callback))
    }

    /// Fire every `period`, the first time one period from now
    pub fn track_time_interval<F>(
        &self,
        callback: F,
        period: Duration,
    ) -> Result<ScheduleHandle, ScheduleError>
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if period.as_secs() == 0 {
            return Err(ScheduleError::InvalidPeriod);
        }
        let period = chrono::Duration::from_std(period).map_err(|_| ScheduleError::InvalidPeriod)?;
        let first = self
            .clock
            .now()
            .checked_add_signed(period)
            .ok_or(ScheduleError::InvalidPeriod)?;

        Ok(self.register(Schedule::Interval(period), first, Arc::new(callback)))
    }

    /// Fire whenever the clock matches `pattern`
    pub fn track_time_pattern<F>(
        &self,
        callback: F,
        pattern: TimePattern,
    ) -> Result<ScheduleHandle, ScheduleError>
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let first = pattern
            .next_after(self.clock.now())
            .ok_or(ScheduleError::EmptyPattern)?;

        Ok(self.register(Schedule::Pattern(pattern), first, Arc::new(callback)))
    }

    /// Evaluate timers against the clock once
    ///
    /// Due firings are submitted to the worker pool and `time_changed` is
    /// fired. Returns the number of firings dispatched.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();

        let due: Vec<(String, ScheduleCallback)> = {
            let mut jobs = self.lock_jobs();
            jobs.retain(|job| job.active.load(Ordering::SeqCst));

            let mut due = Vec::new();
            jobs.retain_mut(|job| {
                if job.next_fire > now {
                    return true;
                }
                due.push((job.label(), job.callback.clone()));
                job.rearm(now)
            });
            due
        };

        let dispatched = due.len();
        for (label, callback) in due {
            let job = Job::new(JobPriority::Time, label, move || callback(now));
            if let Err(e) = self.pool.submit(job) {
                warn!(error = %e, "Dropping timer firing");
            }
        }

        if dispatched > 0 {
            trace!(dispatched, now = %now, "Dispatched timers");
        }

        self.event_bus.fire_typed(TimeChangedData { now }, Context::new());
        dispatched
    }

    /// Spawn the tick loop
    ///
    /// Must be called inside a tokio runtime. Calling it while the loop runs
    /// does nothing.
    pub fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        self.config.validate()?;
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return Ok(());
        }

        info!(tick_interval = ?self.config.tick_interval, "Starting scheduler");

        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.tick();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Scheduler tick loop stopped");
        });

        *self.tick_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the tick loop; registered timers are kept
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping scheduler");
        let _ = self.shutdown_tx.send(());

        let handle = self.tick_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of live timers
    pub fn job_count(&self) -> usize {
        self.lock_jobs()
            .iter()
            .filter(|job| job.active.load(Ordering::SeqCst))
            .count()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

/// Thread-safe wrapper for Scheduler
pub type SharedScheduler = Arc<Scheduler>;

//! Publish/subscribe event bus for the home hub
//!
//! The EventBus decouples producers (device scanners, the scheduler, the
//! state store) from consumers (automations, loggers). Listeners register a
//! callback for one event type or for all events (`*`) and get back a
//! [`Subscription`] handle that cancels them.
//!
//! `fire` never runs a callback itself. Each matching listener receives the
//! event in its own mailbox and a job on the worker pool drains that
//! mailbox, so:
//! - `fire` returns once deliveries are queued;
//! - one listener sees events in exactly the order they were fired;
//! - different listeners run concurrently and in no particular order;
//! - a listener that fails or panics is logged and skipped without
//!   affecting its siblings or the publisher.

use dashmap::DashMap;
use hub_core::{Context, Event, EventData, EventType, HubError, SharedClock};
use hub_worker_pool::{Job, JobPriority, WorkerPool};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, trace, warn};

/// Callback invoked for each delivered event
pub type ListenerCallback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// A unique identifier for an event listener, increasing in registration
/// order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Mailbox {
    events: VecDeque<Arc<Event>>,
    /// A pool job is draining this mailbox
    scheduled: bool,
}

struct Listener {
    id: ListenerId,
    event_type: EventType,
    callback: ListenerCallback,
    active: AtomicBool,
    mailbox: Mutex<Mailbox>,
}

impl Listener {
    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver queued events one by one until the mailbox is empty
    fn drain_mailbox(&self) {
        loop {
            let event = {
                let mut mailbox = self.mailbox();
                match mailbox.events.pop_front() {
                    Some(event) => event,
                    None => {
                        mailbox.scheduled = false;
                        return;
                    }
                }
            };

            if !self.active.load(Ordering::SeqCst) {
                continue;
            }

            self.invoke(&event);
        }
    }

    fn invoke(&self, event: &Event) {
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = HubError::Listener(format!("{:#}", e));
                warn!(
                    listener = self.id.0,
                    event_type = %event.event_type,
                    error = %err,
                    "Error handling event"
                );
            }
            Err(_) => error!(
                listener = self.id.0,
                event_type = %event.event_type,
                "Event listener panicked"
            ),
        }
    }
}

type Registry = DashMap<EventType, Vec<Arc<Listener>>>;

/// Handle returned by [`EventBus::listen`]
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::cancel`] to remove it.
pub struct Subscription {
    listener: Arc<Listener>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.listener.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.listener.event_type
    }

    /// Stop future deliveries
    ///
    /// A callback already running finishes; events queued for this listener
    /// but not yet started are dropped. Returns `true` only for the call
    /// that actually removed the listener.
    pub fn cancel(&self) -> bool {
        if !self.listener.active.swap(false, Ordering::SeqCst) {
            return false;
        }

        if let Some(registry) = self.registry.upgrade() {
            let event_type = &self.listener.event_type;
            let now_empty = match registry.get_mut(event_type) {
                Some(mut listeners) => {
                    listeners.retain(|l| l.id != self.listener.id);
                    listeners.is_empty()
                }
                None => false,
            };
            if now_empty {
                registry.remove_if(event_type, |_, listeners| listeners.is_empty());
            }
        }

        trace!(listener = self.listener.id.0, "Listener cancelled");
        true
    }

    pub fn is_active(&self) -> bool {
        self.listener.active.load(Ordering::SeqCst)
    }
}

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    listeners: Arc<Registry>,
    pool: Arc<WorkerPool>,
    clock: SharedClock,
    next_listener_id: AtomicU64,
    events_fired: AtomicU64,
}

impl EventBus {
    /// Create a bus that delivers on `pool` and stamps events with `clock`
    pub fn new(pool: Arc<WorkerPool>, clock: SharedClock) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            pool,
            clock,
            next_listener_id: AtomicU64::new(1),
            events_fired: AtomicU64::new(0),
        }
    }

    /// Register a callback for one event type, or for all with `*`
    pub fn listen<F>(&self, event_type: impl Into<EventType>, callback: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        trace!(event_type = %event_type, listener = id.0, "Adding listener");

        let listener = Arc::new(Listener {
            id,
            event_type: event_type.clone(),
            callback: Arc::new(callback),
            active: AtomicBool::new(true),
            mailbox: Mutex::new(Mailbox::default()),
        });

        self.listeners
            .entry(event_type)
            .or_default()
            .push(listener.clone());

        Subscription {
            listener,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Register a callback for every event
    pub fn listen_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(EventType::match_all(), callback)
    }

    /// Register a callback receiving parsed event data
    ///
    /// Events of the type whose data does not parse as `T` are skipped.
    pub fn listen_typed<T, F>(&self, callback: F) -> Subscription
    where
        T: EventData + serde::de::DeserializeOwned,
        F: Fn(&Event<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(T::event_type(), move |event: &Event| {
            let Some(data) = event.parse_data::<T>() else {
                trace!(event_type = %event.event_type, "Skipping event with unexpected data");
                return Ok(());
            };
            callback(&Event {
                event_type: event.event_type.clone(),
                data,
                origin: event.origin,
                time_fired: event.time_fired,
                context: event.context.clone(),
            })
        })
    }

    /// Fire an event to all subscribers
    ///
    /// Listeners of the event's type and `*` listeners are queued in the
    /// order they registered. Returns once everything is queued.
    pub fn fire(&self, event: Event) {
        debug!(event_type = %event.event_type, "Firing event");
        self.events_fired.fetch_add(1, Ordering::Relaxed);

        let mut targets: Vec<Arc<Listener>> = Vec::new();
        if let Some(listeners) = self.listeners.get(&event.event_type) {
            targets.extend(listeners.iter().cloned());
        }
        if !event.event_type.is_match_all() {
            if let Some(listeners) = self.listeners.get(&EventType::match_all()) {
                targets.extend(listeners.iter().cloned());
            }
        }
        targets.sort_by_key(|l| l.id);

        if targets.is_empty() {
            return;
        }

        let priority = JobPriority::from_event_type(event.event_type.as_str());
        let event = Arc::new(event);
        for listener in targets {
            self.deliver(listener, event.clone(), priority);
        }
    }

    /// Fire an event built from a type and JSON data, stamped with the bus
    /// clock
    pub fn fire_event(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        context: Context,
    ) {
        let event = Event::new(event_type, data, context).with_time_fired(self.clock.now());
        self.fire(event);
    }

    /// Fire a typed event, stamped with the bus clock
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let event = Event::typed(data, context)
            .with_time_fired(self.clock.now())
            .into_json();
        self.fire(event);
    }

    fn deliver(&self, listener: Arc<Listener>, event: Arc<Event>, priority: JobPriority) {
        let needs_job = {
            let mut mailbox = listener.mailbox();
            mailbox.events.push_back(event);
            !std::mem::replace(&mut mailbox.scheduled, true)
        };

        if !needs_job {
            return;
        }

        let label = format!("listener {} ({})", listener.id.0, listener.event_type);
        let worker_listener = listener.clone();
        let job = Job::new(priority, label, move || {
            worker_listener.drain_mailbox();
            Ok(())
        });

        if let Err(e) = self.pool.submit(job) {
            warn!(listener = listener.id.0, error = %e, "Dropping event delivery");
            let mut mailbox = listener.mailbox();
            mailbox.events.clear();
            mailbox.scheduled = false;
        }
    }

    /// Number of events fired since the bus was created
    pub fn events_fired(&self) -> u64 {
        self.events_fired.load(Ordering::Relaxed)
    }

    /// Total number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }

    /// Listener count per event type
    pub fn listeners_by_type(&self) -> HashMap<String, usize> {
        self.listeners
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().len()))
            .collect()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;

//! Entity state storage with domain indexing
//!
//! The StateStore keeps the current [`State`] of every entity, keyed by
//! entity id, and fires `state_changed` on the event bus whenever a record
//! is written or removed. Records are shared as `Arc<State>`: a reader that
//! fetched a state keeps a consistent snapshot even if a writer replaces it
//! a moment later.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hub_core::events::StateChangedData;
use hub_core::{Attributes, Context, EntityId, SharedClock, State};
use hub_event_bus::EventBus;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, trace};

/// The state store tracks all entity states
///
/// Writes are serialized by one lock held while the old record is read,
/// the new one swapped in and the change event queued. Queuing never runs
/// listeners, so the lock is short; in exchange every listener sees the
/// changes of one entity in commit order. Reads never take the lock.
pub struct StateStore {
    /// All entity states keyed by entity_id string
    states: DashMap<String, Arc<State>>,
    /// Index of entity_ids by domain
    domain_index: DashMap<String, BTreeSet<String>>,
    write_lock: Mutex<()>,
    event_bus: Arc<EventBus>,
    clock: SharedClock,
}

impl StateStore {
    /// Create a store publishing on `event_bus` and timestamping with the
    /// bus clock
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        let clock = event_bus.clock().clone();
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            write_lock: Mutex::new(()),
            event_bus,
            clock,
        }
    }

    /// Set the state of an entity
    ///
    /// `last_changed` only moves if the state value actually changed.
    /// Fires STATE_CHANGED with the old and new state after the new record
    /// is visible to `get`.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: &EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> Arc<State> {
        let key = entity_id.to_string();
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        let old_state = self.states.get(&key).map(|s| Arc::clone(s.value()));
        let new_state = Arc::new(match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone(), now),
            None => State::new(entity_id.clone(), state, attributes, context.clone(), now),
        });

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(key.clone(), new_state.clone());
        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .insert(key);
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id: entity_id.clone(),
                old_state: old_state.map(|s| (*s).clone()),
                new_state: Some((*new_state).clone()),
            },
            context,
        );

        new_state
    }

    /// Remove an entity's state
    ///
    /// Fires STATE_CHANGED with `new_state = None`. Returns whether the
    /// entity existed.
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> bool {
        let key = entity_id.to_string();
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some((_, old_state)) = self.states.remove(&key) else {
            return false;
        };
        trace!("Removing entity state");

        let domain = entity_id.domain();
        let now_empty = match self.domain_index.get_mut(domain) {
            Some(mut ids) => {
                ids.remove(&key);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.domain_index.remove_if(domain, |_, ids| ids.is_empty());
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id: entity_id.clone(),
                old_state: Some((*old_state).clone()),
                new_state: None,
            },
            context,
        );

        true
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<Arc<State>> {
        self.states.get(entity_id).map(|s| Arc::clone(s.value()))
    }

    /// Get the state value as a string, or None if entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.states
            .get(entity_id)
            .map(|s| s.state == state)
            .unwrap_or(false)
    }

    /// Sorted entity ids, optionally restricted to one domain
    pub fn entity_ids(&self, domain: Option<&str>) -> Vec<String> {
        match domain {
            Some(domain) => self
                .domain_index
                .get(domain)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
            None => {
                let mut ids: Vec<String> = self.states.iter().map(|r| r.key().clone()).collect();
                ids.sort();
                ids
            }
        }
    }

    /// Get all states
    pub fn all(&self) -> Vec<Arc<State>> {
        self.states.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// States written at or after `since`
    pub fn changed_since(&self, since: DateTime<Utc>) -> Vec<Arc<State>> {
        self.states
            .iter()
            .filter(|r| r.last_updated >= since)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// Get all domains with at least one entity
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domain_index.iter().map(|r| r.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Get the total number of entities
    pub fn entity_count(&self) -> usize {
        self.states.len()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hub_core::{Clock, Event, ManualClock};
    use hub_worker_pool::WorkerPool;
    use serde_json::json;

    fn make_store(workers: usize) -> (StateStore, ManualClock) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let bus = Arc::new(EventBus::new(WorkerPool::new(workers), Arc::new(clock.clone())));
        (StateStore::new(bus), clock)
    }

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _) = make_store(1);
        let attrs = Attributes::from([("brightness".to_string(), json!(255))]);

        let written = store.set(&id("light.kitchen"), "on", attrs.clone(), Context::new());
        let read = store.get("light.kitchen").unwrap();

        assert_eq!(read.state, "on");
        assert_eq!(read.attributes, attrs);
        assert!(Arc::ptr_eq(&written, &read));
        assert!(store.is_state("light.kitchen", "on"));
        assert_eq!(store.get_state("light.kitchen").as_deref(), Some("on"));
        assert!(store.get("light.missing").is_none());
    }

    #[tokio::test]
    async fn test_same_state_keeps_last_changed() {
        let (store, clock) = make_store(1);
        let first = store.set(&id("sensor.door"), "closed", Attributes::new(), Context::new());

        clock.advance_seconds(30);
        let second = store.set(&id("sensor.door"), "closed", Attributes::new(), Context::new());

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated > first.last_updated);

        clock.advance_seconds(5);
        let third = store.set(&id("sensor.door"), "open", Attributes::new(), Context::new());
        assert_eq!(third.last_changed, clock.now());
    }

    #[tokio::test]
    async fn test_reader_keeps_old_snapshot() {
        let (store, _) = make_store(1);
        store.set(&id("switch.fan"), "off", Attributes::new(), Context::new());

        let snapshot = store.get("switch.fan").unwrap();
        store.set(&id("switch.fan"), "on", Attributes::new(), Context::new());

        assert_eq!(snapshot.state, "off");
        assert_eq!(store.get_state("switch.fan").as_deref(), Some("on"));
    }

    #[tokio::test]
    async fn test_remove_and_domain_index() {
        let (store, _) = make_store(1);
        store.set(&id("light.a"), "on", Attributes::new(), Context::new());
        store.set(&id("light.b"), "off", Attributes::new(), Context::new());
        store.set(&id("switch.c"), "on", Attributes::new(), Context::new());

        assert_eq!(store.entity_ids(Some("light")), vec!["light.a", "light.b"]);
        assert_eq!(store.entity_ids(None).len(), 3);
        assert_eq!(store.domains(), vec!["light", "switch"]);

        assert!(store.remove(&id("switch.c"), Context::new()));
        assert!(!store.remove(&id("switch.c"), Context::new()));
        assert_eq!(store.domains(), vec!["light"]);
        assert!(store.entity_ids(Some("switch")).is_empty());
        assert_eq!(store.entity_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_fires_state_changed_without_new_state() {
        let (store, _) = make_store(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.event_bus.listen_typed::<StateChangedData, _>(move |event| {
            sink.lock().unwrap().push(event.data.clone());
            Ok(())
        });

        store.set(&id("light.porch"), "on", Attributes::new(), Context::new());
        store.remove(&id("light.porch"), Context::new());
        // Nothing to remove, nothing fired
        store.remove(&id("light.porch"), Context::new());
        store.event_bus.pool().drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let removal = &seen[1];
        assert_eq!(removal.entity_id.to_string(), "light.porch");
        assert_eq!(removal.old_state.as_ref().map(|s| s.state.as_str()), Some("on"));
        assert!(removal.new_state.is_none());
    }

    #[tokio::test]
    async fn test_changed_since() {
        let (store, clock) = make_store(1);
        store.set(&id("sensor.old"), "1", Attributes::new(), Context::new());

        clock.advance_seconds(60);
        let cutoff = clock.now();
        store.set(&id("sensor.new"), "2", Attributes::new(), Context::new());

        let changed = store.changed_since(cutoff);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].entity_id.to_string(), "sensor.new");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_change_events_follow_commit_order() {
        let (store, _) = make_store(4);
        let store = Arc::new(store);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = store.event_bus.listen_typed::<StateChangedData, _>(move |event| {
            let old = event.data.old_state.as_ref().map(|s| s.state.clone());
            let new = event.data.new_state.as_ref().map(|s| s.state.clone());
            sink.lock().unwrap().push((old, new));
            Ok(())
        });

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..50 {
                        store.set(
                            &id("sensor.counter"),
                            format!("{}-{}", w, i),
                            Attributes::new(),
                            Context::new(),
                        );
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        store.event_bus.pool().drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        assert_eq!(seen[0].0, None);
        // Each event's old state is the previous event's new state
        for pair in seen.windows(2) {
            assert_eq!(pair[1].0, pair[0].1);
        }
        assert_eq!(seen[199].1, store.get_state("sensor.counter"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_reads_new_value() {
        let (store, _) = make_store(2);
        let store = Arc::new(store);
        let observed = Arc::new(Mutex::new(None));

        let reader = store.clone();
        let sink = observed.clone();
        let _sub = store.event_bus.listen("state_changed", move |_: &Event| {
            *sink.lock().unwrap() = reader.get_state("light.hall");
            Ok(())
        });

        store.set(&id("light.hall"), "on", Attributes::new(), Context::new());
        store.event_bus.pool().drain().await;

        assert_eq!(observed.lock().unwrap().as_deref(), Some("on"));
    }
}

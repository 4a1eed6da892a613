//! Shared harness for hub scenario tests
//!
//! Builds a full [`Hub`] on a [`ManualClock`] with a scripted scanner, and
//! steps time one second at a time through the scheduler.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use hub_core::{Clock, Event, HubError, HubResult, ManualClock};
use hub_device_tracker::DeviceScanner;
use hub_event_bus::Subscription;
use hub_server::{Hub, HubConfig};
use indexmap::IndexMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scanner whose answers are set by the test
pub struct ScriptedScanner {
    devices: IndexMap<String, String>,
    present: Mutex<Vec<String>>,
    failing: AtomicBool,
    enumerate_fails: bool,
    scans: AtomicUsize,
}

impl ScriptedScanner {
    pub fn new(devices: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            devices: devices
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect(),
            present: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            enumerate_fails: false,
            scans: AtomicUsize::new(0),
        })
    }

    /// A scanner that cannot even list its devices
    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            devices: IndexMap::new(),
            present: Mutex::new(Vec::new()),
            failing: AtomicBool::new(true),
            enumerate_fails: true,
            scans: AtomicUsize::new(0),
        })
    }

    /// Devices reported by every following scan
    pub fn set_present(&self, device_ids: &[&str]) {
        *self.present.lock().unwrap() = device_ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of scans attempted so far
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl DeviceScanner for ScriptedScanner {
    fn devices_to_track(&self) -> HubResult<IndexMap<String, String>> {
        if self.enumerate_fails {
            return Err(HubError::transient("router unreachable"));
        }
        Ok(self.devices.clone())
    }

    fn scan_devices(&self) -> HubResult<Vec<String>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(HubError::transient("scan timed out"));
        }
        Ok(self.present.lock().unwrap().clone())
    }
}

/// Midday on a Monday, one second before a `0,30` scan slot
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 11, 59, 59).unwrap()
}

/// A hub on a manual clock with every event captured
pub struct TestHub {
    pub hub: Hub,
    pub clock: ManualClock,
    pub scanner: Arc<ScriptedScanner>,
    events: Arc<Mutex<Vec<Event>>>,
    _capture: Subscription,
}

impl TestHub {
    /// Build from YAML; the scheduler's own tick loop is slowed down so only
    /// [`TestHub::run_for`] moves time
    pub fn new(yaml: &str, scanner: Arc<ScriptedScanner>) -> Self {
        let mut config = HubConfig::from_yaml(yaml, Path::new("test.yaml")).unwrap();
        config.scheduler.tick_interval = Duration::from_secs(3600);

        let clock = ManualClock::at(t0());
        let hub = Hub::new(
            &config,
            Arc::new(clock.clone()),
            Some(scanner.clone() as Arc<dyn DeviceScanner>),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let capture = hub.bus().listen_all(move |event: &Event| {
            recorded.lock().unwrap().push(event.clone());
            Ok(())
        });

        Self {
            hub,
            clock,
            scanner,
            events,
            _capture: capture,
        }
    }

    /// Start the hub and let the tick loop's immediate first tick pass
    pub async fn start(&self) {
        self.hub.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.settle().await;
    }

    /// Wait for all queued work
    pub async fn settle(&self) {
        self.hub.pool().drain().await;
    }

    /// Advance the clock one second at a time, ticking the scheduler and
    /// draining the pool after each step
    pub async fn run_for(&self, seconds: i64) {
        for _ in 0..seconds {
            self.clock.advance_seconds(1);
            self.hub.scheduler().tick();
            self.settle().await;
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.hub.states().get_state(entity_id)
    }

    pub fn assert_state(&self, entity_id: &str, expected: &str) {
        let state = self.state(entity_id);
        assert_eq!(
            state.as_deref(),
            Some(expected),
            "Expected entity {} to be in state '{}', but was {:?}",
            entity_id,
            expected,
            state
        );
    }

    /// Captured events of one type, in firing order
    pub fn events_of_type(&self, event_type: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type.as_str() == event_type)
            .cloned()
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }
}

//! Presence tracking from periodic network scans
//!
//! A [`DeviceScanner`] (router query, ARP table, ...) reports which devices
//! are on the network right now. Scans are noisy: a phone in deep sleep or
//! rebooting drops out for one scan. The [`DeviceTracker`] turns those
//! reports into a debounced presence state per device:
//!
//! - a device seen in a scan is `home` immediately;
//! - a device missing from a scan only becomes `not_home` once it has not
//!   been seen for longer than the grace period (70 s by default, enough
//!   for two scans at the default 30 s cadence);
//! - `group.all_devices` is `home` whenever at least one device is.

use chrono::{DateTime, Utc};
use hub_core::util::ensure_unique_string;
use hub_core::{
    Attributes, Context, EntityId, HubError, HubResult, SharedClock, STATE_HOME, STATE_NOT_HOME,
};
use hub_scheduler::{PatternSpec, ScheduleHandle, Scheduler, TimePattern};
use hub_state_store::StateStore;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Domain of per-device presence entities
pub const DOMAIN: &str = "device_tracker";

/// Entity id of the aggregate "anyone home" entity
pub const ENTITY_ID_ALL_DEVICES: &str = "group.all_devices";

/// Source of presence scans
///
/// Implementations may block on network I/O; the tracker only calls them
/// from worker pool jobs.
pub trait DeviceScanner: Send + Sync {
    /// Devices to track, as device id (e.g. MAC address) to display name.
    /// Called once at setup.
    fn devices_to_track(&self) -> HubResult<IndexMap<String, String>>;

    /// Device ids currently present on the network
    fn scan_devices(&self) -> HubResult<Vec<String>>;
}

/// Per-device overrides from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownDevice {
    /// Display name replacing the scanner's
    #[serde(default)]
    pub name: Option<String>,

    /// Set to false to ignore this device
    #[serde(default = "default_track")]
    pub track: bool,
}

fn default_track() -> bool {
    true
}

/// Device tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTrackerConfig {
    /// How long a device may be missing from scans before it is marked away
    #[serde(default = "default_grace_period", with = "hub_core::duration")]
    pub grace_period: Duration,

    /// When to scan
    #[serde(default = "default_scan_pattern")]
    pub scan_pattern: PatternSpec,

    /// Overrides keyed by device id
    #[serde(default)]
    pub devices: IndexMap<String, KnownDevice>,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(70)
}

fn default_scan_pattern() -> PatternSpec {
    PatternSpec::seconds("0,30")
}

impl Default for DeviceTrackerConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            scan_pattern: default_scan_pattern(),
            devices: IndexMap::new(),
        }
    }
}

/// One device under presence tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDevice {
    pub device_id: String,
    pub name: String,
    pub entity_id: EntityId,
    /// Last scan that reported the device; `None` if never seen this session
    pub last_seen: Option<DateTime<Utc>>,
}

impl TrackedDevice {
    fn attributes(&self) -> Attributes {
        let mut attributes = Attributes::from([("friendly_name".to_string(), json!(self.name))]);
        if let Some(last_seen) = self.last_seen {
            attributes.insert("last_seen".to_string(), json!(last_seen.to_rfc3339()));
        }
        attributes
    }
}

/// Reconciles scanner output into presence states
pub struct DeviceTracker {
    store: Arc<StateStore>,
    clock: SharedClock,
    scanner: Arc<dyn DeviceScanner>,
    grace_period: chrono::Duration,
    scan_pattern: PatternSpec,
    /// Fixed for the session; locked for the whole of one reconciliation
    devices: Mutex<IndexMap<String, TrackedDevice>>,
    aggregate: EntityId,
}

impl DeviceTracker {
    /// Enumerate the scanner's devices and register their entities
    ///
    /// Every device entity and the aggregate start as `not_home`. Fails with
    /// [`HubError::Configuration`] when the scanner cannot enumerate.
    pub fn setup(
        store: Arc<StateStore>,
        clock: SharedClock,
        scanner: Arc<dyn DeviceScanner>,
        config: &DeviceTrackerConfig,
    ) -> HubResult<Arc<Self>> {
        let to_track = scanner.devices_to_track().map_err(|e| {
            HubError::configuration(format!("unable to enumerate devices to track: {}", e))
        })?;

        let grace_period = chrono::Duration::from_std(config.grace_period)
            .map_err(|_| HubError::configuration("grace_period out of range"))?;
        TimePattern::try_from(&config.scan_pattern)?;

        let mut taken: Vec<String> = store
            .entity_ids(Some(DOMAIN))
            .iter()
            .filter_map(|id| id.split_once('.').map(|(_, object_id)| object_id.to_string()))
            .collect();

        let mut devices = IndexMap::new();
        for (device_id, scanner_name) in to_track {
            let known = config.devices.get(&device_id);
            if known.map(|k| !k.track).unwrap_or(false) {
                debug!(device_id = %device_id, "Skipping untracked device");
                continue;
            }
            let name = known
                .and_then(|k| k.name.clone())
                .unwrap_or(scanner_name);

            let entity_id = entity_id_for(&name, &device_id, &taken)?;
            taken.push(entity_id.object_id().to_string());

            devices.insert(
                device_id.clone(),
                TrackedDevice {
                    device_id,
                    name,
                    entity_id,
                    last_seen: None,
                },
            );
        }

        let aggregate: EntityId = ENTITY_ID_ALL_DEVICES.parse()?;
        let context = Context::new();
        for device in devices.values() {
            store.set(&device.entity_id, STATE_NOT_HOME, device.attributes(), context.clone());
        }
        store.set(
            &aggregate,
            STATE_NOT_HOME,
            aggregate_attributes(devices.values()),
            context,
        );

        info!(devices = devices.len(), "Device tracker set up");

        Ok(Arc::new(Self {
            store,
            clock,
            scanner,
            grace_period,
            scan_pattern: config.scan_pattern.clone(),
            devices: Mutex::new(devices),
            aggregate,
        }))
    }

    fn lock_devices(&self) -> MutexGuard<'_, IndexMap<String, TrackedDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the scan cycle on the scheduler
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) -> HubResult<ScheduleHandle> {
        let pattern = TimePattern::try_from(&self.scan_pattern)?;
        let tracker = self.clone();

        let handle = scheduler.track_time_pattern(
            move |_| match tracker.scan_cycle() {
                // Already logged; the next cycle retries
                Err(e) if e.is_transient() => Ok(()),
                other => other.map_err(anyhow::Error::from),
            },
            pattern,
        )?;

        info!(pattern = ?self.scan_pattern, "Device tracker scanning");
        Ok(handle)
    }

    /// Run one scan and apply its result
    ///
    /// A failing scanner leaves every state untouched.
    pub fn scan_cycle(&self) -> HubResult<()> {
        match self.scanner.scan_devices() {
            Ok(found) => {
                self.update_devices(&found);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Device scan failed, skipping cycle");
                Err(e)
            }
        }
    }

    /// Apply one scan result
    ///
    /// Found devices become `home`. Missing devices become `not_home` only
    /// once their grace period has passed. Unknown ids are ignored.
    #[instrument(skip_all, fields(found = found.len()))]
    pub fn update_devices(&self, found: &[String]) {
        let now = self.clock.now();
        let context = Context::new();
        let mut devices = self.lock_devices();

        for device in devices.values_mut() {
            if found.iter().any(|id| id == &device.device_id) {
                device.last_seen = Some(now);
                self.store.set(
                    &device.entity_id,
                    STATE_HOME,
                    device.attributes(),
                    context.clone(),
                );
                continue;
            }

            let key = device.entity_id.to_string();
            let gone_too_long = device
                .last_seen
                .map(|seen| now - seen > self.grace_period)
                .unwrap_or(true);

            if self.store.is_state(&key, STATE_HOME) && gone_too_long {
                debug!(entity_id = %key, "Device left");
                self.store.set(
                    &device.entity_id,
                    STATE_NOT_HOME,
                    device.attributes(),
                    context.clone(),
                );
            }
        }

        let anyone_home = devices
            .values()
            .any(|d| self.store.is_state(&d.entity_id.to_string(), STATE_HOME));
        let state = if anyone_home { STATE_HOME } else { STATE_NOT_HOME };

        self.store.set(
            &self.aggregate,
            state,
            aggregate_attributes(devices.values()),
            context,
        );
    }

    /// Snapshot of the tracked devices in enumeration order
    pub fn devices(&self) -> Vec<TrackedDevice> {
        self.lock_devices().values().cloned().collect()
    }

    pub fn aggregate_entity_id(&self) -> &EntityId {
        &self.aggregate
    }
}

fn entity_id_for(name: &str, device_id: &str, taken: &[String]) -> HubResult<EntityId> {
    let slug = [name, device_id]
        .iter()
        .map(|s| hub_core::util::slugify(s))
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "device".to_string());

    let object_id = ensure_unique_string(&slug, taken.iter().map(String::as_str));
    Ok(EntityId::new(DOMAIN, object_id)?)
}

fn aggregate_attributes<'a>(devices: impl Iterator<Item = &'a TrackedDevice>) -> Attributes {
    let ids: Vec<String> = devices.map(|d| d.entity_id.to_string()).collect();
    Attributes::from([
        ("friendly_name".to_string(), json!("all devices")),
        ("entity_id".to_string(), json!(ids)),
    ])
}

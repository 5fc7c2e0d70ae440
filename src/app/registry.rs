use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app::adb::launcher::{LaunchSpec, ProcessLauncher};
use crate::app::adb::parse::{display_name_for, parse_adb_devices};
use crate::app::adb::runner::adb_args;
use crate::app::background::{spawn_loop, LoopHandle};
use crate::app::clock::Clock;
use crate::app::error::{AppError, ERR_TIMEOUT};
use crate::app::models::{ConnectionKind, Device, DeviceListing, DeviceSummary, ToolStatus};

/// Where device enumerations come from.
pub trait DeviceSource: Send + Sync {
    fn enumerate(&self, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError>;
}

/// `adb devices -l` through a launcher, bounded by a hard timeout.
pub struct AdbDeviceSource {
    launcher: Arc<dyn ProcessLauncher>,
    adb_program: String,
    timeout: Duration,
}

impl AdbDeviceSource {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, adb_program: String, timeout: Duration) -> Self {
        Self {
            launcher,
            adb_program,
            timeout,
        }
    }
}

impl DeviceSource for AdbDeviceSource {
    fn enumerate(&self, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
        let spec = LaunchSpec::new(&self.adb_program, adb_args(None, ["devices", "-l"]));
        let output = self.launcher.run(&spec, self.timeout, trace_id)?;
        if !output.success() {
            // Usually "cannot connect to daemon"; the text varies between releases.
            return Err(AppError::tool_unavailable(
                format!("adb devices failed: {}", output.error_summary()),
                trace_id,
            ));
        }
        Ok(parse_adb_devices(&output.stdout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub listing: DeviceListing,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

struct RegistryState {
    devices: BTreeMap<String, Device>,
    tool: ToolStatus,
    last_poll: Option<DateTime<Utc>>,
}

/// Owned device table, refreshed by polling a [`DeviceSource`].
pub struct DeviceRegistry {
    source: Arc<dyn DeviceSource>,
    clock: Arc<dyn Clock>,
    miss_threshold: u32,
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    pub fn new(source: Arc<dyn DeviceSource>, clock: Arc<dyn Clock>, miss_threshold: u32) -> Self {
        Self {
            source,
            clock,
            miss_threshold: miss_threshold.max(1),
            state: RwLock::new(RegistryState {
                devices: BTreeMap::new(),
                tool: ToolStatus::Available,
                last_poll: None,
            }),
        }
    }

    /// Snapshot of the current table. An unavailable tool reports no devices.
    pub fn list_devices(&self) -> DeviceListing {
        match self.state.read() {
            Ok(state) => listing_of(&state),
            Err(_) => DeviceListing {
                devices: Vec::new(),
                tool: ToolStatus::Unavailable {
                    message: "device registry lock poisoned".to_string(),
                },
            },
        }
    }

    pub fn get(&self, serial: &str) -> Option<Device> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.devices.get(serial).cloned())
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.get(serial).is_some()
    }

    /// Known and in the `device` state; unauthorized and offline rows are
    /// listed but cannot run operations.
    pub fn is_online(&self, serial: &str) -> bool {
        self.get(serial).is_some_and(|device| device.is_online())
    }

    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        self.state.read().ok().and_then(|state| state.last_poll)
    }

    /// Explicit client refresh: one poll, then the listing.
    pub fn refresh(&self, trace_id: &str) -> DeviceListing {
        self.poll(trace_id).listing
    }

    pub fn poll(&self, trace_id: &str) -> PollOutcome {
        // Enumerate outside the lock so slow adb calls never block readers.
        let result = self.source.enumerate(trace_id);
        let now = self.clock.now();

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.last_poll = Some(now);

        let (added, removed) = match result {
            Ok(summaries) => {
                state.tool = ToolStatus::Available;
                apply_snapshot(&mut state.devices, summaries, now, self.miss_threshold)
            }
            Err(err) if err.is(ERR_TIMEOUT) => {
                warn!(trace_id = %trace_id, error = %err, "device enumeration timed out");
                state.tool = ToolStatus::TimedOut;
                (Vec::new(), Vec::new())
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "device enumeration failed");
                state.tool = ToolStatus::Unavailable { message: err.error };
                (Vec::new(), Vec::new())
            }
        };

        if !added.is_empty() || !removed.is_empty() {
            info!(
                trace_id = %trace_id,
                added = ?added,
                removed = ?removed,
                "device set changed"
            );
        }

        PollOutcome {
            listing: listing_of(&state),
            added,
            removed,
        }
    }
}

fn listing_of(state: &RegistryState) -> DeviceListing {
    let devices = match state.tool {
        ToolStatus::Unavailable { .. } => Vec::new(),
        _ => state.devices.values().cloned().collect(),
    };
    DeviceListing {
        devices,
        tool: state.tool.clone(),
    }
}

fn apply_snapshot(
    devices: &mut BTreeMap<String, Device>,
    summaries: Vec<DeviceSummary>,
    now: DateTime<Utc>,
    miss_threshold: u32,
) -> (Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for summary in summaries {
        if !seen.insert(summary.serial.clone()) {
            continue;
        }
        let display_name = display_name_for(&summary);
        match devices.get_mut(&summary.serial) {
            Some(device) => {
                device.state = summary.state;
                device.display_name = display_name;
                device.model = summary.model.or(device.model.take());
                device.product = summary.product.or(device.product.take());
                device.transport_id = summary.transport_id;
                device.last_seen = now;
                device.misses = 0;
            }
            None => {
                added.push(summary.serial.clone());
                devices.insert(
                    summary.serial.clone(),
                    Device {
                        connection: ConnectionKind::from_serial(&summary.serial),
                        serial: summary.serial,
                        display_name,
                        state: summary.state,
                        model: summary.model,
                        product: summary.product,
                        transport_id: summary.transport_id,
                        first_seen: now,
                        last_seen: now,
                        misses: 0,
                    },
                );
            }
        }
    }

    let mut removed = Vec::new();
    for (serial, device) in devices.iter_mut() {
        if seen.contains(serial) {
            continue;
        }
        device.misses = device.misses.saturating_add(1);
        debug!(serial = %serial, misses = device.misses, "device missing from poll");
        if device.misses >= miss_threshold {
            removed.push(serial.clone());
        }
    }
    for serial in &removed {
        devices.remove(serial);
    }

    (added, removed)
}

/// Polls `registry` every `interval` on a background thread.
pub fn start_registry_poller(registry: Arc<DeviceRegistry>, interval: Duration) -> LoopHandle {
    spawn_loop("registry-poller", interval, move || {
        let trace_id = uuid::Uuid::new_v4().to_string();
        registry.poll(&trace_id);
    })
}

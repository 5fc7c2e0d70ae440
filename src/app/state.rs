use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::launcher::{ProcessLauncher, SystemLauncher};
use crate::app::adb::locator::{resolve_adb_program, validate_program};
use crate::app::adb::scrcpy::check_scrcpy_availability;
use crate::app::artifacts::ArtifactStore;
use crate::app::background::LoopHandle;
use crate::app::clock::{Clock, SystemClock};
use crate::app::config::AppConfig;
use crate::app::device_ops::DeviceOps;
use crate::app::error::AppError;
use crate::app::mirror::MirrorController;
use crate::app::models::ScrcpyInfo;
use crate::app::registry::{start_registry_poller, AdbDeviceSource, DeviceRegistry, DeviceSource};
use crate::app::rules_store::RulesStore;
use crate::app::scheduler::relock;
use crate::app::supervisor::SessionSupervisor;

/// Everything a transport needs to serve requests, built once per process.
pub struct AppState {
    pub config: AppConfig,
    pub adb_program: String,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub registry: Arc<DeviceRegistry>,
    pub artifacts: Arc<ArtifactStore>,
    pub supervisor: SessionSupervisor,
    pub mirror: Arc<MirrorController>,
    pub device_ops: DeviceOps,
    pub rules: RulesStore,
    background: Mutex<Vec<LoopHandle>>,
}

/// Injectable pieces; `AppState::new` fills them with the real ones.
pub struct StateParts {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub source: Option<Arc<dyn DeviceSource>>,
    pub clock: Arc<dyn Clock>,
    pub scrcpy: ScrcpyInfo,
    pub rules: RulesStore,
}

impl AppState {
    pub fn new(config: AppConfig, trace_id: &str) -> Result<Self, AppError> {
        let scrcpy = check_scrcpy_availability(&config.adb.scrcpy_path);
        let rules = RulesStore::open(&config.rules_db_path(), trace_id)?;
        Self::with_parts(
            config,
            StateParts {
                launcher: Arc::new(SystemLauncher),
                source: None,
                clock: Arc::new(SystemClock),
                scrcpy,
                rules,
            },
            trace_id,
        )
    }

    pub fn with_parts(config: AppConfig, parts: StateParts, trace_id: &str) -> Result<Self, AppError> {
        let adb_program = resolve_adb_program(&config.adb.command_path);
        if let Err(message) = validate_program(&adb_program, "ADB") {
            warn!(trace_id = %trace_id, adb = %adb_program, error = %message, "configured adb looks unusable");
        }

        let source: Arc<dyn DeviceSource> = match parts.source {
            Some(source) => source,
            None => Arc::new(AdbDeviceSource::new(
                Arc::clone(&parts.launcher),
                adb_program.clone(),
                Duration::from_millis(config.registry.enumeration_timeout_ms),
            )),
        };
        let registry = Arc::new(DeviceRegistry::new(
            source,
            Arc::clone(&parts.clock),
            config.registry.miss_threshold,
        ));
        let artifacts = Arc::new(ArtifactStore::open(config.artifact_root(), trace_id)?);
        let supervisor = SessionSupervisor::new(
            Arc::clone(&parts.launcher),
            Some(Arc::clone(&registry)),
            Arc::clone(&artifacts),
            Arc::clone(&parts.clock),
            config.clone(),
            adb_program.clone(),
        );
        parts.rules.seed_package(&config.packages.seed_package, trace_id)?;
        supervisor.set_expectations(parts.rules.list_expectations(trace_id)?);
        let mirror = Arc::new(MirrorController::new(
            Arc::clone(&parts.launcher),
            Arc::clone(&parts.clock),
            config.scrcpy.clone(),
            parts.scrcpy,
            config.supervisor.stop_grace(),
        ));
        let device_ops = DeviceOps::new(
            Arc::clone(&parts.launcher),
            Arc::clone(&artifacts),
            adb_program.clone(),
            config.command_timeout(),
        );

        info!(
            trace_id = %trace_id,
            adb = %adb_program,
            artifact_root = %artifacts.root().display(),
            "app state ready"
        );
        Ok(Self {
            config,
            adb_program,
            launcher: parts.launcher,
            registry,
            artifacts,
            supervisor,
            mirror,
            device_ops,
            rules: parts.rules,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Starts the registry poller and the session sweeper. Calling it again
    /// is a no-op.
    pub fn start_background(&self) {
        let mut background = relock(&self.background);
        if !background.is_empty() {
            return;
        }
        background.push(start_registry_poller(
            Arc::clone(&self.registry),
            Duration::from_millis(self.config.registry.poll_interval_ms),
        ));
        background.push(self.supervisor.start_sweeper(Some(Arc::clone(&self.mirror))));
    }

    /// Stops background loops, then every session and mirror.
    pub fn shutdown(&self, trace_id: &str) {
        let loops: Vec<LoopHandle> = std::mem::take(&mut *relock(&self.background));
        for handle in loops {
            handle.stop();
        }
        self.supervisor.stop_all(trace_id);
        self.mirror.stop_all(trace_id);
        info!(trace_id = %trace_id, "app state shut down");
    }
}

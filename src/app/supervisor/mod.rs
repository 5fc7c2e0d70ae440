pub mod pipeline;
pub mod plan;
pub mod process;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::launcher::{LaunchSpec, ProcessLauncher};
use crate::app::adb::runner::adb_args;
use crate::app::artifacts::ArtifactStore;
use crate::app::background::{spawn_loop, LoopHandle};
use crate::app::clock::Clock;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::matcher::audit::EventAudit;
use crate::app::matcher::LogMatcher;
use crate::app::mirror::MirrorController;
use crate::app::models::{
    Artifact, ArtifactKind, AuditReport, EventExpectation, OperationKind, OutputPayload, Session,
    SessionParams, SessionStatus,
};
use crate::app::perf::sampler::PerfSampler;
use crate::app::registry::DeviceRegistry;
use crate::app::relay::{OutputRelay, Subscription};
use crate::app::scheduler::{relock, DeviceLocks};

use self::pipeline::OutputPipeline;
use self::plan::{plan_operation, ArtifactPlan, OperationPlan, OutputFeed};
use self::process::SessionProcess;

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct SessionEntry {
    session: Session,
    relay: Arc<OutputRelay>,
    pipeline: Option<Arc<OutputPipeline>>,
    process: Option<Arc<SessionProcess>>,
    plan: Option<OperationPlan>,
    audit: Option<Arc<Mutex<EventAudit>>>,
}

#[derive(Default)]
struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    /// Non-terminal session per (serial, kind).
    active: HashMap<(String, OperationKind), String>,
}

struct Inner {
    launcher: Arc<dyn ProcessLauncher>,
    registry: Option<Arc<DeviceRegistry>>,
    artifacts: Arc<ArtifactStore>,
    clock: Arc<dyn Clock>,
    config: AppConfig,
    adb_program: String,
    table: RwLock<SessionTable>,
    device_locks: DeviceLocks,
    expectations: RwLock<Vec<EventExpectation>>,
    /// When false, exited sessions are left for `sweep` to reconcile.
    watch_sessions: bool,
}

/// Owns every long-running device operation.
///
/// At most one non-terminal session exists per (device, operation kind).
/// Start and stop for a device run under that device's lock; status reads
/// take snapshots from the session table.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        registry: Option<Arc<DeviceRegistry>>,
        artifacts: Arc<ArtifactStore>,
        clock: Arc<dyn Clock>,
        config: AppConfig,
        adb_program: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                registry,
                artifacts,
                clock,
                config,
                adb_program,
                table: RwLock::new(SessionTable::default()),
                device_locks: DeviceLocks::new(),
                expectations: RwLock::new(Vec::new()),
                watch_sessions: true,
            }),
        }
    }

    #[cfg(test)]
    fn without_watchers(mut self) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.watch_sessions = false;
        }
        self
    }

    pub fn start(
        &self,
        serial: &str,
        kind: OperationKind,
        params: SessionParams,
        trace_id: &str,
    ) -> Result<Session, AppError> {
        let serial = serial.trim();
        if serial.is_empty() {
            return Err(AppError::validation("serial is required", trace_id));
        }
        if let Some(registry) = &self.inner.registry {
            if !registry.is_online(serial) {
                return Err(AppError::device_not_found(serial, trace_id));
            }
        }

        let lock = self.inner.device_locks.device_lock(serial);
        let _device_guard = relock(&lock);

        if let Some(existing) = self.inner.read_table().active.get(&(serial.to_string(), kind)) {
            return Err(AppError::conflict(
                format!("{kind} already running on {serial} (session {existing})"),
                trace_id,
            ));
        }

        let plan = plan_operation(
            kind,
            serial,
            &params,
            &self.inner.config,
            &self.inner.adb_program,
            &self.inner.artifacts,
            trace_id,
        )?;

        let session_id = Uuid::new_v4().to_string();
        let relay = Arc::new(OutputRelay::new(
            session_id.clone(),
            self.inner.config.relay.retention_lines,
        ));
        let (pipeline, audit) = self.inner.build_pipeline(serial, &plan, Arc::clone(&relay), trace_id)?;

        let session = Session {
            id: session_id.clone(),
            serial: serial.to_string(),
            kind,
            status: SessionStatus::Pending,
            params,
            started_at: self.inner.clock.now(),
            ended_at: None,
            exit_code: None,
            diagnostics: Vec::new(),
            artifact: None,
            trace_id: trace_id.to_string(),
        };
        {
            let mut table = self.inner.write_table();
            table
                .active
                .insert((serial.to_string(), kind), session_id.clone());
            table.entries.insert(
                session_id.clone(),
                SessionEntry {
                    session,
                    relay: Arc::clone(&relay),
                    pipeline: Some(Arc::clone(&pipeline)),
                    process: None,
                    plan: Some(plan.clone()),
                    audit,
                },
            );
        }

        let child = match self.inner.launcher.spawn(&plan.spec, trace_id) {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    trace_id = %trace_id,
                    serial = %serial,
                    session_id = %session_id,
                    error = %err,
                    "failed to start session process"
                );
                pipeline.finish();
                if let ArtifactPlan::Tee { local, .. } = &plan.artifact {
                    let _ = fs::remove_file(local);
                }
                self.inner.complete(
                    &session_id,
                    SessionStatus::Failed,
                    None,
                    vec![format!("failed to start {}: {}", plan.spec.program, err.error)],
                    None,
                );
                return Err(err);
            }
        };

        let process = Arc::new(SessionProcess::attach(child, pipeline));
        let snapshot = {
            let mut table = self.inner.write_table();
            match table.entries.get_mut(&session_id) {
                Some(entry) => {
                    entry.process = Some(Arc::clone(&process));
                    entry.session.status = SessionStatus::Running;
                    entry.session.clone()
                }
                None => return Err(AppError::system("Session vanished during start", trace_id)),
            }
        };

        if self.inner.watch_sessions {
            let weak = Arc::downgrade(&self.inner);
            let watch_id = session_id.clone();
            let watch_process = Arc::clone(&process);
            match thread::Builder::new()
                .name("session-watcher".to_string())
                .spawn(move || watch_session(weak, watch_id, watch_process))
            {
                Ok(handle) => process.set_watcher(handle),
                // The sweeper still reconciles the session without a watcher.
                Err(err) => warn!(session_id = %session_id, error = %err, "failed to spawn session watcher"),
            }
        }

        info!(
            trace_id = %trace_id,
            serial = %serial,
            session_id = %session_id,
            kind = %kind,
            pid = process.pid(),
            command = %plan.spec.display(),
            "session started"
        );
        Ok(snapshot)
    }

    /// Graceful stop, then forced kill after the grace period. Unknown and
    /// already-terminal sessions are a successful no-op.
    pub fn stop(&self, session_id: &str, trace_id: &str) -> Result<Option<Session>, AppError> {
        let Some(serial) = self
            .inner
            .read_table()
            .entries
            .get(session_id)
            .map(|entry| entry.session.serial.clone())
        else {
            return Ok(None);
        };

        // Start holds this lock until the process is attached, so the entry
        // read below never sees a Pending session without its process.
        let lock = self.inner.device_locks.device_lock(&serial);
        let _device_guard = relock(&lock);

        let (process, plan) = {
            let table = self.inner.read_table();
            let Some(entry) = table.entries.get(session_id) else {
                return Ok(None);
            };
            if entry.session.status.is_terminal() {
                return Ok(Some(entry.session.clone()));
            }
            (entry.process.clone(), entry.plan.clone())
        };
        let Some(process) = process else {
            return Ok(self.status(session_id));
        };

        if process.try_exit().is_none() {
            if process.request_stop() {
                info!(trace_id = %trace_id, session_id = %session_id, serial = %serial, "stopping session");
                if let Some(remote_stop) = plan.as_ref().and_then(|plan| plan.remote_stop.as_ref()) {
                    let timeout = self
                        .inner
                        .config
                        .supervisor
                        .stop_grace()
                        .min(self.inner.config.command_timeout());
                    if let Err(err) = self.inner.launcher.run(remote_stop, timeout, trace_id) {
                        warn!(trace_id = %trace_id, session_id = %session_id, error = %err, "remote stop failed");
                    }
                }
            } else {
                info!(trace_id = %trace_id, session_id = %session_id, serial = %serial, "retrying stop of live session");
            }
            if process.terminate(self.inner.config.supervisor.stop_grace()).is_none() {
                return Err(AppError::process_failure(
                    format!("Session process {} did not exit", process.pid()),
                    trace_id,
                ));
            }
        }

        if !self.inner.finalize(session_id, &process) {
            let budget = self.inner.config.command_timeout() * 2 + Duration::from_secs(2);
            if !process.wait_finalized(budget) {
                return Err(AppError::timeout("Timed out finalizing session", trace_id));
            }
        }
        if let Some(handle) = process.take_watcher() {
            let _ = handle.join();
        }
        Ok(self.status(session_id))
    }

    /// Stops every non-terminal session; used on shutdown.
    pub fn stop_all(&self, trace_id: &str) {
        let ids: Vec<String> = self.inner.read_table().active.values().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id, trace_id) {
                warn!(trace_id = %trace_id, session_id = %id, error = %err, "failed to stop session on shutdown");
            }
        }
    }

    pub fn status(&self, session_id: &str) -> Option<Session> {
        self.inner
            .read_table()
            .entries
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    pub fn list_sessions(&self, serial: Option<&str>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .read_table()
            .entries
            .values()
            .filter(|entry| serial.map(|serial| entry.session.serial == serial).unwrap_or(true))
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn subscribe(&self, session_id: &str, replay: bool, trace_id: &str) -> Result<Subscription, AppError> {
        self.inner
            .read_table()
            .entries
            .get(session_id)
            .map(|entry| entry.relay.subscribe(replay))
            .ok_or_else(|| AppError::not_found(format!("Unknown session: {session_id}"), trace_id))
    }

    /// Reconciles process liveness with recorded status. Returns how many
    /// sessions were finalized.
    pub fn sweep(&self) -> usize {
        let running: Vec<(String, Arc<SessionProcess>)> = self
            .inner
            .read_table()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.session.status.is_terminal())
            .filter_map(|(id, entry)| entry.process.clone().map(|process| (id.clone(), process)))
            .collect();

        let mut finalized = 0;
        for (id, process) in running {
            if process.is_finalizing() {
                continue;
            }
            if process.try_exit().is_some() && self.inner.finalize(&id, &process) {
                if process.watcher_alive() {
                    debug!(session_id = %id, "sweep finalized session ahead of its watcher");
                } else {
                    warn!(session_id = %id, "sweep finalized a session without a watcher");
                }
                finalized += 1;
            }
        }
        finalized
    }

    /// Runs `sweep` (and mirror liveness refresh) every sweep interval.
    pub fn start_sweeper(&self, mirror: Option<Arc<MirrorController>>) -> LoopHandle {
        let supervisor = self.clone();
        spawn_loop("sweeper", self.inner.config.supervisor.sweep_interval(), move || {
            supervisor.sweep();
            if let Some(mirror) = &mirror {
                mirror.refresh();
            }
        })
    }

    /// Writes the retained output lines of a session to a log artifact.
    pub fn export_output(&self, session_id: &str, trace_id: &str) -> Result<Artifact, AppError> {
        let (serial, relay) = {
            let table = self.inner.read_table();
            let entry = table
                .entries
                .get(session_id)
                .ok_or_else(|| AppError::not_found(format!("Unknown session: {session_id}"), trace_id))?;
            (entry.session.serial.clone(), Arc::clone(&entry.relay))
        };

        let (path, mut file) = self
            .inner
            .artifacts
            .create_unique(ArtifactKind::Log, &serial, "export", trace_id)?;
        for event in relay.history() {
            if let OutputPayload::Line(line) = event.payload {
                writeln!(file, "{}", line.line)
                    .map_err(|err| AppError::system(format!("Failed to write export: {err}"), trace_id))?;
            }
        }
        file.flush()
            .map_err(|err| AppError::system(format!("Failed to write export: {err}"), trace_id))?;

        self.inner
            .artifacts
            .record(&path, ArtifactKind::Log, Some(session_id), Some(&serial), trace_id)?
            .ok_or_else(|| {
                let _ = fs::remove_file(&path);
                AppError::validation("Session has no output to export", trace_id)
            })
    }

    pub fn event_audit(&self, session_id: &str, trace_id: &str) -> Result<AuditReport, AppError> {
        let table = self.inner.read_table();
        let entry = table
            .entries
            .get(session_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown session: {session_id}"), trace_id))?;
        let audit = entry.audit.as_ref().ok_or_else(|| {
            AppError::validation("Event audit is only available for log streams", trace_id)
        })?;
        let report = relock(audit).report(session_id);
        Ok(report)
    }

    /// Replaces the expectations applied to log streams started from now on.
    pub fn set_expectations(&self, expectations: Vec<EventExpectation>) {
        match self.inner.expectations.write() {
            Ok(mut guard) => *guard = expectations,
            Err(poisoned) => *poisoned.into_inner() = expectations,
        }
    }

    pub fn expectations(&self) -> Vec<EventExpectation> {
        match self.inner.expectations.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Inner {
    fn read_table(&self) -> RwLockReadGuard<'_, SessionTable> {
        match self.table.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, SessionTable> {
        match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_pipeline(
        &self,
        serial: &str,
        plan: &OperationPlan,
        relay: Arc<OutputRelay>,
        trace_id: &str,
    ) -> Result<(Arc<OutputPipeline>, Option<Arc<Mutex<EventAudit>>>), AppError> {
        let mut pipeline = OutputPipeline::new(serial, relay, Arc::clone(&self.clock));
        let mut audit = None;
        match plan.feed {
            OutputFeed::Plain => {}
            OutputFeed::Matcher => {
                let expectations = match self.expectations.read() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                let matcher = LogMatcher::new(&self.config.matcher, &expectations, trace_id)?;
                audit = Some(matcher.audit_handle());
                pipeline = pipeline.with_observer(Box::new(matcher));
            }
            OutputFeed::Perf => {
                pipeline = pipeline.with_observer(Box::new(PerfSampler::new()));
            }
        }
        if let ArtifactPlan::Tee { local, .. } = &plan.artifact {
            pipeline = pipeline.with_tee(local, trace_id)?;
        }
        Ok((Arc::new(pipeline), audit))
    }

    /// Moves an exited session to its terminal state. Only the first caller
    /// per session does the work; returns whether this call did.
    /// A process that has not exited is never finalized, so a session
    /// whose stop failed keeps its slot until the process is gone.
    fn finalize(&self, session_id: &str, process: &SessionProcess) -> bool {
        let Some(exit) = process.try_exit() else {
            return false;
        };
        if !process.claim_finalization() {
            return false;
        }
        process.join_readers(READER_DRAIN_TIMEOUT);

        let (serial, kind, trace_id, relay, pipeline, plan) = {
            let table = self.read_table();
            let Some(entry) = table.entries.get(session_id) else {
                process.mark_finalized();
                return true;
            };
            (
                entry.session.serial.clone(),
                entry.session.kind,
                entry.session.trace_id.clone(),
                Arc::clone(&entry.relay),
                entry.pipeline.clone(),
                entry.plan.clone(),
            )
        };
        if let Some(pipeline) = &pipeline {
            pipeline.finish();
        }

        let exit_code = exit.code;
        let status = if process.stop_requested() {
            SessionStatus::Cancelled
        } else if exit_code == Some(0) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };

        let mut diagnostics = Vec::new();
        if status == SessionStatus::Failed {
            diagnostics = relay.tail_lines(self.config.supervisor.diagnostic_lines);
            diagnostics.push(exit.summary());
        }

        let artifact = plan.and_then(|plan| {
            self.collect_artifact(session_id, &serial, &plan.artifact, status, &trace_id, &mut diagnostics)
        });

        info!(
            trace_id = %trace_id,
            session_id = %session_id,
            serial = %serial,
            kind = %kind,
            status = ?status,
            exit_code = ?exit_code,
            "session finished"
        );
        self.complete(session_id, status, exit_code, diagnostics, artifact);
        process.mark_finalized();
        true
    }

    fn collect_artifact(
        &self,
        session_id: &str,
        serial: &str,
        plan: &ArtifactPlan,
        status: SessionStatus,
        trace_id: &str,
        diagnostics: &mut Vec<String>,
    ) -> Option<String> {
        let (local, kind) = match plan {
            ArtifactPlan::Tee { local, kind } => (local, *kind),
            ArtifactPlan::Pulled { remote, local, kind } => {
                if status == SessionStatus::Failed {
                    return None;
                }
                let local_arg = local.to_string_lossy().to_string();
                let pull = LaunchSpec::new(
                    self.adb_program.as_str(),
                    adb_args(Some(serial), ["pull", remote.as_str(), local_arg.as_str()]),
                );
                match self.launcher.run(&pull, self.config.command_timeout(), trace_id) {
                    Ok(output) if output.success() => {}
                    Ok(output) => {
                        warn!(trace_id = %trace_id, session_id = %session_id, stderr = %output.error_summary(), "artifact pull failed");
                        diagnostics.push(format!("artifact pull failed: {}", output.error_summary()));
                        return None;
                    }
                    Err(err) => {
                        warn!(trace_id = %trace_id, session_id = %session_id, error = %err, "artifact pull failed");
                        diagnostics.push(format!("artifact pull failed: {}", err.error));
                        return None;
                    }
                }
                let cleanup = LaunchSpec::new(
                    self.adb_program.as_str(),
                    adb_args(Some(serial), ["shell", "rm", "-f", remote.as_str()]),
                );
                if let Err(err) = self.launcher.run(&cleanup, self.config.command_timeout(), trace_id) {
                    warn!(trace_id = %trace_id, session_id = %session_id, error = %err, "failed to remove device temp file");
                }
                (local, *kind)
            }
        };

        match self
            .artifacts
            .record(local, kind, Some(session_id), Some(serial), trace_id)
        {
            Ok(Some(artifact)) => Some(artifact.path),
            Ok(None) => {
                let _ = fs::remove_file(local);
                None
            }
            Err(err) => {
                warn!(trace_id = %trace_id, session_id = %session_id, error = %err, "failed to record artifact");
                None
            }
        }
    }

    /// Writes the terminal state, frees the (serial, kind) slot and emits
    /// the end sentinel, in that order.
    fn complete(
        &self,
        session_id: &str,
        status: SessionStatus,
        exit_code: Option<i32>,
        diagnostics: Vec<String>,
        artifact: Option<String>,
    ) {
        let relay = {
            let mut table = self.write_table();
            let SessionTable { entries, active } = &mut *table;
            let Some(entry) = entries.get_mut(session_id) else {
                return;
            };
            entry.session.status = status;
            entry.session.ended_at = Some(self.clock.now());
            entry.session.exit_code = exit_code;
            entry.session.diagnostics = diagnostics;
            entry.session.artifact = artifact;
            entry.pipeline = None;
            let slot = (entry.session.serial.clone(), entry.session.kind);
            if active.get(&slot).map(String::as_str) == Some(session_id) {
                active.remove(&slot);
            }
            Arc::clone(&entry.relay)
        };
        relay.close(OutputPayload::End { status, exit_code });
    }
}

/// Per-session watcher: polls for exit, drives time-based pipeline flushes
/// and finalizes the session once the process is gone.
fn watch_session(inner: Weak<Inner>, session_id: String, process: Arc<SessionProcess>) {
    loop {
        if process.is_finalizing() {
            return;
        }
        if process.try_exit().is_some() {
            if let Some(inner) = inner.upgrade() {
                inner.finalize(&session_id, &process);
            }
            return;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let pipeline = inner
            .read_table()
            .entries
            .get(&session_id)
            .and_then(|entry| entry.pipeline.clone());
        drop(inner);
        if let Some(pipeline) = pipeline {
            pipeline.tick();
        }
        thread::sleep(WATCH_INTERVAL);
    }
}


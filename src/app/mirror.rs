use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app::adb::launcher::{LaunchSpec, ProcessLauncher};
use crate::app::adb::scrcpy::build_scrcpy_args;
use crate::app::clock::Clock;
use crate::app::config::ScrcpySettings;
use crate::app::error::AppError;
use crate::app::models::{MirrorState, MirrorStatus, ScrcpyInfo};
use crate::app::scheduler::relock;
use crate::app::supervisor::process::send_sigterm;

struct MirrorEntry {
    state: MirrorState,
    child: Option<Child>,
    pid: Option<u32>,
    since: DateTime<Utc>,
}

impl MirrorEntry {
    fn status(&self, serial: &str) -> MirrorStatus {
        MirrorStatus {
            serial: serial.to_string(),
            state: self.state,
            pid: self.pid,
            since: self.since,
        }
    }
}

/// Per-device scrcpy windows.
///
/// Each device moves through `stopped → starting → running → stopping →
/// stopped`. The controller only knows about processes it launched; a
/// window closed by the user is noticed on the next `refresh`.
pub struct MirrorController {
    launcher: Arc<dyn ProcessLauncher>,
    clock: Arc<dyn Clock>,
    settings: ScrcpySettings,
    scrcpy: ScrcpyInfo,
    stop_grace: Duration,
    entries: Mutex<HashMap<String, MirrorEntry>>,
}

impl MirrorController {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        clock: Arc<dyn Clock>,
        settings: ScrcpySettings,
        scrcpy: ScrcpyInfo,
        stop_grace: Duration,
    ) -> Self {
        Self {
            launcher,
            clock,
            settings,
            scrcpy,
            stop_grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn scrcpy(&self) -> &ScrcpyInfo {
        &self.scrcpy
    }

    pub fn start_mirror(&self, serial: &str, trace_id: &str) -> Result<MirrorStatus, AppError> {
        let serial = serial.trim();
        if serial.is_empty() {
            return Err(AppError::validation("serial is required", trace_id));
        }
        if !self.scrcpy.available {
            return Err(AppError::dependency("scrcpy is not available", trace_id));
        }

        {
            let mut entries = relock(&self.entries);
            if let Some(entry) = entries.get(serial) {
                if entry.state != MirrorState::Stopped {
                    return Err(AppError::conflict(
                        format!("Mirror for {serial} is already active ({:?})", entry.state),
                        trace_id,
                    ));
                }
            }
            entries.insert(
                serial.to_string(),
                MirrorEntry {
                    state: MirrorState::Starting,
                    child: None,
                    pid: None,
                    since: self.clock.now(),
                },
            );
        }

        let spec = LaunchSpec::new(
            self.scrcpy.command_path.as_str(),
            build_scrcpy_args(serial, &self.settings, self.scrcpy.major_version),
        );
        let spawned = self.launcher.spawn(&spec, trace_id);

        let mut entries = relock(&self.entries);
        let now = self.clock.now();
        match spawned {
            Ok(mut child) => {
                drain_output(serial, &mut child);
                let pid = child.id();
                let entry = MirrorEntry {
                    state: MirrorState::Running,
                    child: Some(child),
                    pid: Some(pid),
                    since: now,
                };
                let status = entry.status(serial);
                entries.insert(serial.to_string(), entry);
                info!(trace_id = %trace_id, serial = %serial, pid, command = %spec.display(), "mirror started");
                Ok(status)
            }
            Err(err) => {
                entries.insert(
                    serial.to_string(),
                    MirrorEntry {
                        state: MirrorState::Stopped,
                        child: None,
                        pid: None,
                        since: now,
                    },
                );
                warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to start mirror");
                Err(err)
            }
        }
    }

    /// Closes the mirror window. Stopping a stopped mirror is a no-op.
    pub fn stop_mirror(&self, serial: &str, trace_id: &str) -> Result<MirrorStatus, AppError> {
        let serial = serial.trim();
        let child = {
            let mut entries = relock(&self.entries);
            let Some(entry) = entries.get_mut(serial) else {
                return Ok(self.stopped(serial));
            };
            match entry.state {
                MirrorState::Stopped | MirrorState::Stopping => return Ok(entry.status(serial)),
                MirrorState::Starting => {
                    return Err(AppError::conflict(
                        format!("Mirror for {serial} is still starting"),
                        trace_id,
                    ))
                }
                MirrorState::Running => {}
            }
            entry.state = MirrorState::Stopping;
            entry.since = self.clock.now();
            entry.child.take()
        };

        if let Some(mut child) = child {
            if !terminate_child(&mut child, self.stop_grace) {
                warn!(trace_id = %trace_id, serial = %serial, "mirror process did not exit after kill");
            }
        }

        let mut entries = relock(&self.entries);
        let entry = MirrorEntry {
            state: MirrorState::Stopped,
            child: None,
            pid: None,
            since: self.clock.now(),
        };
        let status = entry.status(serial);
        entries.insert(serial.to_string(), entry);
        info!(trace_id = %trace_id, serial = %serial, "mirror stopped");
        Ok(status)
    }

    pub fn status(&self, serial: &str) -> MirrorStatus {
        relock(&self.entries)
            .get(serial)
            .map(|entry| entry.status(serial))
            .unwrap_or_else(|| self.stopped(serial))
    }

    pub fn list(&self) -> Vec<MirrorStatus> {
        let mut statuses: Vec<MirrorStatus> = relock(&self.entries)
            .iter()
            .map(|(serial, entry)| entry.status(serial))
            .collect();
        statuses.sort_by(|a, b| a.serial.cmp(&b.serial));
        statuses
    }

    /// Moves mirrors whose process has exited back to stopped. Returns how
    /// many changed.
    pub fn refresh(&self) -> usize {
        let now = self.clock.now();
        let mut changed = 0;
        for (serial, entry) in relock(&self.entries).iter_mut() {
            if entry.state != MirrorState::Running {
                continue;
            }
            let exited = match entry.child.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => {
                    debug!(serial = %serial, status = %status, "mirror process exited");
                    true
                }
                Some(Ok(None)) => false,
                Some(Err(err)) => {
                    warn!(serial = %serial, error = %err, "failed to poll mirror process");
                    false
                }
                None => true,
            };
            if exited {
                entry.state = MirrorState::Stopped;
                entry.child = None;
                entry.pid = None;
                entry.since = now;
                changed += 1;
                info!(serial = %serial, "mirror window closed");
            }
        }
        changed
    }

    pub fn stop_all(&self, trace_id: &str) {
        let running: Vec<String> = relock(&self.entries)
            .iter()
            .filter(|(_, entry)| entry.state == MirrorState::Running)
            .map(|(serial, _)| serial.clone())
            .collect();
        for serial in running {
            if let Err(err) = self.stop_mirror(&serial, trace_id) {
                warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to stop mirror on shutdown");
            }
        }
    }

    fn stopped(&self, serial: &str) -> MirrorStatus {
        MirrorStatus {
            serial: serial.to_string(),
            state: MirrorState::Stopped,
            pid: None,
            since: self.clock.now(),
        }
    }
}

fn terminate_child(child: &mut Child, grace: Duration) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return true;
    }
    if send_sigterm(child.id()) {
        let start = Instant::now();
        while start.elapsed() < grace {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
    let _ = child.kill();
    child.wait().is_ok()
}

/// scrcpy logs continuously; unread pipes would eventually block it.
fn drain_output(serial: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        spawn_drain(serial, stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_drain(serial, stderr);
    }
}

fn spawn_drain<R: Read + Send + 'static>(serial: &str, pipe: R) {
    let serial = serial.to_string();
    let spawned = thread::Builder::new()
        .name("mirror-output".to_string())
        .spawn(move || {
            for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                debug!(serial = %serial, line = %line, "scrcpy");
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to spawn mirror output reader");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::adb::runner::CommandOutput;
    use crate::app::clock::SystemClock;
    use crate::app::error::{ERR_CONFLICT, ERR_DEPENDENCY};
    use std::process::{Command, Stdio};

    struct ScriptLauncher {
        script: String,
        spawned: Mutex<Vec<LaunchSpec>>,
    }

    impl ScriptLauncher {
        fn new(script: &str) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_string(),
                spawned: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessLauncher for ScriptLauncher {
        fn spawn(&self, spec: &LaunchSpec, trace_id: &str) -> Result<Child, AppError> {
            relock(&self.spawned).push(spec.clone());
            Command::new("sh")
                .arg("-c")
                .arg(&self.script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| AppError::system(err.to_string(), trace_id))
        }

        fn run(&self, _spec: &LaunchSpec, _timeout: Duration, trace_id: &str) -> Result<CommandOutput, AppError> {
            Err(AppError::system("not used", trace_id))
        }
    }

    fn scrcpy(available: bool) -> ScrcpyInfo {
        ScrcpyInfo {
            available,
            version_output: "scrcpy 2.4".to_string(),
            major_version: 2,
            command_path: "scrcpy".to_string(),
        }
    }

    fn controller(launcher: Arc<ScriptLauncher>, available: bool) -> MirrorController {
        MirrorController::new(
            launcher,
            Arc::new(SystemClock),
            ScrcpySettings::default(),
            scrcpy(available),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn start_stop_walks_the_state_machine() {
        let launcher = ScriptLauncher::new("exec sleep 30");
        let mirror = controller(Arc::clone(&launcher), true);
        assert_eq!(mirror.status("ABC").state, MirrorState::Stopped);

        let running = mirror.start_mirror("ABC", "trace-m1").expect("start");
        assert_eq!(running.state, MirrorState::Running);
        assert!(running.pid.is_some());
        let spawned = relock(&launcher.spawned).clone();
        assert_eq!(spawned[0].program, "scrcpy");
        assert_eq!(&spawned[0].args[..2], &["-s", "ABC"]);

        let err = mirror.start_mirror("ABC", "trace-m2").expect_err("already running");
        assert!(err.is(ERR_CONFLICT));

        let stopped = mirror.stop_mirror("ABC", "trace-m3").expect("stop");
        assert_eq!(stopped.state, MirrorState::Stopped);
        assert!(stopped.pid.is_none());
        let again = mirror.stop_mirror("ABC", "trace-m4").expect("no-op");
        assert_eq!(again.state, MirrorState::Stopped);

        mirror.start_mirror("ABC", "trace-m5").expect("restart");
        mirror.stop_all("trace-m6");
        assert_eq!(mirror.status("ABC").state, MirrorState::Stopped);
    }

    #[test]
    fn refresh_notices_closed_windows() {
        let mirror = controller(ScriptLauncher::new("exit 0"), true);
        mirror.start_mirror("ABC", "trace-m7").expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut changed = 0;
        while changed == 0 && Instant::now() < deadline {
            changed = mirror.refresh();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(changed, 1);
        assert_eq!(mirror.status("ABC").state, MirrorState::Stopped);
        assert_eq!(mirror.refresh(), 0);
    }

    #[test]
    fn missing_scrcpy_is_a_dependency_error() {
        let mirror = controller(ScriptLauncher::new("exit 0"), false);
        let err = mirror.start_mirror("ABC", "trace-m8").expect_err("unavailable");
        assert!(err.is(ERR_DEPENDENCY));
        assert!(mirror.list().is_empty());
    }
}

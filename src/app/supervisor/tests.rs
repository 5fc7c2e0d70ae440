#![cfg(unix)]

use super::*;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tempfile::TempDir;

use crate::app::adb::runner::CommandOutput;
use crate::app::clock::SystemClock;
use crate::app::error::{ERR_CONFLICT, ERR_DEVICE_NOT_FOUND, ERR_TOOL_UNAVAILABLE};
use crate::app::models::{DeviceSummary, MatchKind, PatternMatch};
use crate::app::registry::DeviceSource;

const IDLE_SCRIPT: &str = "exec sleep 30";

/// Runs `sh -c` scripts in place of adb. The script is picked by the first
/// needle found among the launch arguments.
#[derive(Default)]
struct FakeLauncher {
    scripts: Mutex<Vec<(String, String)>>,
    runs: Mutex<Vec<LaunchSpec>>,
    fail_spawn: AtomicBool,
    spawn_delay: Duration,
}

impl FakeLauncher {
    fn with_script(self, needle: &str, script: &str) -> Self {
        relock(&self.scripts).push((needle.to_string(), script.to_string()));
        self
    }

    fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    fn runs_containing(&self, needle: &str) -> Vec<LaunchSpec> {
        relock(&self.runs)
            .iter()
            .filter(|spec| spec.args.iter().any(|arg| arg == needle))
            .cloned()
            .collect()
    }

    fn script_for(&self, spec: &LaunchSpec) -> String {
        relock(&self.scripts)
            .iter()
            .find(|(needle, _)| spec.args.iter().any(|arg| arg.contains(needle.as_str())))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| IDLE_SCRIPT.to_string())
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, spec: &LaunchSpec, trace_id: &str) -> Result<Child, AppError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(AppError::tool_unavailable("adb not found", trace_id));
        }
        thread::sleep(self.spawn_delay);
        Command::new("sh")
            .arg("-c")
            .arg(self.script_for(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::system(err.to_string(), trace_id))
    }

    fn run(&self, spec: &LaunchSpec, _timeout: Duration, _trace_id: &str) -> Result<CommandOutput, AppError> {
        relock(&self.runs).push(spec.clone());
        if spec.args.iter().any(|arg| arg == "pull") {
            if let Some(local) = spec.args.last() {
                std::fs::write(local, b"payload").expect("write pulled file");
            }
        }
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

struct StaticSource(Vec<String>);

impl DeviceSource for StaticSource {
    fn enumerate(&self, _trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
        Ok(self
            .0
            .iter()
            .map(|serial| DeviceSummary {
                serial: serial.clone(),
                state: "device".to_string(),
                model: None,
                product: None,
                device: None,
                transport_id: None,
            })
            .collect())
    }
}

/// Reports each serial with its own adb state.
struct StateSource(Vec<(&'static str, &'static str)>);

impl DeviceSource for StateSource {
    fn enumerate(&self, _trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
        Ok(self
            .0
            .iter()
            .map(|(serial, state)| DeviceSummary {
                serial: serial.to_string(),
                state: state.to_string(),
                model: None,
                product: None,
                device: None,
                transport_id: None,
            })
            .collect())
    }
}

struct Fixture {
    _dir: TempDir,
    launcher: Arc<FakeLauncher>,
    artifacts: Arc<ArtifactStore>,
    supervisor: SessionSupervisor,
}

fn fixture(launcher: FakeLauncher) -> Fixture {
    fixture_with_registry(launcher, None)
}

fn fixture_with_registry(launcher: FakeLauncher, registry: Option<Arc<DeviceRegistry>>) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let artifacts = Arc::new(ArtifactStore::open(dir.path(), "trace-fx").expect("store"));
    let mut config = AppConfig::default();
    config.supervisor.stop_grace_ms = 500;
    let launcher = Arc::new(launcher);
    let supervisor = SessionSupervisor::new(
        launcher.clone(),
        registry,
        Arc::clone(&artifacts),
        Arc::new(SystemClock),
        config,
        "adb".to_string(),
    );
    Fixture {
        _dir: dir,
        launcher,
        artifacts,
        supervisor,
    }
}

fn wait_for_terminal(supervisor: &SessionSupervisor, session_id: &str) -> Session {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let session = supervisor.status(session_id).expect("session exists");
        if session.status.is_terminal() {
            return session;
        }
        assert!(Instant::now() < deadline, "session {session_id} never finished");
        thread::sleep(Duration::from_millis(20));
    }
}

fn lines_of(events: &[crate::app::models::OutputEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            OutputPayload::Line(line) => Some(line.line.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn concurrent_starts_of_same_kind_yield_one_session_and_one_conflict() {
    let fx = fixture(FakeLauncher::default());
    let results: Vec<Result<Session, AppError>> = (0..2)
        .map(|index| {
            let supervisor = fx.supervisor.clone();
            thread::spawn(move || {
                supervisor.start("ABC", OperationKind::Record, SessionParams::default(), &format!("trace-c{index}"))
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();

    let started: Vec<&Session> = results.iter().filter_map(|result| result.as_ref().ok()).collect();
    let conflicts = results
        .iter()
        .filter(|result| matches!(result, Err(err) if err.is(ERR_CONFLICT)))
        .count();
    assert_eq!(started.len(), 1);
    assert_eq!(conflicts, 1);
    assert_eq!(started[0].status, SessionStatus::Running);

    fx.supervisor.stop_all("trace-c-end");
    assert!(fx
        .supervisor
        .list_sessions(Some("ABC"))
        .iter()
        .all(|session| session.status.is_terminal()));
}

#[test]
fn different_kinds_run_side_by_side_on_one_device() {
    let fx = fixture(FakeLauncher::default());
    let record = fx
        .supervisor
        .start("ABC", OperationKind::Record, SessionParams::default(), "trace-k1")
        .expect("record");
    let logs = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-k2")
        .expect("log stream");
    assert_ne!(record.id, logs.id);
    assert_eq!(fx.supervisor.list_sessions(Some("ABC")).len(), 2);
    assert!(fx.supervisor.list_sessions(Some("OTHER")).is_empty());

    fx.supervisor.stop_all("trace-k3");
}

#[test]
fn stop_is_idempotent_and_unknown_ids_are_a_no_op() {
    let fx = fixture(FakeLauncher::default());
    let session = fx
        .supervisor
        .start("ABC", OperationKind::PerfSample, SessionParams::default(), "trace-s1")
        .expect("start");

    let first = fx.supervisor.stop(&session.id, "trace-s2").expect("stop").expect("known");
    assert_eq!(first.status, SessionStatus::Cancelled);
    assert!(first.ended_at.is_some());

    let second = fx.supervisor.stop(&session.id, "trace-s3").expect("stop again").expect("known");
    assert_eq!(second, first);

    assert!(fx.supervisor.stop("no-such-session", "trace-s4").expect("unknown").is_none());
}

#[test]
fn non_zero_exit_fails_with_output_tail_and_exit_description() {
    let fx = fixture(FakeLauncher::default().with_script("logcat", "echo warming up; echo boom >&2; exit 3"));
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-f1")
        .expect("start");

    let finished = wait_for_terminal(&fx.supervisor, &session.id);
    assert_eq!(finished.status, SessionStatus::Failed);
    assert_eq!(finished.exit_code, Some(3));
    assert!(finished.diagnostics.iter().any(|line| line == "boom"));
    assert_eq!(
        finished.diagnostics.last().map(String::as_str),
        Some("process exited with code 3")
    );
}

#[test]
fn stopping_a_recording_pulls_and_records_the_file() {
    let fx = fixture(FakeLauncher::default());
    let session = fx
        .supervisor
        .start("ABC", OperationKind::Record, SessionParams::default(), "trace-r1")
        .expect("start");

    let stopped = fx.supervisor.stop(&session.id, "trace-r2").expect("stop").expect("known");
    assert_eq!(stopped.status, SessionStatus::Cancelled);

    let pkill = fx.launcher.runs_containing("pkill");
    assert_eq!(pkill.len(), 1);
    assert!(pkill[0].args.iter().any(|arg| arg == "screenrecord"));
    assert_eq!(fx.launcher.runs_containing("pull").len(), 1);
    assert_eq!(fx.launcher.runs_containing("rm").len(), 1);

    let artifacts = fx.artifacts.find_by_session(&session.id);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, ArtifactKind::Recording);
    assert_eq!(artifacts[0].mime_type, "video/mp4");
    assert_eq!(stopped.artifact.as_deref(), Some(artifacts[0].path.as_str()));
}

#[test]
fn clean_exit_completes_and_keeps_the_teed_log() {
    let fx = fixture(FakeLauncher::default().with_script("monkey", "echo line one; echo line two; exit 0"));
    let params = SessionParams {
        package: Some("com.example.app".to_string()),
        ..SessionParams::default()
    };
    let session = fx
        .supervisor
        .start("ABC", OperationKind::MonkeyRun, params, "trace-m1")
        .expect("start");

    let finished = wait_for_terminal(&fx.supervisor, &session.id);
    assert_eq!(finished.status, SessionStatus::Completed);
    assert_eq!(finished.exit_code, Some(0));
    assert!(finished.diagnostics.is_empty());
    let path = finished.artifact.expect("log artifact");
    assert_eq!(std::fs::read_to_string(path).expect("read log"), "line one\nline two\n");
    assert!(fx.launcher.runs_containing("pkill").is_empty());
}

#[test]
fn subscribers_see_lines_in_order_then_the_end_sentinel() {
    let fx = fixture(FakeLauncher::default().with_script("logcat", "for i in 1 2 3; do echo n$i; done; exit 0"));
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-o1")
        .expect("start");

    let events: Vec<_> = fx.supervisor.subscribe(&session.id, true, "trace-o2").expect("subscribe").collect();
    assert_eq!(lines_of(&events), vec!["n1", "n2", "n3"]);
    assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    match &events.last().expect("events").payload {
        OutputPayload::End { status, exit_code } => {
            assert_eq!(*status, SessionStatus::Completed);
            assert_eq!(*exit_code, Some(0));
        }
        other => panic!("expected end sentinel, got {other:?}"),
    }

    let err = fx.supervisor.subscribe("missing", true, "trace-o3").err().expect("unknown session");
    assert_eq!(err.code, "ERR_NOT_FOUND");
}

#[test]
fn start_rejects_devices_the_registry_does_not_know() {
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(StaticSource(vec!["ABC".to_string()])),
        Arc::new(SystemClock),
        3,
    ));
    registry.poll("trace-u0");
    let fx = fixture_with_registry(FakeLauncher::default(), Some(registry));

    let err = fx
        .supervisor
        .start("XYZ", OperationKind::Record, SessionParams::default(), "trace-u1")
        .expect_err("unknown device");
    assert!(err.is(ERR_DEVICE_NOT_FOUND));
    assert!(fx.supervisor.list_sessions(None).is_empty());

    let session = fx
        .supervisor
        .start("ABC", OperationKind::Record, SessionParams::default(), "trace-u2")
        .expect("known device");
    fx.supervisor.stop(&session.id, "trace-u3").expect("stop");
}

#[test]
fn start_rejects_devices_that_are_not_online() {
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(StateSource(vec![("ABC", "device"), ("LOCKED", "unauthorized"), ("GONE", "offline")])),
        Arc::new(SystemClock),
        3,
    ));
    registry.poll("trace-n0");
    let fx = fixture_with_registry(FakeLauncher::default(), Some(registry));

    for serial in ["LOCKED", "GONE"] {
        let err = fx
            .supervisor
            .start(serial, OperationKind::LogStream, SessionParams::default(), "trace-n1")
            .expect_err("device not online");
        assert!(err.is(ERR_DEVICE_NOT_FOUND));
    }
    assert!(fx.supervisor.list_sessions(None).is_empty());

    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-n2")
        .expect("online device");
    fx.supervisor.stop(&session.id, "trace-n3").expect("stop");
}

#[test]
fn stop_during_a_slow_start_terminates_the_process() {
    let fx = fixture(FakeLauncher::default().with_spawn_delay(Duration::from_millis(400)));
    let supervisor = fx.supervisor.clone();
    let starter = thread::spawn(move || {
        supervisor.start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-p1")
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let pending = loop {
        if let Some(session) = fx.supervisor.list_sessions(Some("ABC")).into_iter().next() {
            break session;
        }
        assert!(Instant::now() < deadline, "session never registered");
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(pending.status, SessionStatus::Pending);

    let stopped = fx
        .supervisor
        .stop(&pending.id, "trace-p2")
        .expect("stop")
        .expect("known session");
    assert_eq!(stopped.status, SessionStatus::Cancelled);

    let started = starter.join().expect("start thread").expect("start");
    assert_eq!(started.id, pending.id);
    assert!(fx.supervisor.list_sessions(None).iter().all(|session| session.status.is_terminal()));
    fx.supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-p3")
        .map(|session| fx.supervisor.stop(&session.id, "trace-p4"))
        .expect("slot is free")
        .expect("stop");
}

#[test]
fn live_process_is_not_finalized_even_after_a_stop_request() {
    let fx = fixture(FakeLauncher::default());
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-l1")
        .expect("start");
    let process = fx
        .supervisor
        .inner
        .read_table()
        .entries
        .get(&session.id)
        .and_then(|entry| entry.process.clone())
        .expect("attached process");

    // A stop whose terminate gave up leaves the request flag set.
    assert!(process.request_stop());
    assert!(!fx.supervisor.inner.finalize(&session.id, &process));
    assert_eq!(fx.supervisor.sweep(), 0);
    assert_eq!(
        fx.supervisor.status(&session.id).expect("session").status,
        SessionStatus::Running
    );
    let err = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-l2")
        .expect_err("slot still held");
    assert!(err.is(ERR_CONFLICT));

    let stopped = fx
        .supervisor
        .stop(&session.id, "trace-l3")
        .expect("retried stop")
        .expect("known session");
    assert_eq!(stopped.status, SessionStatus::Cancelled);
    assert!(process.try_exit().is_some());
}

#[test]
fn spawn_failure_marks_session_failed_and_frees_the_slot() {
    let fx = fixture(FakeLauncher::default());
    fx.launcher.fail_spawn.store(true, Ordering::SeqCst);

    let err = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-x1")
        .expect_err("spawn fails");
    assert!(err.is(ERR_TOOL_UNAVAILABLE));

    let sessions = fx.supervisor.list_sessions(Some("ABC"));
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert!(sessions[0].artifact.is_none());

    fx.launcher.fail_spawn.store(false, Ordering::SeqCst);
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-x2")
        .expect("slot is free again");
    fx.supervisor.stop(&session.id, "trace-x3").expect("stop");
}

#[test]
fn log_stream_reports_crashes_and_audits_expectations() {
    let script = "printf '%s\\n' \
        '10-16 12:00:00.000  1234  1234 E AndroidRuntime: FATAL EXCEPTION: main' \
        '10-16 12:00:00.001  1234  1234 E AndroidRuntime: java.lang.IllegalStateException: boom' \
        '10-16 12:00:00.002  1234  1234 E AndroidRuntime: \tat com.example.Main.run(Main.java:10)' \
        '10-16 12:00:01.000   900   900 I ActivityManager: APP_READY after 120ms'; exit 0";
    let fx = fixture(FakeLauncher::default().with_script("logcat", script));
    fx.supervisor.set_expectations(vec![
        EventExpectation {
            id: Some(1),
            keyword: "APP_READY".to_string(),
            description: Some("app finished launching".to_string()),
            exact_match: false,
            created_at: None,
        },
        EventExpectation {
            id: Some(2),
            keyword: "LOGIN_OK".to_string(),
            description: None,
            exact_match: false,
            created_at: None,
        },
    ]);

    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-a1")
        .expect("start");
    let events: Vec<_> = fx.supervisor.subscribe(&session.id, true, "trace-a2").expect("subscribe").collect();

    let matches: Vec<&PatternMatch> = events
        .iter()
        .filter_map(|event| match &event.payload {
            OutputPayload::Match(found) => Some(found),
            _ => None,
        })
        .collect();
    let crash = matches
        .iter()
        .find(|found| found.kind == MatchKind::Crash)
        .expect("crash match");
    assert_eq!(crash.block.len(), 3);
    assert!(matches.iter().any(|found| found.pattern_id == "event:APP_READY"));

    let report = fx.supervisor.event_audit(&session.id, "trace-a3").expect("audit");
    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.entries[0].seen_count, 1);
    assert_eq!(report.missing, vec!["LOGIN_OK".to_string()]);

    let err = fx.supervisor.event_audit("missing", "trace-a4").expect_err("unknown");
    assert_eq!(err.code, "ERR_NOT_FOUND");
}

#[test]
fn sweep_has_nothing_left_once_watchers_finalize() {
    let fx = fixture(FakeLauncher::default().with_script("logcat", "exit 0"));
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-w1")
        .expect("start");
    wait_for_terminal(&fx.supervisor, &session.id);
    assert_eq!(fx.supervisor.sweep(), 0);
}

#[test]
fn sweep_finalizes_exited_sessions_that_have_no_watcher() {
    let mut fx = fixture(FakeLauncher::default().with_script("logcat", "echo boom >&2; exit 4"));
    fx.supervisor = fx.supervisor.without_watchers();
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-v1")
        .expect("start");

    let deadline = Instant::now() + Duration::from_secs(5);
    while fx.supervisor.sweep() == 0 {
        assert!(Instant::now() < deadline, "sweep never reconciled the exited session");
        thread::sleep(Duration::from_millis(20));
    }

    let finished = fx.supervisor.status(&session.id).expect("session");
    assert_eq!(finished.status, SessionStatus::Failed);
    assert_eq!(finished.exit_code, Some(4));
    assert!(finished.diagnostics.iter().any(|line| line.contains("boom")));
    assert_eq!(
        finished.diagnostics.last().map(String::as_str),
        Some("process exited with code 4")
    );
    assert_eq!(fx.supervisor.sweep(), 0);
}

#[test]
fn export_writes_retained_lines_to_a_log_artifact() {
    let fx = fixture(FakeLauncher::default().with_script("logcat", "echo alpha; echo beta; exit 0"));
    let session = fx
        .supervisor
        .start("ABC", OperationKind::LogStream, SessionParams::default(), "trace-e1")
        .expect("start");
    wait_for_terminal(&fx.supervisor, &session.id);

    let exported = fx.supervisor.export_output(&session.id, "trace-e2").expect("export");
    assert_eq!(exported.kind, ArtifactKind::Log);
    assert_eq!(exported.session_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(std::fs::read_to_string(&exported.path).expect("read"), "alpha\nbeta\n");

    let err = fx.supervisor.export_output("missing", "trace-e3").expect_err("unknown");
    assert_eq!(err.code, "ERR_NOT_FOUND");
}

//! Request surface shared by every front end. Each call resolves a trace id,
//! validates its inputs and wraps the result in a [`CommandResponse`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::launcher::LaunchSpec;
use crate::app::adb::locator::{normalize_command_path, resolve_adb_program, validate_program};
use crate::app::adb::scrcpy::check_scrcpy_availability;
use crate::app::config::{load_config, save_config, validate_config, AppConfig};
use crate::app::error::AppError;
use crate::app::models::{
    AdbInfo, ApkInstallResult, Artifact, ArtifactKind, AuditReport, CommandResponse, CommandResult,
    DeviceListing, EventExpectation, MirrorStatus, OperationKind, PackageRecord, ScrcpyInfo,
    Session, SessionParams,
};
use crate::app::relay::Subscription;
use crate::app::state::AppState;


const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            format!("{field} is required"),
            trace_id,
        ));
    }
    Ok(())
}

fn respond<T>(trace_id: String, data: T) -> Result<CommandResponse<T>, AppError> {
    Ok(CommandResponse { trace_id, data })
}

fn parse_kind(value: &str, trace_id: &str) -> Result<OperationKind, AppError> {
    value
        .parse::<OperationKind>()
        .map_err(|message| AppError::validation(message, trace_id))
}

fn parse_artifact_kind(value: &str, trace_id: &str) -> Result<ArtifactKind, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "screenshot" => Ok(ArtifactKind::Screenshot),
        "recording" => Ok(ArtifactKind::Recording),
        "log" => Ok(ArtifactKind::Log),
        "pcap" => Ok(ArtifactKind::Pcap),
        _ => Err(AppError::validation(
            format!("Unknown artifact kind: {value}"),
            trace_id,
        )),
    }
}

// Config

pub fn get_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config(&trace_id)?;
    respond(trace_id, config)
}

/// Persists a clamped copy. Running state keeps its settings until restart.
pub fn save_app_config(
    config: AppConfig,
    trace_id: Option<String>,
) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = validate_config(config);
    save_config(&config, &trace_id)?;
    info!(trace_id = %trace_id, "config saved");
    respond(trace_id, config)
}

pub fn reset_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = AppConfig::default();
    save_config(&config, &trace_id)?;
    info!(trace_id = %trace_id, "config reset to defaults");
    respond(trace_id, config)
}

// Tools

pub fn check_adb(
    state: &AppState,
    command_path: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<AdbInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "check_adb");

    let program = command_path
        .as_deref()
        .map(normalize_command_path)
        .filter(|value| !value.is_empty())
        .map(|value| resolve_adb_program(&value))
        .unwrap_or_else(|| state.adb_program.clone());

    if let Err(message) = validate_program(&program, "ADB") {
        warn!(trace_id = %trace_id, error = %message, "adb validation failed");
        return respond(
            trace_id,
            AdbInfo {
                available: false,
                version_output: String::new(),
                command_path: program,
                error: Some(message),
            },
        );
    }

    let spec = LaunchSpec::new(program.clone(), vec!["version".to_string()]);
    let output = match state.launcher.run(&spec, VERSION_CHECK_TIMEOUT, &trace_id) {
        Ok(output) => output,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err.error, "adb check failed");
            return respond(
                trace_id,
                AdbInfo {
                    available: false,
                    version_output: String::new(),
                    command_path: program,
                    error: Some(err.error),
                },
            );
        }
    };

    let mut version_output = output.stdout.trim().to_string();
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        if !version_output.is_empty() {
            version_output.push('\n');
        }
        version_output.push_str(stderr);
    }
    let available = output.exit_code.unwrap_or_default() == 0;
    let error = if available {
        None
    } else if stderr.is_empty() {
        Some("ADB command returned a non-zero exit code".to_string())
    } else {
        Some(stderr.to_string())
    };
    respond(
        trace_id,
        AdbInfo {
            available,
            version_output,
            command_path: program,
            error,
        },
    )
}

/// Probes the configured scrcpy again; the mirror controller keeps the
/// result it saw at startup.
pub fn check_scrcpy(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<ScrcpyInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let info = check_scrcpy_availability(&state.config.adb.scrcpy_path);
    info!(
        trace_id = %trace_id,
        available = info.available,
        major_version = info.major_version,
        "check_scrcpy"
    );
    respond(trace_id, info)
}

// Devices

pub fn list_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<DeviceListing>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    respond(trace_id, state.registry.list_devices())
}

/// Polls the bridge now instead of waiting for the next interval.
pub fn refresh_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<DeviceListing>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let listing = state.registry.refresh(&trace_id);
    respond(trace_id, listing)
}

// Sessions

pub fn start_session(
    state: &AppState,
    serial: String,
    kind: String,
    params: Option<SessionParams>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Session>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    ensure_non_empty(&kind, "kind", &trace_id)?;
    let kind = parse_kind(&kind, &trace_id)?;
    let session = state
        .supervisor
        .start(&serial, kind, params.unwrap_or_default(), &trace_id)?;
    respond(trace_id, session)
}

/// `None` in the response means the id was never known.
pub fn stop_session(
    state: &AppState,
    session_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<Option<Session>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&session_id, "session_id", &trace_id)?;
    let session = state.supervisor.stop(session_id.trim(), &trace_id)?;
    respond(trace_id, session)
}

pub fn get_session(
    state: &AppState,
    session_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<Session>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&session_id, "session_id", &trace_id)?;
    let session = state
        .supervisor
        .status(session_id.trim())
        .ok_or_else(|| AppError::not_found(format!("Unknown session: {session_id}"), &trace_id))?;
    respond(trace_id, session)
}

pub fn list_sessions(
    state: &AppState,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<Session>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let serial = serial.as_deref().map(str::trim).filter(|value| !value.is_empty());
    respond(trace_id, state.supervisor.list_sessions(serial))
}

/// Not wrapped in a response: the subscription itself is the stream.
pub fn subscribe_session(
    state: &AppState,
    session_id: &str,
    replay: bool,
    trace_id: Option<String>,
) -> Result<Subscription, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(session_id, "session_id", &trace_id)?;
    state.supervisor.subscribe(session_id.trim(), replay, &trace_id)
}

pub fn export_session_output(
    state: &AppState,
    session_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<Artifact>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&session_id, "session_id", &trace_id)?;
    let artifact = state.supervisor.export_output(session_id.trim(), &trace_id)?;
    respond(trace_id, artifact)
}

pub fn get_event_audit(
    state: &AppState,
    session_id: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<AuditReport>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&session_id, "session_id", &trace_id)?;
    let report = state.supervisor.event_audit(session_id.trim(), &trace_id)?;
    respond(trace_id, report)
}

// Artifacts

pub fn list_artifacts(
    state: &AppState,
    kind: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<Artifact>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let kind = match kind.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => Some(parse_artifact_kind(value, &trace_id)?),
        None => None,
    };
    let artifacts = state.artifacts.list(kind, &trace_id)?;
    respond(trace_id, artifacts)
}

pub fn resolve_artifact_download(
    state: &AppState,
    file_name: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<PathBuf>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&file_name, "file_name", &trace_id)?;
    let path = state.artifacts.resolve_download(file_name.trim(), &trace_id)?;
    respond(trace_id, path)
}

// Device operations

pub fn capture_screenshot(
    state: &AppState,
    serial: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<Artifact>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    let artifact = state.device_ops.capture_screenshot(serial.trim(), &trace_id)?;
    respond(trace_id, artifact)
}

pub fn run_shell(
    state: &AppState,
    serials: Vec<String>,
    command: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<CommandResult>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&command, "command", &trace_id)?;
    let serials: Vec<String> = serials
        .into_iter()
        .map(|serial| serial.trim().to_string())
        .filter(|serial| !serial.is_empty())
        .collect();
    if serials.is_empty() {
        return Err(AppError::validation("serials is required", &trace_id));
    }
    let results = state.device_ops.run_shell(&serials, &command, &trace_id)?;
    respond(trace_id, results)
}

pub fn send_text(
    state: &AppState,
    serial: String,
    text: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    ensure_non_empty(&text, "text", &trace_id)?;
    state.device_ops.send_text(serial.trim(), &text, &trace_id)?;
    respond(trace_id, true)
}

pub fn push_file(
    state: &AppState,
    serial: String,
    local_path: String,
    device_path: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<CommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    ensure_non_empty(&local_path, "local_path", &trace_id)?;
    ensure_non_empty(&device_path, "device_path", &trace_id)?;
    let result = state.device_ops.push_file(
        serial.trim(),
        Path::new(local_path.trim()),
        device_path.trim(),
        &trace_id,
    )?;
    respond(trace_id, result)
}

pub fn install_apk(
    state: &AppState,
    serial: String,
    apk_path: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<ApkInstallResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    ensure_non_empty(&apk_path, "apk_path", &trace_id)?;
    let result = state
        .device_ops
        .install_apk(serial.trim(), apk_path.trim(), &trace_id)?;
    respond(trace_id, result)
}

pub fn clear_logcat(
    state: &AppState,
    serial: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<bool>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    state.device_ops.clear_logcat(serial.trim(), &trace_id)?;
    respond(trace_id, true)
}

// Rules

pub fn list_expectations(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<EventExpectation>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let rules = state.rules.list_expectations(&trace_id)?;
    respond(trace_id, rules)
}

/// Stores the new rule set and hands it to the supervisor. Sessions already
/// running keep the rules they started with.
pub fn replace_expectations(
    state: &AppState,
    rules: Vec<EventExpectation>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<EventExpectation>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let stored = state.rules.replace_expectations(&rules, &trace_id)?;
    state.supervisor.set_expectations(stored.clone());
    respond(trace_id, stored)
}

pub fn list_packages(
    state: &AppState,
    limit: Option<usize>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<PackageRecord>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let packages = state.rules.list_packages(limit.unwrap_or(0), &trace_id)?;
    respond(trace_id, packages)
}

pub fn touch_package(
    state: &AppState,
    package_name: String,
    activity_name: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<PackageRecord>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&package_name, "package_name", &trace_id)?;
    let record = state
        .rules
        .touch_package(&package_name, activity_name.as_deref(), &trace_id)?;
    respond(trace_id, record)
}

// Mirror

pub fn start_mirror(
    state: &AppState,
    serial: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<MirrorStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    let serial = serial.trim();
    if !state.registry.is_online(serial) {
        return Err(AppError::device_not_found(serial, &trace_id));
    }
    let status = state.mirror.start_mirror(serial, &trace_id)?;
    respond(trace_id, status)
}

pub fn stop_mirror(
    state: &AppState,
    serial: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<MirrorStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    let status = state.mirror.stop_mirror(serial.trim(), &trace_id)?;
    respond(trace_id, status)
}

/// One serial, or every tracked mirror when `serial` is empty.
pub fn mirror_status(
    state: &AppState,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<MirrorStatus>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let statuses = match serial.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(serial) => vec![state.mirror.status(serial)],
        None => state.mirror.list(),
    };
    respond(trace_id, statuses)
}

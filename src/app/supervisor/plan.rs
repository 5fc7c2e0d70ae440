use std::path::PathBuf;

use crate::app::adb::launcher::LaunchSpec;
use crate::app::adb::runner::adb_args;
use crate::app::artifacts::ArtifactStore;
use crate::app::config::{clamp_perf_interval_ms, AppConfig};
use crate::app::error::AppError;
use crate::app::models::{ArtifactKind, OperationKind, SessionParams};
use crate::app::perf::parse::build_perf_loop_script;

/// Where a session's artifact comes from once the process is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPlan {
    /// Written on the device, pulled after the process exits.
    Pulled {
        remote: String,
        local: PathBuf,
        kind: ArtifactKind,
    },
    /// Process output copied to a local file while it runs.
    Tee { local: PathBuf, kind: ArtifactKind },
}

/// Which derived events the output pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFeed {
    Plain,
    Matcher,
    Perf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPlan {
    pub spec: LaunchSpec,
    /// Device-side command asking the operation to wind down on its own.
    pub remote_stop: Option<LaunchSpec>,
    pub artifact: ArtifactPlan,
    pub feed: OutputFeed,
}

pub fn plan_operation(
    kind: OperationKind,
    serial: &str,
    params: &SessionParams,
    config: &AppConfig,
    adb_program: &str,
    artifacts: &ArtifactStore,
    trace_id: &str,
) -> Result<OperationPlan, AppError> {
    let adb = |rest: Vec<String>| LaunchSpec::new(adb_program, adb_args(Some(serial), rest));
    let shell = |rest: &[&str]| {
        adb(std::iter::once("shell")
            .chain(rest.iter().copied())
            .map(str::to_string)
            .collect())
    };

    let plan = match kind {
        OperationKind::Record => {
            let local = artifacts.allocate_path(ArtifactKind::Recording, serial, "record");
            let remote = remote_path_for(&local);
            let mut args = vec!["shell".to_string(), "screenrecord".to_string()];
            args.extend(screenrecord_options(config, params));
            args.push(remote.clone());
            OperationPlan {
                spec: adb(args),
                remote_stop: Some(shell(&["pkill", "-SIGINT", "screenrecord"])),
                artifact: ArtifactPlan::Pulled {
                    remote,
                    local,
                    kind: ArtifactKind::Recording,
                },
                feed: OutputFeed::Plain,
            }
        }
        OperationKind::LogStream => {
            let mut args = vec!["logcat".to_string(), "-v".to_string(), "threadtime".to_string()];
            if let Some(filter) = params.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                args.extend(filter.split_whitespace().map(str::to_string));
            }
            OperationPlan {
                spec: adb(args),
                remote_stop: None,
                artifact: ArtifactPlan::Tee {
                    local: artifacts.allocate_path(ArtifactKind::Log, serial, "logcat"),
                    kind: ArtifactKind::Log,
                },
                feed: OutputFeed::Matcher,
            }
        }
        OperationKind::PerfSample => {
            let interval = clamp_perf_interval_ms(params.interval_ms.or(Some(config.perf.interval_ms)));
            OperationPlan {
                spec: adb(vec!["shell".to_string(), build_perf_loop_script(interval)]),
                remote_stop: None,
                artifact: ArtifactPlan::Tee {
                    local: artifacts.allocate_path(ArtifactKind::Log, serial, "perf"),
                    kind: ArtifactKind::Log,
                },
                feed: OutputFeed::Perf,
            }
        }
        OperationKind::Capture => {
            let interface = params
                .interface
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(config.capture.interface.as_str());
            if !is_shell_token(interface) {
                return Err(AppError::validation(
                    format!("Invalid capture interface: {interface}"),
                    trace_id,
                ));
            }
            let local = artifacts.allocate_path(ArtifactKind::Pcap, serial, "capture");
            let remote = remote_path_for(&local);
            let mut args: Vec<String> = ["shell", "tcpdump", "-i", interface, "-U"]
                .iter()
                .map(|value| value.to_string())
                .collect();
            if config.capture.snaplen > 0 {
                args.push("-s".to_string());
                args.push(config.capture.snaplen.to_string());
            }
            args.extend(config.capture.extra_args.split_whitespace().map(str::to_string));
            args.push("-w".to_string());
            args.push(remote.clone());
            OperationPlan {
                spec: adb(args),
                remote_stop: Some(shell(&["pkill", "-SIGINT", "tcpdump"])),
                artifact: ArtifactPlan::Pulled {
                    remote,
                    local,
                    kind: ArtifactKind::Pcap,
                },
                feed: OutputFeed::Plain,
            }
        }
        OperationKind::MonkeyRun => {
            let package = params
                .package
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| AppError::validation("package is required for monkey_run", trace_id))?;
            if !is_package_name(package) {
                return Err(AppError::validation(
                    format!("Invalid package name: {package}"),
                    trace_id,
                ));
            }
            let mut args: Vec<String> = vec!["shell".into(), "monkey".into(), "-p".into(), package.into()];
            let throttle = params.throttle_ms.unwrap_or(config.monkey.throttle_ms);
            if throttle > 0 {
                args.push("--throttle".to_string());
                args.push(throttle.to_string());
            }
            if let Some(seed) = params.seed {
                args.push("-s".to_string());
                args.push(seed.to_string());
            }
            if config.monkey.ignore_crashes {
                args.push("--ignore-crashes".to_string());
            }
            if config.monkey.ignore_timeouts {
                args.push("--ignore-timeouts".to_string());
            }
            args.push("-v".to_string());
            let count = params.event_count.unwrap_or(config.monkey.event_count).max(1);
            args.push(count.to_string());
            OperationPlan {
                spec: adb(args),
                remote_stop: Some(shell(&["pkill", "-f", "com.android.commands.monkey"])),
                artifact: ArtifactPlan::Tee {
                    local: artifacts.allocate_path(ArtifactKind::Log, serial, "monkey"),
                    kind: ArtifactKind::Log,
                },
                feed: OutputFeed::Plain,
            }
        }
    };
    Ok(plan)
}

fn screenrecord_options(config: &AppConfig, params: &SessionParams) -> Vec<String> {
    let settings = &config.screen_record;
    let mut args = Vec::new();
    if !settings.bit_rate.trim().is_empty() {
        args.push("--bit-rate".to_string());
        args.push(settings.bit_rate.trim().to_string());
    }
    let time_limit = params
        .time_limit_sec
        .map(|value| value as i64)
        .unwrap_or(settings.time_limit_sec as i64);
    if time_limit > 0 {
        args.push("--time-limit".to_string());
        args.push(time_limit.min(180).to_string());
    }
    if !settings.size.trim().is_empty() {
        args.push("--size".to_string());
        args.push(settings.size.trim().to_string());
    }
    if settings.use_hevc {
        args.push("--codec".to_string());
        args.push("hevc".to_string());
    }
    if settings.bugreport {
        args.push("--bugreport".to_string());
    }
    if settings.verbose {
        args.push("--verbose".to_string());
    }
    if settings.display_id >= 0 {
        args.push("--display-id".to_string());
        args.push(settings.display_id.to_string());
    }
    args.extend(settings.extra_args.split_whitespace().map(str::to_string));
    args
}

/// Device temp file mirroring the local artifact name.
fn remote_path_for(local: &std::path::Path) -> String {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "droidbench.tmp".to_string());
    format!("/sdcard/{name}")
}

fn is_shell_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':'))
}

fn is_package_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_'))
}

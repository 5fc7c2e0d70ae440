use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use droidbench_lib::app::models::{
    Artifact, DeviceListing, EventExpectation, OutputEvent, OutputPayload, Session, SessionParams,
    ToolStatus,
};
use droidbench_lib::{commands, init_logging, load_config, AppError, AppState};

const RECV_POLL: Duration = Duration::from_millis(200);
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "droidbench", about = "droidbench: Android device test bench over adb")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices
    Devices {
        /// Keep polling and print arrivals and departures
        #[arg(short, long)]
        watch: bool,
    },
    /// Run a session and stream its output until Ctrl-C
    Session {
        /// record, log_stream, perf_sample, capture or monkey_run
        kind: String,
        #[arg(short, long)]
        serial: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        package: Option<String>,
        #[arg(long)]
        event_count: Option<u32>,
        #[arg(long)]
        throttle_ms: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        interface: Option<String>,
        #[arg(long)]
        time_limit: Option<u32>,
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Capture a screenshot into the artifact store
    Screenshot {
        #[arg(short, long)]
        serial: String,
    },
    /// Run a shell command on one or more devices
    Shell {
        #[arg(short, long, required = true)]
        serial: Vec<String>,
        command: String,
    },
    /// List stored artifacts
    Artifacts {
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Event expectation rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Show or reset the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    List,
    /// Replace all rules with the JSON array in FILE
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Reset,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    let result = match cli.command {
        Commands::Config { action } => cmd_config(action, json),
        command => run_with_state(command, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json {
                print_json(&err);
            } else {
                eprintln!("error [{}]: {} (trace {})", err.code, err.error, err.trace_id);
            }
            ExitCode::FAILURE
        }
    }
}

fn run_with_state(command: Commands, json: bool) -> Result<(), AppError> {
    let trace_id = uuid::Uuid::new_v4().to_string();
    let config = load_config(&trace_id)?;
    init_logging(&config.logging.log_level);
    let state = AppState::new(config, &trace_id)?;

    let result = match command {
        Commands::Devices { watch } => cmd_devices(&state, watch, json),
        Commands::Session {
            kind,
            serial,
            filter,
            package,
            event_count,
            throttle_ms,
            seed,
            interval_ms,
            interface,
            time_limit,
            duration,
        } => {
            let params = SessionParams {
                filter,
                package,
                event_count,
                throttle_ms,
                seed,
                interval_ms,
                interface,
                time_limit_sec: time_limit,
            };
            cmd_session(&state, serial, kind, params, duration, json)
        }
        Commands::Screenshot { serial } => cmd_screenshot(&state, serial, json),
        Commands::Shell { serial, command } => cmd_shell(&state, serial, command, json),
        Commands::Artifacts { kind } => cmd_artifacts(&state, kind, json),
        Commands::Rules { action } => cmd_rules(&state, action, json),
        Commands::Config { action } => cmd_config(action, json),
    };
    state.shutdown(&trace_id);
    result
}

// Signal handling

fn install_signal_handler() -> Result<Arc<AtomicBool>, AppError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(|err| {
            AppError::system(format!("failed to register signal handler: {err}"), "cli")
        })?;
    }
    Ok(shutdown)
}

// Subcommands

fn cmd_devices(state: &AppState, watch: bool, json: bool) -> Result<(), AppError> {
    let listing = commands::refresh_devices(state, None)?.data;
    print_listing(&listing, json);
    if !watch {
        return Ok(());
    }

    let shutdown = install_signal_handler()?;
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(WATCH_INTERVAL);
        let outcome = state.registry.poll("cli-watch");
        if outcome.added.is_empty() && outcome.removed.is_empty() {
            continue;
        }
        if json {
            print_json(&outcome.listing);
        } else {
            for serial in &outcome.added {
                println!("+ {serial}");
            }
            for serial in &outcome.removed {
                println!("- {serial}");
            }
        }
    }
    Ok(())
}

fn cmd_session(
    state: &AppState,
    serial: String,
    kind: String,
    params: SessionParams,
    duration: Option<u64>,
    json: bool,
) -> Result<(), AppError> {
    let shutdown = install_signal_handler()?;
    commands::refresh_devices(state, None)?;
    state.start_background();

    let started = commands::start_session(state, serial, kind, Some(params), None)?;
    let trace_id = started.trace_id;
    let session_id = started.data.id.clone();
    if !json {
        println!(
            "session {} ({} on {}) running, Ctrl-C to stop",
            session_id, started.data.kind, started.data.serial
        );
    }

    let mut subscription =
        commands::subscribe_session(state, &session_id, true, Some(trace_id.clone()))?;
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut stop_requested = false;
    while !subscription.is_finished() {
        if let Some(event) = subscription.recv_timeout(RECV_POLL) {
            print_event(&event, json);
        }
        let expired = deadline.map(|at| Instant::now() >= at).unwrap_or(false);
        if !stop_requested && (shutdown.load(Ordering::Relaxed) || expired) {
            stop_requested = true;
            if let Err(err) = commands::stop_session(state, session_id.clone(), Some(trace_id.clone())) {
                warn!(trace_id = %trace_id, session_id = %session_id, error = %err, "stop failed");
                break;
            }
        }
    }

    let finished = commands::get_session(state, session_id, Some(trace_id))?.data;
    print_session(&finished, json);
    Ok(())
}

fn cmd_screenshot(state: &AppState, serial: String, json: bool) -> Result<(), AppError> {
    let artifact = commands::capture_screenshot(state, serial, None)?.data;
    print_artifacts(std::slice::from_ref(&artifact), json);
    Ok(())
}

fn cmd_shell(state: &AppState, serials: Vec<String>, command: String, json: bool) -> Result<(), AppError> {
    let results = commands::run_shell(state, serials, command, None)?.data;
    if json {
        print_json(&results);
        return Ok(());
    }
    for result in results {
        let code = result
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("== {} (exit {code})", result.serial);
        print!("{}", result.stdout);
        if !result.stderr.is_empty() {
            eprint!("{}", result.stderr);
        }
    }
    Ok(())
}

fn cmd_artifacts(state: &AppState, kind: Option<String>, json: bool) -> Result<(), AppError> {
    let artifacts = commands::list_artifacts(state, kind, None)?.data;
    print_artifacts(&artifacts, json);
    Ok(())
}

fn cmd_rules(state: &AppState, action: RulesAction, json: bool) -> Result<(), AppError> {
    let rules = match action {
        RulesAction::List => commands::list_expectations(state, None)?.data,
        RulesAction::Import { file } => {
            let raw = std::fs::read_to_string(&file).map_err(|err| {
                AppError::validation(format!("Failed to read {}: {err}", file.display()), "cli")
            })?;
            let parsed: Vec<EventExpectation> = serde_json::from_str(&raw).map_err(|err| {
                AppError::validation(format!("Invalid rules file: {err}"), "cli")
            })?;
            commands::replace_expectations(state, parsed, None)?.data
        }
    };
    if json {
        print_json(&rules);
        return Ok(());
    }
    for rule in &rules {
        let mode = if rule.exact_match { "exact" } else { "contains" };
        println!(
            "{:<24} {:<8} {}",
            rule.keyword,
            mode,
            rule.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, json: bool) -> Result<(), AppError> {
    let response = match action {
        ConfigAction::Show => commands::get_config(None)?,
        ConfigAction::Reset => commands::reset_config(None)?,
    };
    if json {
        print_json(&response.data);
    } else {
        let pretty = serde_json::to_string_pretty(&response.data).map_err(|err| {
            AppError::system(format!("Failed to serialize config: {err}"), &response.trace_id)
        })?;
        println!("{pretty}");
    }
    Ok(())
}

// Output

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("failed to encode output: {err}"),
    }
}

fn print_listing(listing: &DeviceListing, json: bool) {
    if json {
        print_json(listing);
        return;
    }
    match &listing.tool {
        ToolStatus::Available => {}
        ToolStatus::Unavailable { message } => eprintln!("adb unavailable: {message}"),
        ToolStatus::TimedOut => eprintln!("adb timed out listing devices"),
    }
    for device in &listing.devices {
        let marker = if device.is_online() { " " } else { "!" };
        println!("{marker} {:<24} {:<12} {}", device.serial, device.state, device.display_name);
    }
}

fn print_event(event: &OutputEvent, json: bool) {
    if json {
        print_json(event);
        return;
    }
    match &event.payload {
        OutputPayload::Line(line) => println!("{}", line.line),
        OutputPayload::Match(found) => {
            println!("[{:?}] {}", found.kind, found.line);
            for line in found.block.iter().skip(1) {
                println!("    {line}");
            }
        }
        OutputPayload::Perf(snapshot) => {
            let cpu = snapshot
                .cpu_total_percent_x100
                .map(|value| format!("{:.2}%", f64::from(value) / 100.0))
                .unwrap_or_else(|| "-".to_string());
            let mem = snapshot
                .mem_used_bytes
                .map(|value| format!("{} MiB", value / (1024 * 1024)))
                .unwrap_or_else(|| "-".to_string());
            let battery = snapshot
                .battery_level
                .map(|value| format!("{value}%"))
                .unwrap_or_else(|| "-".to_string());
            println!("cpu {cpu}  mem {mem}  battery {battery}");
        }
        OutputPayload::End { status, exit_code } => {
            println!("-- ended: {status:?} (exit {exit_code:?})");
        }
    }
}

fn print_session(session: &Session, json: bool) {
    if json {
        print_json(session);
        return;
    }
    println!("session {} {:?}", session.id, session.status);
    if let Some(artifact) = &session.artifact {
        println!("artifact: {artifact}");
    }
    for line in &session.diagnostics {
        println!("  {line}");
    }
}

fn print_artifacts(artifacts: &[Artifact], json: bool) {
    if json {
        print_json(&artifacts);
        return;
    }
    for artifact in artifacts {
        println!("{:>10} {}", artifact.size_bytes, artifact.path);
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;
use crate::app::matcher::PatternSpec;

pub const CONFIG_PATH_ENV: &str = "DROIDBENCH_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdbSettings {
    pub command_path: String,
    pub scrcpy_path: String,
    pub command_timeout_ms: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            scrcpy_path: String::new(),
            command_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySettings {
    pub poll_interval_ms: u64,
    pub miss_threshold: u32,
    pub enumeration_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            miss_threshold: 3,
            enumeration_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorSettings {
    pub sweep_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub diagnostic_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
            stop_grace_ms: 3_000,
            diagnostic_lines: 50,
        }
    }
}

impl SupervisorSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySettings {
    pub retention_lines: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retention_lines: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatcherSettings {
    pub quiet_period_ms: u64,
    pub max_block_lines: usize,
    pub event_field: String,
    /// Extra patterns applied to every log stream on top of the stored
    /// event expectations.
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            quiet_period_ms: 500,
            max_block_lines: 256,
            event_field: "event".to_string(),
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PackageSettings {
    /// Inserted into the recent-packages list when it is first created.
    /// Empty seeds nothing.
    pub seed_package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ArtifactSettings {
    /// Empty means the platform data directory.
    pub root_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenRecordSettings {
    pub bit_rate: String,
    pub time_limit_sec: i32,
    pub size: String,
    pub extra_args: String,
    pub use_hevc: bool,
    pub bugreport: bool,
    pub verbose: bool,
    pub display_id: i32,
}

impl Default for ScreenRecordSettings {
    fn default() -> Self {
        Self {
            bit_rate: String::new(),
            time_limit_sec: 0,
            size: String::new(),
            extra_args: String::new(),
            use_hevc: false,
            bugreport: false,
            verbose: false,
            display_id: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureSettings {
    pub interface: String,
    pub snaplen: u32,
    pub extra_args: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: "any".to_string(),
            snaplen: 0,
            extra_args: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonkeySettings {
    pub event_count: u32,
    pub throttle_ms: u32,
    pub ignore_crashes: bool,
    pub ignore_timeouts: bool,
}

impl Default for MonkeySettings {
    fn default() -> Self {
        Self {
            event_count: 500,
            throttle_ms: 300,
            ignore_crashes: false,
            ignore_timeouts: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerfSettings {
    pub interval_ms: u64,
}

impl Default for PerfSettings {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrcpySettings {
    pub stay_awake: bool,
    pub turn_screen_off: bool,
    pub disable_screensaver: bool,
    pub enable_audio_playback: bool,
    pub bitrate: String,
    pub max_size: i32,
    pub extra_args: String,
}

impl Default for ScrcpySettings {
    fn default() -> Self {
        Self {
            stay_awake: true,
            turn_screen_off: true,
            disable_screensaver: true,
            enable_audio_playback: true,
            bitrate: String::new(),
            max_size: 0,
            extra_args: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub matcher: MatcherSettings,
    #[serde(default)]
    pub artifacts: ArtifactSettings,
    #[serde(default)]
    pub screen_record: ScreenRecordSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub monkey: MonkeySettings,
    #[serde(default)]
    pub perf: PerfSettings,
    #[serde(default)]
    pub scrcpy: ScrcpySettings,
    #[serde(default)]
    pub packages: PackageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            registry: RegistrySettings::default(),
            supervisor: SupervisorSettings::default(),
            relay: RelaySettings::default(),
            matcher: MatcherSettings::default(),
            artifacts: ArtifactSettings::default(),
            screen_record: ScreenRecordSettings::default(),
            capture: CaptureSettings::default(),
            monkey: MonkeySettings::default(),
            perf: PerfSettings::default(),
            scrcpy: ScrcpySettings::default(),
            packages: PackageSettings::default(),
            logging: LoggingSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.adb.command_timeout_ms)
    }

    pub fn artifact_root(&self) -> PathBuf {
        let configured = self.artifacts.root_dir.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("droidbench")
            .join("artifacts")
    }

    pub fn rules_db_path(&self) -> PathBuf {
        self.artifact_root()
            .parent()
            .map(|parent| parent.join("rules.sqlite3"))
            .unwrap_or_else(|| PathBuf::from("rules.sqlite3"))
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    home_dir().join(".droidbench_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let path = config_path();
    path.with_extension("backup.json")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.adb.command_timeout_ms < 1_000 {
        config.adb.command_timeout_ms = defaults.adb.command_timeout_ms;
    }
    if config.registry.poll_interval_ms < 250 {
        config.registry.poll_interval_ms = defaults.registry.poll_interval_ms;
    }
    if config.registry.miss_threshold == 0 {
        config.registry.miss_threshold = defaults.registry.miss_threshold;
    }
    if config.registry.enumeration_timeout_ms < 500 {
        config.registry.enumeration_timeout_ms = defaults.registry.enumeration_timeout_ms;
    }
    if config.supervisor.sweep_interval_ms < 100 {
        config.supervisor.sweep_interval_ms = defaults.supervisor.sweep_interval_ms;
    }
    if config.supervisor.diagnostic_lines == 0 {
        config.supervisor.diagnostic_lines = defaults.supervisor.diagnostic_lines;
    }
    if config.relay.retention_lines < 100 {
        config.relay.retention_lines = defaults.relay.retention_lines;
    }
    if config.matcher.max_block_lines < 8 {
        config.matcher.max_block_lines = defaults.matcher.max_block_lines;
    }
    if config.matcher.event_field.trim().is_empty() {
        config.matcher.event_field = defaults.matcher.event_field.clone();
    }
    if config.capture.interface.trim().is_empty() {
        config.capture.interface = defaults.capture.interface.clone();
    }
    if config.monkey.event_count == 0 {
        config.monkey.event_count = defaults.monkey.event_count;
    }
    config.perf.interval_ms = clamp_perf_interval_ms(Some(config.perf.interval_ms));
    config
}

pub fn clamp_perf_interval_ms(input: Option<u64>) -> u64 {
    let value = input.unwrap_or(1000);
    value.clamp(500, 5000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.registry.miss_threshold = 0;
        config.registry.poll_interval_ms = 10;
        config.relay.retention_lines = 5;
        config.perf.interval_ms = 60_000;
        config.matcher.event_field = "  ".to_string();
        let validated = validate_config(config);
        assert_eq!(validated.registry.miss_threshold, 3);
        assert_eq!(validated.registry.poll_interval_ms, 2_000);
        assert_eq!(validated.relay.retention_lines, 2_000);
        assert_eq!(validated.perf.interval_ms, 5_000);
        assert_eq!(validated.matcher.event_field, "event");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let value = serde_json::json!({
            "registry": { "poll_interval_ms": 1500, "miss_threshold": 5, "enumeration_timeout_ms": 2000 }
        });
        let config: AppConfig = serde_json::from_value(value).expect("config");
        assert_eq!(config.registry.miss_threshold, 5);
        assert_eq!(config.relay, RelaySettings::default());
        assert_eq!(config.supervisor.stop_grace_ms, 3_000);
    }

    #[test]
    fn save_then_load_keeps_values_and_writes_backup() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let path = tmp.path().join("config.json");
        let backup = tmp.path().join("config.backup.json");

        let mut config = AppConfig::default();
        config.artifacts.root_dir = "/tmp/droidbench-artifacts".to_string();
        save_config_to_path(&config, &path, &backup, "trace").expect("save");
        assert!(!backup.exists());

        config.registry.miss_threshold = 7;
        save_config_to_path(&config, &path, &backup, "trace").expect("save again");
        assert!(backup.exists());

        let loaded = load_config_from_path(&path, "trace").expect("load");
        assert_eq!(loaded.registry.miss_threshold, 7);
        assert_eq!(loaded.artifact_root(), PathBuf::from("/tmp/droidbench-artifacts"));
    }

    #[test]
    fn load_reports_parse_errors_as_system_errors() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_config_from_path(&path, "trace-cfg").expect_err("parse error");
        assert_eq!(err.code, "ERR_SYSTEM");
        assert_eq!(err.trace_id, "trace-cfg");
    }
}

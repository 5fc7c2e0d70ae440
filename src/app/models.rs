use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One row of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Usb,
    Wifi,
    Emulator,
}

impl ConnectionKind {
    pub fn from_serial(serial: &str) -> Self {
        if serial.starts_with("emulator-") {
            ConnectionKind::Emulator
        } else if serial.contains(':') || serial.contains("._adb-tls-connect.") {
            ConnectionKind::Wifi
        } else {
            ConnectionKind::Usb
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub connection: ConnectionKind,
    pub display_name: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub transport_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub misses: u32,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolStatus {
    Available,
    Unavailable { message: String },
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceListing {
    pub devices: Vec<Device>,
    pub tool: ToolStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Record,
    LogStream,
    PerfSample,
    Capture,
    MonkeyRun,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Record,
        OperationKind::LogStream,
        OperationKind::PerfSample,
        OperationKind::Capture,
        OperationKind::MonkeyRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Record => "record",
            OperationKind::LogStream => "log_stream",
            OperationKind::PerfSample => "perf_sample",
            OperationKind::Capture => "capture",
            OperationKind::MonkeyRun => "monkey_run",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown operation kind: {value}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Per-start overrides; anything left unset falls back to the config section
/// of the operation kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionParams {
    pub filter: Option<String>,
    pub package: Option<String>,
    pub event_count: Option<u32>,
    pub throttle_ms: Option<u32>,
    pub seed: Option<u64>,
    pub interval_ms: Option<u64>,
    pub interface: Option<String>,
    pub time_limit_sec: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub serial: String,
    pub kind: OperationKind,
    pub status: SessionStatus,
    pub params: SessionParams,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    pub artifact: Option<String>,
    pub trace_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Recording,
    Log,
    Pcap,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Screenshot,
        ArtifactKind::Recording,
        ArtifactKind::Log,
        ArtifactKind::Pcap,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot | ArtifactKind::Recording | ArtifactKind::Pcap => "captures",
            ArtifactKind::Log => "logs",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
            ArtifactKind::Recording => "mp4",
            ArtifactKind::Log => "log",
            ArtifactKind::Pcap => "pcap",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" => Some(ArtifactKind::Screenshot),
            "mp4" | "mkv" => Some(ArtifactKind::Recording),
            "log" | "txt" => Some(ArtifactKind::Log),
            "pcap" | "pcapng" => Some(ArtifactKind::Pcap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub file_name: String,
    pub kind: ArtifactKind,
    pub session_id: Option<String>,
    pub serial: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub serial: String,
    pub stream: OutputStream,
    pub line: String,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Event,
    Crash,
    Anr,
    NativeCrash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub kind: MatchKind,
    pub line: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerfSnapshot {
    pub ts_ms: i64,
    pub cpu_total_percent_x100: Option<u16>,
    pub mem_total_bytes: Option<u64>,
    pub mem_used_bytes: Option<u64>,
    pub net_rx_bps: Option<u64>,
    pub net_tx_bps: Option<u64>,
    pub battery_level: Option<u8>,
    pub battery_temp_decic: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPayload {
    Line(LogEvent),
    Match(PatternMatch),
    Perf(PerfSnapshot),
    End {
        status: SessionStatus,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputEvent {
    pub seq: u64,
    pub session_id: String,
    pub payload: OutputPayload,
}

impl OutputEvent {
    pub fn is_end(&self) -> bool {
        matches!(self.payload, OutputPayload::End { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventExpectation {
    #[serde(default)]
    pub id: Option<i64>,
    pub keyword: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_exact_match")]
    pub exact_match: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_exact_match() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub keyword: String,
    pub description: Option<String>,
    pub exact_match: bool,
    pub seen_count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub session_id: String,
    pub entries: Vec<AuditEntry>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    pub package_name: String,
    pub activity_name: Option<String>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MirrorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorStatus {
    pub serial: String,
    pub state: MirrorState,
    pub pid: Option<u32>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub available: bool,
    pub version_output: String,
    pub command_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrcpyInfo {
    pub available: bool,
    pub version_output: String,
    pub major_version: i32,
    pub command_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub serial: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApkInstallErrorCode {
    Success,
    InstallFailedAlreadyExists,
    InstallFailedUpdateIncompatible,
    InstallFailedDuplicatePackage,
    InstallFailedOlderSdk,
    InstallFailedVersionDowngrade,
    InstallFailedInsufficientStorage,
    InstallFailedTestOnly,
    InstallFailedNoMatchingAbis,
    InstallParseFailedNotApk,
    InstallParseFailedNoCertificates,
    InstallFailedInvalidApk,
    UnknownError,
}

impl ApkInstallErrorCode {
    const FAILURES: [ApkInstallErrorCode; 11] = [
        ApkInstallErrorCode::InstallFailedAlreadyExists,
        ApkInstallErrorCode::InstallFailedUpdateIncompatible,
        ApkInstallErrorCode::InstallFailedDuplicatePackage,
        ApkInstallErrorCode::InstallFailedOlderSdk,
        ApkInstallErrorCode::InstallFailedVersionDowngrade,
        ApkInstallErrorCode::InstallFailedInsufficientStorage,
        ApkInstallErrorCode::InstallFailedTestOnly,
        ApkInstallErrorCode::InstallFailedNoMatchingAbis,
        ApkInstallErrorCode::InstallParseFailedNotApk,
        ApkInstallErrorCode::InstallParseFailedNoCertificates,
        ApkInstallErrorCode::InstallFailedInvalidApk,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "SUCCESS",
            ApkInstallErrorCode::InstallFailedAlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
            ApkInstallErrorCode::InstallFailedUpdateIncompatible => {
                "INSTALL_FAILED_UPDATE_INCOMPATIBLE"
            }
            ApkInstallErrorCode::InstallFailedDuplicatePackage => {
                "INSTALL_FAILED_DUPLICATE_PACKAGE"
            }
            ApkInstallErrorCode::InstallFailedOlderSdk => "INSTALL_FAILED_OLDER_SDK",
            ApkInstallErrorCode::InstallFailedVersionDowngrade => {
                "INSTALL_FAILED_VERSION_DOWNGRADE"
            }
            ApkInstallErrorCode::InstallFailedInsufficientStorage => {
                "INSTALL_FAILED_INSUFFICIENT_STORAGE"
            }
            ApkInstallErrorCode::InstallFailedTestOnly => "INSTALL_FAILED_TEST_ONLY",
            ApkInstallErrorCode::InstallFailedNoMatchingAbis => "INSTALL_FAILED_NO_MATCHING_ABIS",
            ApkInstallErrorCode::InstallParseFailedNotApk => "INSTALL_PARSE_FAILED_NOT_APK",
            ApkInstallErrorCode::InstallParseFailedNoCertificates => {
                "INSTALL_PARSE_FAILED_NO_CERTIFICATES"
            }
            ApkInstallErrorCode::InstallFailedInvalidApk => "INSTALL_FAILED_INVALID_APK",
            ApkInstallErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn from_output(output: &str) -> Self {
        if output.is_empty() {
            return ApkInstallErrorCode::UnknownError;
        }
        let upper = output.to_uppercase();
        for code in ApkInstallErrorCode::FAILURES {
            if upper.contains(code.code()) {
                return code;
            }
        }
        if upper.contains("SUCCESS") {
            return ApkInstallErrorCode::Success;
        }
        ApkInstallErrorCode::UnknownError
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApkInstallResult {
    pub serial: String,
    pub success: bool,
    pub error_code: ApkInstallErrorCode,
    pub raw_output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_apk_error_code() {
        let output = "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]";
        let code = ApkInstallErrorCode::from_output(output);
        assert_eq!(code, ApkInstallErrorCode::InstallFailedVersionDowngrade);
        assert_eq!(
            ApkInstallErrorCode::from_output("Performing Streamed Install\nSuccess"),
            ApkInstallErrorCode::Success
        );
    }

    #[test]
    fn connection_kind_from_serial() {
        assert_eq!(ConnectionKind::from_serial("emulator-5554"), ConnectionKind::Emulator);
        assert_eq!(ConnectionKind::from_serial("192.168.1.20:5555"), ConnectionKind::Wifi);
        assert_eq!(
            ConnectionKind::from_serial("adb-R5CT123._adb-tls-connect._tcp"),
            ConnectionKind::Wifi
        );
        assert_eq!(ConnectionKind::from_serial("R5CT1234567"), ConnectionKind::Usb);
    }

    #[test]
    fn operation_kind_parses_cli_spellings() {
        assert_eq!("log-stream".parse::<OperationKind>(), Ok(OperationKind::LogStream));
        assert_eq!("RECORD".parse::<OperationKind>(), Ok(OperationKind::Record));
        assert!("screenshot".parse::<OperationKind>().is_err());
    }

    #[test]
    fn output_payload_serializes_with_type_tag() {
        let event = OutputEvent {
            seq: 3,
            session_id: "s-1".to_string(),
            payload: OutputPayload::End {
                status: SessionStatus::Cancelled,
                exit_code: None,
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["payload"]["type"], "end");
        assert_eq!(value["payload"]["status"], "cancelled");
        assert!(event.is_end());
    }
}

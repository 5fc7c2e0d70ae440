use std::path::Path;
use std::process::{Command, Stdio};

use crate::app::adb::locator::normalize_command_path;
use crate::app::config::ScrcpySettings;
use crate::app::models::ScrcpyInfo;

const DEFAULT_MAJOR: i32 = 2;

pub fn check_scrcpy_availability(configured_path: &str) -> ScrcpyInfo {
    let mut result = ScrcpyInfo {
        available: false,
        version_output: String::new(),
        major_version: DEFAULT_MAJOR,
        command_path: "scrcpy".to_string(),
    };

    let configured = normalize_command_path(configured_path);
    let mut candidates: Vec<String> = Vec::new();
    if !configured.is_empty() {
        candidates.push(configured);
    }
    candidates.push("scrcpy".to_string());
    let common_paths: &[&str] = if std::env::consts::OS == "macos" {
        &["/opt/homebrew/bin/scrcpy", "/usr/local/bin/scrcpy"]
    } else {
        &[
            "/usr/bin/scrcpy",
            "/usr/local/bin/scrcpy",
            "/snap/bin/scrcpy",
            "~/.local/bin/scrcpy",
        ]
    };
    candidates.extend(
        common_paths
            .iter()
            .map(|path| expand_home(path))
            .filter(|path| Path::new(path).exists()),
    );

    for candidate in candidates {
        if let Some(output) = try_version(&candidate) {
            result.available = true;
            result.major_version = parse_scrcpy_major(&output);
            result.version_output = output;
            result.command_path = candidate;
            return result;
        }
    }
    result
}

/// Arguments for mirroring `serial`; the program itself is not included.
pub fn build_scrcpy_args(serial: &str, settings: &ScrcpySettings, major_version: i32) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string()];
    if settings.stay_awake {
        args.push("--stay-awake".to_string());
    }
    if settings.turn_screen_off {
        args.push("--turn-screen-off".to_string());
    }
    if settings.disable_screensaver {
        args.push("--disable-screensaver".to_string());
    }
    match AudioFlagMode::for_major(major_version) {
        AudioFlagMode::AudioToggle => {
            if settings.enable_audio_playback {
                args.push("--audio".to_string());
            } else {
                args.push("--no-audio".to_string());
            }
        }
        AudioFlagMode::NoAudioOnly => {
            if !settings.enable_audio_playback {
                args.push("--no-audio".to_string());
            }
        }
        AudioFlagMode::Unsupported => {}
    }
    if !settings.bitrate.trim().is_empty() {
        args.push("--video-bit-rate".to_string());
        args.push(settings.bitrate.trim().to_string());
    }
    if settings.max_size > 0 {
        args.push("--max-size".to_string());
        args.push(settings.max_size.to_string());
    }
    args.extend(settings.extra_args.split_whitespace().map(str::to_string));
    args
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AudioFlagMode {
    AudioToggle,
    NoAudioOnly,
    Unsupported,
}

impl AudioFlagMode {
    fn for_major(major_version: i32) -> Self {
        if major_version >= 3 {
            AudioFlagMode::NoAudioOnly
        } else if major_version >= 2 {
            AudioFlagMode::AudioToggle
        } else {
            AudioFlagMode::Unsupported
        }
    }
}

fn try_version(command: &str) -> Option<String> {
    let output = Command::new(command)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

pub fn parse_scrcpy_major(output: &str) -> i32 {
    let lower = output.to_lowercase();
    for token in lower.split_whitespace() {
        let version = token
            .trim_start_matches("scrcpy")
            .trim_start_matches('v');
        if let Some(Ok(value)) = version.split('.').next().map(str::parse::<i32>) {
            return value;
        }
    }
    DEFAULT_MAJOR
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::launcher::{LaunchSpec, ProcessLauncher};
use crate::app::adb::paths::{sanitize_filename_component, validate_device_path};
use crate::app::adb::runner::{adb_args, CommandOutput};
use crate::app::artifacts::ArtifactStore;
use crate::app::error::{AppError, ERR_TOOL_UNAVAILABLE};
use crate::app::models::{ApkInstallErrorCode, ApkInstallResult, Artifact, ArtifactKind, CommandResult};

/// APK installs copy the whole package over the bridge.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// One-shot bridge commands that do not need session bookkeeping.
pub struct DeviceOps {
    launcher: Arc<dyn ProcessLauncher>,
    artifacts: Arc<ArtifactStore>,
    adb_program: String,
    timeout: Duration,
}

impl DeviceOps {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        artifacts: Arc<ArtifactStore>,
        adb_program: String,
        timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            artifacts,
            adb_program,
            timeout,
        }
    }

    fn adb<I, S>(&self, serial: &str, rest: I) -> LaunchSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LaunchSpec::new(self.adb_program.as_str(), adb_args(Some(serial), rest))
    }

    fn run_checked(&self, spec: &LaunchSpec, action: &str, timeout: Duration, trace_id: &str) -> Result<CommandOutput, AppError> {
        let output = self.launcher.run(spec, timeout, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("{action} failed: {}", output.error_summary()),
                trace_id,
            ));
        }
        Ok(output)
    }

    /// screencap to a device temp file, pull it into the captures dir and
    /// record it as a screenshot artifact.
    pub fn capture_screenshot(&self, serial: &str, trace_id: &str) -> Result<Artifact, AppError> {
        let local = self
            .artifacts
            .allocate_path(ArtifactKind::Screenshot, serial, "screenshot");
        let file_name = local
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "screenshot.png".to_string());
        let remote = format!("/sdcard/{file_name}");

        self.run_checked(
            &self.adb(serial, ["shell", "screencap", "-p", remote.as_str()]),
            "Screenshot",
            self.timeout,
            trace_id,
        )?;
        let local_arg = local.to_string_lossy().to_string();
        let pulled = self.run_checked(
            &self.adb(serial, ["pull", remote.as_str(), local_arg.as_str()]),
            "Screenshot pull",
            self.timeout,
            trace_id,
        );
        if let Err(err) = self.launcher.run(
            &self.adb(serial, ["shell", "rm", "-f", remote.as_str()]),
            self.timeout,
            trace_id,
        ) {
            warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to remove device screenshot");
        }
        pulled?;

        match self
            .artifacts
            .record(&local, ArtifactKind::Screenshot, None, Some(serial), trace_id)?
        {
            Some(artifact) => {
                info!(trace_id = %trace_id, serial = %serial, path = %artifact.path, "screenshot captured");
                Ok(artifact)
            }
            None => {
                let _ = fs::remove_file(&local);
                Err(AppError::process_failure("Screenshot produced no data", trace_id))
            }
        }
    }

    /// Runs `command` through `sh -c` on every serial in parallel. Results
    /// keep the input order.
    pub fn run_shell(&self, serials: &[String], command: &str, trace_id: &str) -> Result<Vec<CommandResult>, AppError> {
        if command.trim().is_empty() {
            return Err(AppError::validation("command is required", trace_id));
        }
        if serials.is_empty() || serials.iter().any(|serial| serial.trim().is_empty()) {
            return Err(AppError::validation("serials is required", trace_id));
        }

        thread::scope(|scope| {
            let handles: Vec<_> = serials
                .iter()
                .map(|serial| {
                    scope.spawn(move || {
                        let spec = self.adb(serial.trim(), ["shell", "sh", "-c", command]);
                        self.launcher
                            .run(&spec, self.timeout, trace_id)
                            .map(|output| CommandResult {
                                serial: serial.trim().to_string(),
                                stdout: output.stdout,
                                stderr: output.stderr,
                                exit_code: output.exit_code,
                            })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| AppError::system("Shell command thread panicked", trace_id))?
                })
                .collect()
        })
    }

    pub fn send_text(&self, serial: &str, text: &str, trace_id: &str) -> Result<(), AppError> {
        if text.is_empty() {
            return Err(AppError::validation("text is required", trace_id));
        }
        let encoded = encode_input_text(text);
        self.run_checked(
            &self.adb(serial, ["shell", "input", "text", encoded.as_str()]),
            "Text input",
            self.timeout,
            trace_id,
        )?;
        Ok(())
    }

    /// Copies `local` into the uploads dir, then pushes that copy to
    /// `device_path`.
    pub fn push_file(&self, serial: &str, local: &Path, device_path: &str, trace_id: &str) -> Result<CommandResult, AppError> {
        validate_device_path(device_path).map_err(|err| AppError::validation(err, trace_id))?;
        if !local.is_file() {
            return Err(AppError::validation(
                format!("Local file not found: {}", local.display()),
                trace_id,
            ));
        }
        let name = local
            .file_name()
            .map(|name| sanitize_filename_component(&name.to_string_lossy()))
            .unwrap_or_else(|| "upload".to_string());
        let staged = self.artifacts.upload_dir().join(name);
        fs::copy(local, &staged)
            .map_err(|err| AppError::system(format!("Failed to stage upload: {err}"), trace_id))?;

        let staged_arg = staged.to_string_lossy().to_string();
        let output = self.run_checked(
            &self.adb(serial, ["push", staged_arg.as_str(), device_path.trim()]),
            "Push",
            self.timeout,
            trace_id,
        )?;
        info!(trace_id = %trace_id, serial = %serial, device_path = %device_path.trim(), "file pushed");
        Ok(CommandResult {
            serial: serial.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }

    /// Installs with `-r`. Bridge failures are reported in the result rather
    /// than as errors so callers see the classified reason.
    pub fn install_apk(&self, serial: &str, apk_path: &str, trace_id: &str) -> Result<ApkInstallResult, AppError> {
        let path = normalize_apk_path(apk_path);
        let is_apk = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("apk"))
            .unwrap_or(false);
        if !path.is_file() || !is_apk {
            return Err(AppError::validation(
                format!("Not an APK file: {}", path.display()),
                trace_id,
            ));
        }

        let path_arg = path.to_string_lossy().to_string();
        let spec = self.adb(serial, ["install", "-r", path_arg.as_str()]);
        let result = match self.launcher.run(&spec, INSTALL_TIMEOUT, trace_id) {
            Ok(output) => {
                let raw = if output.stdout.trim().is_empty() {
                    output.stderr
                } else {
                    output.stdout
                };
                let error_code = ApkInstallErrorCode::from_output(&raw);
                ApkInstallResult {
                    serial: serial.to_string(),
                    success: error_code == ApkInstallErrorCode::Success,
                    error_code,
                    raw_output: raw,
                }
            }
            Err(err) if err.is(ERR_TOOL_UNAVAILABLE) => return Err(err),
            Err(err) => ApkInstallResult {
                serial: serial.to_string(),
                success: false,
                error_code: ApkInstallErrorCode::UnknownError,
                raw_output: err.error,
            },
        };
        info!(
            trace_id = %trace_id,
            serial = %serial,
            code = result.error_code.code(),
            "apk install finished"
        );
        Ok(result)
    }

    pub fn clear_logcat(&self, serial: &str, trace_id: &str) -> Result<(), AppError> {
        self.run_checked(
            &self.adb(serial, ["logcat", "-b", "all", "-c"]),
            "Logcat clear",
            self.timeout,
            trace_id,
        )?;
        Ok(())
    }
}

/// `input text` reads `%s` as a space and stops at unescaped shell
/// metacharacters.
pub fn encode_input_text(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            ' ' => encoded.push_str("%s"),
            '\\' | '\'' | '"' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '$' | '`' | '*' | '?' | '~'
            | '#' => {
                encoded.push('\\');
                encoded.push(ch);
            }
            _ => encoded.push(ch),
        }
    }
    encoded
}

fn normalize_apk_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::app::adb::runner::{run_command_with_timeout, spawn_error, CommandOutput};
use crate::app::error::AppError;

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Seam between the orchestration layer and the OS. Tests swap in scripted
/// launchers so sessions run without a device.
pub trait ProcessLauncher: Send + Sync {
    /// Starts a long-running process with piped stdout/stderr.
    fn spawn(&self, spec: &LaunchSpec, trace_id: &str) -> Result<Child, AppError>;

    /// Runs a one-shot command to completion, bounded by `timeout`.
    fn run(&self, spec: &LaunchSpec, timeout: Duration, trace_id: &str) -> Result<CommandOutput, AppError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn spawn(&self, spec: &LaunchSpec, trace_id: &str) -> Result<Child, AppError> {
        Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(&spec.program, err, trace_id))
    }

    fn run(&self, spec: &LaunchSpec, timeout: Duration, trace_id: &str) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(&spec.program, &spec.args, timeout, trace_id)
    }
}

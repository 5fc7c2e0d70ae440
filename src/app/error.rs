use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_TOOL_UNAVAILABLE: &str = "ERR_TOOL_UNAVAILABLE";
pub const ERR_DEVICE_NOT_FOUND: &str = "ERR_DEVICE_NOT_FOUND";
pub const ERR_CONFLICT: &str = "ERR_CONFLICT";
pub const ERR_PROCESS_FAILURE: &str = "ERR_PROCESS_FAILURE";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// The external binary is missing or could not be executed.
    pub fn tool_unavailable(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TOOL_UNAVAILABLE, message, trace_id)
    }

    pub fn device_not_found(serial: &str, trace_id: impl Into<String>) -> Self {
        Self::new(
            ERR_DEVICE_NOT_FOUND,
            format!("Device {serial} is not connected"),
            trace_id,
        )
    }

    pub fn conflict(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONFLICT, message, trace_id)
    }

    pub fn process_failure(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PROCESS_FAILURE, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_NOT_FOUND, message, trace_id)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

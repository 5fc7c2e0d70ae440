use std::path::Path;

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Configured path, or the bare tool name resolved through `PATH`.
pub fn resolve_program(config_command_path: &str, default_name: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        default_name.to_string()
    } else {
        normalized
    }
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    resolve_program(config_command_path, "adb")
}

pub fn validate_program(program: &str, label: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err(format!("{label} command is empty"));
    }
    let path = Path::new(program);
    if path.components().count() == 1 {
        // Bare names are resolved by the OS at spawn time.
        return Ok(());
    }
    if path.is_dir() {
        return Err(format!("{label} path must point to an executable file"));
    }
    if !path.exists() {
        return Err(format!("{label} executable not found at the configured path"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("  '/opt/android/platform-tools/adb'  "),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn resolves_empty_to_default_name() {
        assert_eq!(resolve_adb_program(""), "adb");
        assert_eq!(resolve_adb_program("   "), "adb");
        assert_eq!(resolve_program("", "scrcpy"), "scrcpy");
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_program("/this/path/should/not/exist/adb", "ADB").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
        assert!(validate_program("adb", "ADB").is_ok());
    }
}

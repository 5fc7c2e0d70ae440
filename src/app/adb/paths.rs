pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device_path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device_path must be an absolute device path starting with '/'".to_string());
    }
    if trimmed.contains('\0') {
        return Err("device_path contains invalid characters".to_string());
    }
    if trimmed == "/" {
        return Err("device_path must not be root".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err("device_path must not contain '..' segments".to_string());
    }
    Ok(())
}

/// Keeps `[A-Za-z0-9._-]`, maps everything else to `_`. Serials such as
/// `192.168.1.20:5555` become safe file name parts.
pub fn sanitize_filename_component(value: &str) -> String {
    let sanitized: String = value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('.').to_string();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

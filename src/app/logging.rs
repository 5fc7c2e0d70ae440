use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let fallback = normalize_level(default_level);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn normalize_level(value: &str) -> &'static str {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_level_accepts_config_spellings() {
        assert_eq!(normalize_level("INFO"), "info");
        assert_eq!(normalize_level("Warning"), "warn");
        assert_eq!(normalize_level(" debug "), "debug");
        assert_eq!(normalize_level("verbose"), "info");
    }
}

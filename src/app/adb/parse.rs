use crate::app::models::DeviceSummary;

/// Parses `adb devices` / `adb devices -l`. Daemon chatter (`* daemon started`)
/// and the header are skipped; unknown `key:value` tokens are ignored.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut summary = DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
                model: None,
                product: None,
                device: None,
                transport_id: None,
            };
            for token in tokens.iter().skip(2) {
                let Some((key, value)) = token.split_once(':') else {
                    continue;
                };
                let value = Some(value.to_string());
                match key {
                    "model" => summary.model = value,
                    "product" => summary.product = value,
                    "device" => summary.device = value,
                    "transport_id" => summary.transport_id = value,
                    _ => {}
                }
            }
            Some(summary)
        })
        .collect()
}

/// Human label: the model with underscores spaced out, else the serial.
pub fn display_name_for(summary: &DeviceSummary) -> String {
    summary
        .model
        .as_deref()
        .map(|model| model.replace('_', " "))
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| summary.serial.clone())
}

use std::collections::HashMap;
use std::time::Duration;

/// Tunables for the scheduler, mirroring the options table in the external
/// interface description. Defaults are chosen to match a typical wearable
/// companion-app workload; override via `Config::load` or by mutating the
/// struct directly before constructing a `Manager`.
#[derive(Debug, Clone)]
pub struct Config {
    pub auto_update_rate: Duration,
    pub n_for_average_running_read_time: usize,
    pub n_for_average_running_write_time: usize,
    pub default_tx_power: i8,
    pub reconnect_filter_short_term_timeout: Duration,
    pub reconnect_filter_long_term_timeout: Duration,
    pub manage_last_disconnect_on_disk: bool,
    pub save_name_changes_to_disk: bool,
    pub clear_gatt_on_ota_success: bool,
    pub post_callbacks_to_main_thread: bool,
    pub auto_scan_during_ota: bool,
    pub include_ota_read_write_times_in_average: bool,
    pub default_gatt_refresh_delay: Duration,
    pub notify_force_read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            auto_update_rate: Duration::from_millis(50),
            n_for_average_running_read_time: 10,
            n_for_average_running_write_time: 10,
            default_tx_power: -12,
            reconnect_filter_short_term_timeout: Duration::from_secs(5),
            reconnect_filter_long_term_timeout: Duration::from_secs(60 * 5),
            manage_last_disconnect_on_disk: false,
            save_name_changes_to_disk: false,
            clear_gatt_on_ota_success: true,
            post_callbacks_to_main_thread: true,
            auto_scan_during_ota: false,
            include_ota_read_write_times_in_average: false,
            default_gatt_refresh_delay: Duration::from_millis(600),
            notify_force_read_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Parses a small `key=value` ini-style file (no sections), the same
    /// shape `manager_service` loads its daemon configuration from via
    /// `configparser`. Unknown keys are logged and ignored; missing keys
    /// keep their default.
    pub fn load_from_str(contents: &str) -> Config {
        let mut config = Config::default();
        let map = parse_ini(contents);

        if let Some(v) = map.get("auto_update_rate_ms").and_then(|v| v.parse::<u64>().ok()) {
            config.auto_update_rate = Duration::from_millis(v);
        }
        if let Some(v) = map.get("n_for_average_running_read_time").and_then(|v| v.parse::<usize>().ok()) {
            config.n_for_average_running_read_time = v;
        }
        if let Some(v) = map.get("n_for_average_running_write_time").and_then(|v| v.parse::<usize>().ok()) {
            config.n_for_average_running_write_time = v;
        }
        if let Some(v) = map.get("default_tx_power").and_then(|v| v.parse::<i8>().ok()) {
            config.default_tx_power = v;
        }
        if let Some(v) = map.get("reconnect_filter_short_term_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
            config.reconnect_filter_short_term_timeout = Duration::from_millis(v);
        }
        if let Some(v) = map.get("reconnect_filter_long_term_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
            config.reconnect_filter_long_term_timeout = Duration::from_millis(v);
        }
        if let Some(v) = map.get("manage_last_disconnect_on_disk").and_then(|v| v.parse::<bool>().ok()) {
            config.manage_last_disconnect_on_disk = v;
        }
        if let Some(v) = map.get("save_name_changes_to_disk").and_then(|v| v.parse::<bool>().ok()) {
            config.save_name_changes_to_disk = v;
        }
        if let Some(v) = map.get("clear_gatt_on_ota_success").and_then(|v| v.parse::<bool>().ok()) {
            config.clear_gatt_on_ota_success = v;
        }
        if let Some(v) = map.get("post_callbacks_to_main_thread").and_then(|v| v.parse::<bool>().ok()) {
            config.post_callbacks_to_main_thread = v;
        }
        if let Some(v) = map.get("auto_scan_during_ota").and_then(|v| v.parse::<bool>().ok()) {
            config.auto_scan_during_ota = v;
        }

        config
    }
}

fn parse_ini(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.auto_update_rate, Duration::from_millis(50));
        assert!(c.reconnect_filter_long_term_timeout > c.reconnect_filter_short_term_timeout);
    }

    #[test]
    fn load_from_str_overrides_selected_fields() {
        let c = Config::load_from_str("auto_update_rate_ms=10\nmanage_last_disconnect_on_disk=true\n# comment\n");
        assert_eq!(c.auto_update_rate, Duration::from_millis(10));
        assert!(c.manage_last_disconnect_on_disk);
        assert_eq!(c.default_tx_power, Config::default().default_tx_power);
    }
}

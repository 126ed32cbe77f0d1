use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkConfig {
    pub connection_timeout_ms: u64,
    pub scan_duration_ms: u64,
    pub auto_connect: bool,
    pub auto_reconnect: bool,
    // 0 means a short pulse is sent after connecting instead
    pub default_vibration_level: u8,
    pub last_connected_device: Option<String>,
    pub last_connected_name: Option<String>,
}

impl LinkConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn remember_device(&mut self, address: &str, name: &str) {
        self.last_connected_device = Some(address.to_string());
        self.last_connected_name = Some(name.to_string());
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            connection_timeout_ms: 15000,
            scan_duration_ms: 10000,
            auto_connect: true,
            auto_reconnect: true,
            default_vibration_level: 0,
            last_connected_device: None,
            last_connected_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: LinkConfig = serde_json::from_str(r#"{"autoReconnect": false, "defaultVibrationLevel": 5}"#).unwrap();

        assert!(!config.auto_reconnect);
        assert_eq!(config.default_vibration_level, 5);
        assert_eq!(config.connection_timeout(), Duration::from_secs(15));
        assert_eq!(config.scan_duration(), Duration::from_secs(10));
        assert!(config.auto_connect);
        assert_eq!(config.last_connected_device, None);
    }

    #[test]
    fn serializes_camel_case() {
        let mut config = LinkConfig::default();
        config.remember_device("aa:bb", "LVS-Nora");

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lastConnectedDevice"], "aa:bb");
        assert_eq!(json["lastConnectedName"], "LVS-Nora");
        assert_eq!(json["connectionTimeoutMs"], 15000);
    }
}

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    FindingService,
    Connected,
    Failed,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Scanning => "SCANNING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::FindingService => "FINDING_SERVICE",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Reconnecting => "RECONNECTING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressKind {
    Public,
    Random,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            AddressKind::Public => "PUBLIC",
            AddressKind::Random => "RANDOM",
        };

        write!(f, "{}", result)
    }
}

/// A peripheral seen during the current scan window that one of the known protocols can drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibleDevice {
    pub address: String,
    pub address_kind: AddressKind,
    pub name: String,
    pub rssi: i16,
    pub protocol: ProtocolKind,
    pub connected: bool,
    pub model_display_name: Option<String>,
    pub firmware_version: Option<String>,
    pub battery_level: Option<u8>,
}

impl CompatibleDevice {
    pub fn new(address: &str, address_kind: AddressKind, name: &str, rssi: i16, protocol: ProtocolKind) -> Self {
        CompatibleDevice {
            address: address.to_string(),
            address_kind,
            name: name.to_string(),
            rssi,
            protocol,
            connected: false,
            model_display_name: None,
            firmware_version: None,
            battery_level: None,
        }
    }
}

/// Protocol independent identity of the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model_type: String,
    pub firmware_version: String,
    pub mac_address: String,
    pub battery_level: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    DeviceInfo(DeviceInfo),
    BatteryLevel(u8), // [0, 100]
}

//! Device protocols: how high level control intents are encoded for a specific vendor's toys.
//!
//! A protocol is chosen at runtime through the [`ProtocolKind`] tag assigned when an advertisement is
//! classified. Classification goes through the [`MATCHERS`] table, so adding a protocol means adding a
//! matcher and an implementation without touching the connection state machine.

use futures::channel::mpsc::Sender;
use serde::Serialize;
use uuid::Uuid;

use crate::device::types::DeviceInfo;
use crate::error::CommandError;

pub mod lovense;

pub type DeviceInfoCallback = Box<dyn FnMut(&DeviceInfo) + Send>;
pub type BatteryLevelCallback = Box<dyn FnMut(u8) + Send>;

/// A write capable characteristic. Writes are queued to the host and never block.
#[derive(Debug)]
pub struct CommandChannel {
    uuid: Uuid,
    writable: bool,
    sink: Sender<Vec<u8>>,
}

impl CommandChannel {
    pub fn new(uuid: Uuid, writable: bool, sink: Sender<Vec<u8>>) -> Self {
        CommandChannel { uuid, writable, sink }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn can_write(&self) -> bool {
        self.writable && !self.sink.is_closed()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), CommandError> {
        self.sink.try_send(data.to_vec()).map_err(|_| CommandError::Rejected)
    }
}

/// A notify capable characteristic whose notifications are routed to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseChannel {
    uuid: Uuid,
}

impl ResponseChannel {
    pub fn new(uuid: Uuid) -> Self {
        ResponseChannel { uuid }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

pub trait DeviceProtocol: Send {
    fn bind_command_channel(&mut self, channel: CommandChannel);

    /// Bind the channel whose notifications are passed to [`DeviceProtocol::handle_response`].
    /// The caller has already subscribed to it.
    fn bind_response_channel(&mut self, channel: ResponseChannel);

    /// Unbind both channels. Returns the response channel so the caller can unsubscribe from it.
    fn clear_channels(&mut self) -> Option<ResponseChannel>;

    fn response_channel(&self) -> Option<&ResponseChannel>;

    /// A command channel is bound and accepts writes.
    fn is_ready(&self) -> bool;

    fn is_compatible_service(&self, uuid: &str) -> bool;

    fn is_compatible_name(&self, name: &str) -> bool;

    /// Level in [0, 20], clamped.
    fn set_vibration(&mut self, level: u8) -> Result<(), CommandError>;

    /// Level in [0, 20], clamped.
    fn set_rotation(&mut self, level: u8) -> Result<(), CommandError>;

    fn change_rotation_direction(&mut self) -> Result<(), CommandError>;

    /// Level in [0, 4], clamped.
    fn set_air_level(&mut self, level: u8) -> Result<(), CommandError>;

    /// Amount in [1, 4], clamped.
    fn adjust_air_level_relative(&mut self, inflate: bool, amount: u8) -> Result<(), CommandError>;

    fn power_off(&mut self) -> Result<(), CommandError>;

    /// The answer arrives as a notification and is reported through the device info callback.
    fn query_device_type(&mut self) -> Result<(), CommandError>;

    /// The answer arrives as a notification and is reported through the battery level callback.
    fn query_battery_level(&mut self) -> Result<(), CommandError>;

    fn model_display_name(&self) -> String;

    fn handle_response(&mut self, response: &[u8]);

    fn set_device_info_callback(&mut self, callback: DeviceInfoCallback);

    fn set_battery_level_callback(&mut self, callback: BatteryLevelCallback);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolKind {
    Unknown,
    Lovense,
}

impl ProtocolKind {
    /// A fresh protocol instance for this tag, `None` if the tag has no implementation.
    pub fn create(&self) -> Option<Box<dyn DeviceProtocol>> {
        match self {
            ProtocolKind::Lovense => Some(Box::new(lovense::LovenseProtocol::new())),
            ProtocolKind::Unknown => None,
        }
    }
}

pub struct ProtocolMatcher {
    pub kind: ProtocolKind,
    pub matches_name: fn(&str) -> bool,
}

pub const MATCHERS: &[ProtocolMatcher] = &[
    ProtocolMatcher {
        kind: ProtocolKind::Lovense,
        matches_name: lovense::is_lovense_name,
    },
];

/// Find the protocol for an advertised device name.
// Advertised services are not matched: the early generation suffix is the tail of the SIG base uuid.
pub fn classify(name: &str) -> Option<ProtocolKind> {
    MATCHERS.iter()
        .find(|matcher| (matcher.matches_name)(name))
        .map(|matcher| matcher.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::channel;

    #[test]
    fn classify_by_name() {
        assert_eq!(classify("LVS-Nora"), Some(ProtocolKind::Lovense));
        assert_eq!(classify("Keyboard"), None);
    }

    #[test]
    fn unknown_kind_has_no_implementation() {
        assert!(ProtocolKind::Unknown.create().is_none());
        assert!(ProtocolKind::Lovense.create().is_some());
    }

    #[test]
    fn command_channel_rejects_when_writer_is_gone() {
        let (tx, rx) = channel::<Vec<u8>>(4);
        let mut command = CommandChannel::new(Uuid::nil(), true, tx);
        assert!(command.can_write());
        assert_eq!(command.write(b"Battery;"), Ok(()));

        drop(rx);
        assert!(!command.can_write());
        assert_eq!(command.write(b"Battery;"), Err(CommandError::Rejected));
    }
}

//! The boundary between the connection state machine and the BLE host stack.
//!
//! Requests flow into the host through [`BleHost`] and [`BleClient`]. Everything the host reports
//! asynchronously (advertisements, link changes, notifications) is pushed as a [`HostEvent`] onto a
//! bounded queue which the state machine drains at the start of every tick.

use std::fmt;
use std::time::Duration;
use futures::channel::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

use crate::device::constants::EVENT_QUEUE_SIZE;
use crate::device::types::{AddressKind, DeviceInfo};
use crate::error::DeviceError;
use crate::protocol::CommandChannel;

/// Identifies one scan window. Events tagged with an older epoch are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanEpoch(pub u64);

impl ScanEpoch {
    pub fn next(self) -> ScanEpoch {
        ScanEpoch(self.0 + 1)
    }
}

/// Identifies one client context handed out by the host. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: String,
    pub address_kind: AddressKind,
    pub rssi: i16,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub can_write: bool,
    pub can_notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub characteristics: Vec<RemoteCharacteristic>,
}

/// Connection parameters proposed by the peripheral, in controller units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailReason {
    Timeout,
    BadData,
    AlreadyConnected,
    NotConnected,
    Other(i32),
}

impl fmt::Display for ConnectFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailReason::Timeout => write!(f, "TIMEOUT"),
            ConnectFailReason::BadData => write!(f, "BAD_DATA"),
            ConnectFailReason::AlreadyConnected => write!(f, "ALREADY_CONNECTED"),
            ConnectFailReason::NotConnected => write!(f, "NOT_CONNECTED"),
            ConnectFailReason::Other(code) => write!(f, "{}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Advertisement { epoch: ScanEpoch, advertisement: Advertisement },
    ScanEnded { epoch: ScanEpoch },
    LinkUp { client: ClientId },
    LinkDown { client: ClientId },
    ConnectFailed { client: ClientId, reason: ConnectFailReason },
    ConnParamsUpdateRequest { client: ClientId, params: ConnParams },
    Notification { client: ClientId, characteristic: Uuid, value: Vec<u8> },
    // reported by the bound device protocol
    DeviceInfo(DeviceInfo),
    BatteryLevel(u8),
}

pub type HostEventSender = Sender<HostEvent>;
pub type HostEventReceiver = Receiver<HostEvent>;

pub fn event_queue() -> (HostEventSender, HostEventReceiver) {
    channel::<HostEvent>(EVENT_QUEUE_SIZE)
}

#[allow(async_fn_in_trait)]
pub trait BleHost {
    type Client: BleClient;

    /// Begin discovery. Results and the end of the window are reported as events tagged with `epoch`.
    async fn start_scan(&mut self, duration: Duration, epoch: ScanEpoch) -> Result<(), DeviceError>;

    async fn stop_scan(&mut self) -> Result<(), DeviceError>;

    /// The platform's limit on concurrently allocated clients.
    fn max_clients(&self) -> usize;

    fn created_client_count(&self) -> usize;

    async fn create_client(&mut self, address: &str, address_kind: AddressKind) -> Result<Self::Client, DeviceError>;

    /// Give the client's resources back to the host. Events for its id stop being meaningful.
    async fn release_client(&mut self, client: Self::Client);
}

#[allow(async_fn_in_trait)]
pub trait BleClient {
    fn id(&self) -> ClientId;

    /// Request a link. `Ok` means the request was accepted, the link-up itself is reported as [`HostEvent::LinkUp`].
    async fn connect(&mut self) -> Result<(), DeviceError>;

    async fn is_connected(&self) -> Result<bool, DeviceError>;

    async fn disconnect(&mut self) -> Result<(), DeviceError>;

    async fn discover_attributes(&mut self) -> Result<Vec<RemoteService>, DeviceError>;

    async fn subscribe(&mut self, characteristic: &RemoteCharacteristic) -> Result<(), DeviceError>;

    async fn unsubscribe(&mut self, characteristic: &RemoteCharacteristic) -> Result<(), DeviceError>;

    fn command_channel(&mut self, characteristic: &RemoteCharacteristic) -> Result<CommandChannel, DeviceError>;

    async fn rssi(&self) -> Result<Option<i16>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_fail_reasons_use_host_labels() {
        assert_eq!(ConnectFailReason::Timeout.to_string(), "TIMEOUT");
        assert_eq!(ConnectFailReason::AlreadyConnected.to_string(), "ALREADY_CONNECTED");
        assert_eq!(ConnectFailReason::Other(13).to_string(), "13");
    }

    #[test]
    fn epochs_advance() {
        let epoch = ScanEpoch(4);
        assert_eq!(epoch.next(), ScanEpoch(5));
        assert!(epoch < epoch.next());
    }
}

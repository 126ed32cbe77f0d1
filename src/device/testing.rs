//! A scripted host stack for exercising the connection state machine without a radio.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::channel::mpsc::{channel, Receiver};
use uuid::Uuid;

use crate::config::types::LinkConfig;
use crate::device::connection::ConnectionManager;
use crate::device::constants::COMMAND_QUEUE_SIZE;
use crate::device::host::{event_queue, Advertisement, BleClient, BleHost, ClientId, HostEvent, HostEventSender, RemoteCharacteristic, RemoteService, ScanEpoch};
use crate::device::types::AddressKind;
use crate::error::DeviceError;
use crate::protocol::CommandChannel;

pub const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const TX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const RX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
pub const OTHER_SERVICE: Uuid = Uuid::from_u128(0x12340001_1234_5678_9abc_def012345678);

pub fn lovense_service() -> RemoteService {
    RemoteService {
        uuid: SERVICE,
        characteristics: vec![
            RemoteCharacteristic { uuid: TX, can_write: true, can_notify: false },
            RemoteCharacteristic { uuid: RX, can_write: false, can_notify: true },
        ],
    }
}

pub struct MockState {
    pub scans: Vec<(Duration, ScanEpoch)>,
    pub stop_scans: usize,
    pub max_clients: usize,
    pub foreign_clients: usize,
    pub next_client: u64,
    pub live_clients: Vec<ClientId>,
    pub released: Vec<ClientId>,
    pub connect_results: VecDeque<Result<(), String>>,
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    pub link_up: bool,
    pub discover_failures: usize,
    pub discover_calls: usize,
    pub services: Vec<RemoteService>,
    pub subscribed: Vec<Uuid>,
    pub unsubscribed: Vec<Uuid>,
    pub rssi: Option<i16>,
    pub command_writers: Vec<Receiver<Vec<u8>>>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            scans: Vec::new(),
            stop_scans: 0,
            max_clients: 3,
            foreign_clients: 0,
            next_client: 0,
            live_clients: Vec::new(),
            released: Vec::new(),
            connect_results: VecDeque::new(),
            connect_calls: 0,
            disconnect_calls: 0,
            link_up: false,
            discover_failures: 0,
            discover_calls: 0,
            services: vec![lovense_service()],
            subscribed: Vec::new(),
            unsubscribed: Vec::new(),
            rssi: Some(-55),
            command_writers: Vec::new(),
        }
    }
}

impl MockState {
    /// Every command written so far, in order.
    pub fn written(&mut self) -> Vec<String> {
        let mut commands = Vec::new();
        for writer in &mut self.command_writers {
            while let Ok(Some(bytes)) = writer.try_next() {
                commands.push(String::from_utf8_lossy(&bytes).to_string());
            }
        }
        commands
    }
}

pub struct MockHost {
    pub state: Arc<Mutex<MockState>>,
}

pub struct MockClient {
    id: ClientId,
    state: Arc<Mutex<MockState>>,
}

impl BleHost for MockHost {
    type Client = MockClient;

    async fn start_scan(&mut self, duration: Duration, epoch: ScanEpoch) -> Result<(), DeviceError> {
        self.state.lock().unwrap().scans.push((duration, epoch));
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().stop_scans += 1;
        Ok(())
    }

    fn max_clients(&self) -> usize {
        self.state.lock().unwrap().max_clients
    }

    fn created_client_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.live_clients.len() + state.foreign_clients
    }

    async fn create_client(&mut self, _address: &str, _address_kind: AddressKind) -> Result<MockClient, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.next_client += 1;
        let id = ClientId(state.next_client);
        state.live_clients.push(id);
        state.link_up = false;
        Ok(MockClient { id, state: self.state.clone() })
    }

    async fn release_client(&mut self, client: MockClient) {
        let mut state = self.state.lock().unwrap();
        state.live_clients.retain(|id| *id != client.id);
        state.released.push(client.id);
    }
}

impl BleClient for MockClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        match state.connect_results.pop_front().unwrap_or(Ok(())) {
            Ok(()) => {
                state.link_up = true;
                Ok(())
            },
            Err(reason) => Err(DeviceError::Rejected(reason)),
        }
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        Ok(self.state.lock().unwrap().link_up)
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.disconnect_calls += 1;
        state.link_up = false;
        Ok(())
    }

    async fn discover_attributes(&mut self) -> Result<Vec<RemoteService>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.discover_calls += 1;
        if state.discover_failures > 0 {
            state.discover_failures -= 1;
            return Err(DeviceError::Rejected("discovery".to_string()));
        }
        Ok(state.services.clone())
    }

    async fn subscribe(&mut self, characteristic: &RemoteCharacteristic) -> Result<(), DeviceError> {
        self.state.lock().unwrap().subscribed.push(characteristic.uuid);
        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: &RemoteCharacteristic) -> Result<(), DeviceError> {
        self.state.lock().unwrap().unsubscribed.push(characteristic.uuid);
        Ok(())
    }

    fn command_channel(&mut self, characteristic: &RemoteCharacteristic) -> Result<CommandChannel, DeviceError> {
        let (sink, writer) = channel::<Vec<u8>>(COMMAND_QUEUE_SIZE);
        self.state.lock().unwrap().command_writers.push(writer);
        Ok(CommandChannel::new(characteristic.uuid, characteristic.can_write, sink))
    }

    async fn rssi(&self) -> Result<Option<i16>, DeviceError> {
        Ok(self.state.lock().unwrap().rssi)
    }
}

pub struct Harness {
    pub manager: ConnectionManager<MockHost>,
    pub mock: Arc<Mutex<MockState>>,
    pub events: HostEventSender,
}

impl Harness {
    pub fn new(config: LinkConfig) -> Self {
        let (events, receiver) = event_queue();
        let mock = Arc::new(Mutex::new(MockState::default()));
        let host = MockHost { state: mock.clone() };
        let manager = ConnectionManager::new(host, config, events.clone(), receiver);
        Harness { manager, mock, events }
    }

    pub fn send(&mut self, event: HostEvent) {
        self.events.try_send(event).unwrap();
    }

    pub fn advertise(&mut self, epoch: ScanEpoch, name: &str, address: &str) {
        self.send(HostEvent::Advertisement {
            epoch,
            advertisement: Advertisement {
                name: Some(name.to_string()),
                address: address.to_string(),
                address_kind: AddressKind::Public,
                rssi: -60,
                services: Vec::new(),
            },
        });
    }

    /// Scan and let the window end with the given devices in the results.
    pub async fn scan_with(&mut self, devices: &[(&str, &str)]) {
        self.manager.start_scan(Duration::from_secs(5)).await.unwrap();
        let epoch = self.mock.lock().unwrap().scans.last().unwrap().1;
        for (name, address) in devices {
            self.advertise(epoch, name, address);
        }
        self.send(HostEvent::ScanEnded { epoch });
    }

    pub fn current_client(&self) -> ClientId {
        *self.mock.lock().unwrap().live_clients.last().unwrap()
    }

    pub fn written(&self) -> Vec<String> {
        self.mock.lock().unwrap().written()
    }
}

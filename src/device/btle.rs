//! [`BleHost`] on top of btleplug.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use btleplug::api::{AddressType, BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{channel, Receiver};
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{COMMAND_QUEUE_SIZE, IS_CONNECTED_DEADLINE, MAX_CLIENTS, WRITE_DEADLINE};
use crate::device::host::{Advertisement, BleClient, BleHost, ClientId, ConnectFailReason, HostEvent, HostEventSender, RemoteCharacteristic, RemoteService, ScanEpoch};
use crate::device::types::AddressKind;
use crate::error::DeviceError;
use crate::protocol::CommandChannel;

/// Which scan window advertisements belong to, which peripheral a reported address names and
/// which client owns which peripheral.
#[derive(Default)]
struct Routing {
    scan: Option<ScanEpoch>,
    peripherals: HashMap<String, PeripheralId>,
    clients: HashMap<PeripheralId, ClientId>,
}

type SharedRouting = Arc<Mutex<Routing>>;

fn lock(routing: &SharedRouting) -> std::sync::MutexGuard<'_, Routing> {
    routing.lock().expect("Failed to lock btle routing")
}

fn address_kind(address_type: Option<AddressType>) -> AddressKind {
    match address_type {
        Some(AddressType::Random) => AddressKind::Random,
        _ => AddressKind::Public,
    }
}

/// CoreBluetooth hides the hardware address and always reports zeros.
fn hardware_address(address: BDAddr) -> Option<String> {
    if address == BDAddr::default() {
        None
    } else {
        Some(address.to_string())
    }
}

fn device_address(address: BDAddr, id: &PeripheralId) -> String {
    hardware_address(address).unwrap_or_else(|| format!("{:?}", id))
}

/// Queue `event` unless `cancel` fires first. False when it was not queued.
async fn send_or_cancel(cancel: &CancellationToken, events: &mut HostEventSender, event: HostEvent) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = events.send(event) => match result {
            Ok(()) => true,
            Err(_) => {
                debug!("Host event queue closed");
                false
            },
        },
    }
}

fn connect_fail_reason(err: &btleplug::Error) -> ConnectFailReason {
    match err {
        btleplug::Error::TimedOut(_) => ConnectFailReason::Timeout,
        btleplug::Error::NotConnected => ConnectFailReason::NotConnected,
        _ => ConnectFailReason::Other(-1),
    }
}

fn remote_characteristic(characteristic: &Characteristic) -> RemoteCharacteristic {
    let properties = characteristic.properties;
    RemoteCharacteristic {
        uuid: characteristic.uuid,
        can_write: properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        can_notify: properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Peripheral {:?} went away: {}", id, err);
            return None;
        },
    };

    match peripheral.properties().await {
        Ok(Some(properties)) => Some(Advertisement {
            name: properties.local_name,
            address: device_address(properties.address, id),
            address_kind: address_kind(properties.address_type),
            rssi: properties.rssi.unwrap_or(0),
            services: properties.services,
        }),
        Ok(None) => {
            trace!("Peripheral has no properties");
            None
        },
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
    }
}

fn event_pump_task(cancel: CancellationToken, adapter: Adapter, routing: SharedRouting, mut events: HostEventSender) -> JoinHandle<Result<(), DeviceError>> {
    spawn(async move {
        let mut central_events = adapter.events().await?;

        'mainloop: loop {
            let central_event = tokio::select! {
                _ = cancel.cancelled() => break 'mainloop,
                central_event = central_events.next() => match central_event {
                    Some(central_event) => central_event,
                    None => break 'mainloop,
                },
            };

            let event = match central_event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    // only advertisements seen while a scan window is open are reported
                    let scan = lock(&routing).scan;
                    let epoch = match scan {
                        Some(epoch) => epoch,
                        None => continue,
                    };
                    match advertisement(&adapter, &id).await {
                        Some(advertisement) => {
                            lock(&routing).peripherals.insert(advertisement.address.clone(), id);
                            HostEvent::Advertisement { epoch, advertisement }
                        },
                        None => continue,
                    }
                },
                CentralEvent::DeviceConnected(id) => {
                    let client = lock(&routing).clients.get(&id).copied();
                    match client {
                        Some(client) => HostEvent::LinkUp { client },
                        None => continue,
                    }
                },
                CentralEvent::DeviceDisconnected(id) => {
                    let client = lock(&routing).clients.get(&id).copied();
                    match client {
                        Some(client) => HostEvent::LinkDown { client },
                        None => continue,
                    }
                },
                _ => continue,
            };

            if !send_or_cancel(&cancel, &mut events, event).await {
                break 'mainloop;
            }
        }

        Ok(())
    })
}

fn scan_deadline_task(cancel: CancellationToken, adapter: Adapter, routing: SharedRouting, mut events: HostEventSender, duration: Duration, epoch: ScanEpoch) -> JoinHandle<()> {
    spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {},
            _ = sleep(duration) => {
                if let Err(err) = adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", err);
                }

                {
                    let mut routing = lock(&routing);
                    if routing.scan == Some(epoch) {
                        routing.scan = None;
                    }
                }

                send_or_cancel(&cancel, &mut events, HostEvent::ScanEnded { epoch }).await;
            },
        }
    })
}

fn connect_task(cancel: CancellationToken, peripheral: Peripheral, client: ClientId, mut events: HostEventSender) -> JoinHandle<()> {
    spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = peripheral.connect() => result,
        };

        let event = match result {
            Ok(()) => HostEvent::LinkUp { client },
            Err(err) => {
                warn!("Connecting to peripheral failed: {:?}", err);
                HostEvent::ConnectFailed { client, reason: connect_fail_reason(&err) }
            },
        };

        // gives up once the client is released
        send_or_cancel(&cancel, &mut events, event).await;
    })
}

fn read_notifications_task(cancel: CancellationToken, peripheral: Peripheral, client: ClientId, mut events: HostEventSender) -> JoinHandle<()> {
    spawn(async move {
        let mut notification_stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to open notification stream: {}", err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                data = notification_stream.next() => {
                    let data = match data {
                        Some(data) => data,
                        None => break 'mainloop,
                    };
                    trace!("Notification from {}: {:?}", data.uuid, String::from_utf8_lossy(&data.value));

                    let event = HostEvent::Notification { client, characteristic: data.uuid, value: data.value };
                    if !send_or_cancel(&cancel, &mut events, event).await {
                        break 'mainloop;
                    }
                },
            }
        }
    })
}

fn command_writer_task(cancel: CancellationToken, peripheral: Peripheral, characteristic: Characteristic, mut commands: Receiver<Vec<u8>>) -> JoinHandle<()> {
    spawn(async move {
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        'mainloop: loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break 'mainloop,
                command = commands.next() => match command {
                    Some(command) => command,
                    None => break 'mainloop,
                },
            };

            trace!("Writing {:?} to {}", String::from_utf8_lossy(&command), characteristic.uuid);
            tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    warn!("Sending to command characteristic took too long");
                }
                result = peripheral.write(&characteristic, &command, write_type) => {
                    if let Err(err) = result {
                        warn!("Failed to send to command characteristic: {:?}", err);
                    }
                }
            };
        }
    })
}

pub struct BtleHost {
    // dropping the manager can tear down the platform session
    _manager: Manager,
    adapter: Adapter,
    events: HostEventSender,
    routing: SharedRouting,
    cancel: CancellationToken,
    scan_cancel: Option<CancellationToken>,
    next_client: u64,
    live_clients: usize,
}

impl BtleHost {
    /// Use the first bluetooth adapter and start reporting its events to `events`.
    pub async fn new(events: HostEventSender) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let routing = SharedRouting::default();
        let cancel = CancellationToken::new();
        let pump = event_pump_task(cancel.child_token(), adapter.clone(), routing.clone(), events.clone());

        // the pump only ends early if the adapter has no event stream
        spawn(async move {
            match pump.await {
                Ok(Ok(())) => debug!("Adapter event pump stopped"),
                Ok(Err(err)) => warn!("Adapter event pump failed: {}", err),
                Err(err) => warn!("Failed to join adapter event pump: {}", err),
            }
        });

        Ok(BtleHost {
            _manager: manager,
            adapter,
            events,
            routing,
            cancel,
            scan_cancel: None,
            next_client: 0,
            live_clients: 0,
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, DeviceError> {
        let id = lock(&self.routing).peripherals.get(address).cloned();
        if let Some(id) = id {
            match self.adapter.peripheral(&id).await {
                Ok(peripheral) => return Ok(peripheral),
                Err(err) => debug!("Peripheral {} is no longer known: {}", address, err),
            }
        }

        for peripheral in self.adapter.peripherals().await? {
            if device_address(peripheral.address(), &peripheral.id()).eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }

        Err(DeviceError::UnknownDevice(address.to_string()))
    }
}

impl Drop for BtleHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl BleHost for BtleHost {
    type Client = BtleClient;

    async fn start_scan(&mut self, duration: Duration, epoch: ScanEpoch) -> Result<(), DeviceError> {
        if let Some(previous) = self.scan_cancel.take() {
            previous.cancel();
        }

        if let Err(err) = self.adapter.start_scan(ScanFilter::default()).await {
            if let btleplug::Error::PermissionDenied = err {
                warn!("Bluetooth permission denied, scanning is not possible");
            }
            return Err(err.into());
        }

        {
            let mut routing = lock(&self.routing);
            routing.scan = Some(epoch);
            routing.peripherals.clear();
        }

        let scan_cancel = self.cancel.child_token();
        scan_deadline_task(scan_cancel.clone(), self.adapter.clone(), self.routing.clone(), self.events.clone(), duration, epoch);
        self.scan_cancel = Some(scan_cancel);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        if let Some(scan_cancel) = self.scan_cancel.take() {
            scan_cancel.cancel();
        }
        lock(&self.routing).scan = None;

        self.adapter.stop_scan().await?;
        Ok(())
    }

    fn max_clients(&self) -> usize {
        MAX_CLIENTS
    }

    fn created_client_count(&self) -> usize {
        self.live_clients
    }

    async fn create_client(&mut self, address: &str, _address_kind: AddressKind) -> Result<BtleClient, DeviceError> {
        let peripheral = self.find_peripheral(address).await?;

        self.next_client += 1;
        let id = ClientId(self.next_client);
        lock(&self.routing).clients.insert(peripheral.id(), id);
        self.live_clients += 1;
        debug!("Created client {:?} for {}", id, address);

        Ok(BtleClient {
            id,
            peripheral,
            events: self.events.clone(),
            cancel: self.cancel.child_token(),
            characteristics: HashMap::new(),
            tasks: Vec::new(),
            notifications_started: false,
        })
    }

    async fn release_client(&mut self, client: BtleClient) {
        client.cancel.cancel();

        {
            let mut routing = lock(&self.routing);
            if routing.clients.get(&client.peripheral.id()) == Some(&client.id) {
                routing.clients.remove(&client.peripheral.id());
            }
        }
        self.live_clients = self.live_clients.saturating_sub(1);

        for handle in client.tasks {
            if let Err(err) = handle.await {
                warn!("Failed to join client task: {}", err);
            }
        }
        debug!("Released client {:?}", client.id);
    }
}

pub struct BtleClient {
    id: ClientId,
    peripheral: Peripheral,
    events: HostEventSender,
    cancel: CancellationToken,
    characteristics: HashMap<Uuid, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
    notifications_started: bool,
}

impl BtleClient {
    fn characteristic(&self, uuid: &Uuid) -> Result<&Characteristic, DeviceError> {
        self.characteristics.get(uuid).ok_or(DeviceError::MissingCharacteristic)
    }
}

impl BleClient for BtleClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        info!("Connecting to peripheral...");
        let handle = connect_task(self.cancel.clone(), self.peripheral.clone(), self.id, self.events.clone());
        self.tasks.push(handle);
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        tokio::select! {
            _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
                warn!("Checking for connection status took too long");
                Err(DeviceError::Timeout)
            }
            result = self.peripheral.is_connected() => Ok(result?),
        }
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_attributes(&mut self) -> Result<Vec<RemoteService>, DeviceError> {
        self.peripheral.discover_services().await?;

        let mut services = Vec::new();
        for service in self.peripheral.services() {
            let characteristics = service.characteristics.iter().map(remote_characteristic).collect();
            for characteristic in service.characteristics {
                self.characteristics.insert(characteristic.uuid, characteristic);
            }
            services.push(RemoteService { uuid: service.uuid, characteristics });
        }

        Ok(services)
    }

    async fn subscribe(&mut self, characteristic: &RemoteCharacteristic) -> Result<(), DeviceError> {
        let characteristic = self.characteristic(&characteristic.uuid)?.clone();
        self.peripheral.subscribe(&characteristic).await?;

        if !self.notifications_started {
            let handle = read_notifications_task(self.cancel.clone(), self.peripheral.clone(), self.id, self.events.clone());
            self.tasks.push(handle);
            self.notifications_started = true;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: &RemoteCharacteristic) -> Result<(), DeviceError> {
        let characteristic = self.characteristic(&characteristic.uuid)?.clone();
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    fn command_channel(&mut self, characteristic: &RemoteCharacteristic) -> Result<CommandChannel, DeviceError> {
        let target = self.characteristic(&characteristic.uuid)?.clone();
        let (sink, commands) = channel::<Vec<u8>>(COMMAND_QUEUE_SIZE);

        let handle = command_writer_task(self.cancel.clone(), self.peripheral.clone(), target, commands);
        self.tasks.push(handle);

        Ok(CommandChannel::new(characteristic.uuid, characteristic.can_write, sink))
    }

    async fn rssi(&self) -> Result<Option<i16>, DeviceError> {
        let properties = self.peripheral.properties().await?;
        Ok(properties.and_then(|properties| properties.rssi))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use super::*;
    use crate::device::host::event_queue;

    fn characteristic(properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid: Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
            service_uuid: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    #[test]
    fn characteristic_capabilities() {
        let write = remote_characteristic(&characteristic(CharPropFlags::WRITE_WITHOUT_RESPONSE));
        assert!(write.can_write);
        assert!(!write.can_notify);

        let notify = remote_characteristic(&characteristic(CharPropFlags::INDICATE | CharPropFlags::READ));
        assert!(!notify.can_write);
        assert!(notify.can_notify);
    }

    #[test]
    fn address_kinds() {
        assert_eq!(address_kind(Some(AddressType::Random)), AddressKind::Random);
        assert_eq!(address_kind(Some(AddressType::Public)), AddressKind::Public);
        assert_eq!(address_kind(None), AddressKind::Public);
    }

    #[test]
    fn zero_address_is_not_reported() {
        assert_eq!(hardware_address(BDAddr::default()), None);
        assert_eq!(hardware_address(BDAddr::from([0x01, 0x02, 0x03, 0x04, 0x05, 0xAB])), Some("01:02:03:04:05:AB".to_string()));
    }

    #[tokio::test]
    async fn cancelled_send_does_not_wait_for_queue_space() {
        let (mut events, mut receiver) = channel::<HostEvent>(0);
        let cancel = CancellationToken::new();
        events.try_send(HostEvent::ScanEnded { epoch: ScanEpoch(1) }).unwrap();

        cancel.cancel();
        assert!(!send_or_cancel(&cancel, &mut events, HostEvent::LinkUp { client: ClientId(1) }).await);

        assert_eq!(receiver.next().await, Some(HostEvent::ScanEnded { epoch: ScanEpoch(1) }));
        assert!(receiver.try_next().is_err());
    }

    #[tokio::test]
    async fn send_reports_closed_queue() {
        let (mut events, receiver) = event_queue();
        let cancel = CancellationToken::new();
        assert!(send_or_cancel(&cancel, &mut events, HostEvent::BatteryLevel(80)).await);

        drop(receiver);
        assert!(!send_or_cancel(&cancel, &mut events, HostEvent::BatteryLevel(70)).await);
    }

    #[test]
    fn connect_failures_map_to_reasons() {
        assert_eq!(connect_fail_reason(&btleplug::Error::TimedOut(Duration::from_secs(1))), ConnectFailReason::Timeout);
        assert_eq!(connect_fail_reason(&btleplug::Error::NotConnected), ConnectFailReason::NotConnected);
        assert_eq!(connect_fail_reason(&btleplug::Error::DeviceNotFound), ConnectFailReason::Other(-1));
    }
}

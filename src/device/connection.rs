use std::time::Duration;
use futures::channel::mpsc::{channel, Receiver, Sender};
use log::{debug, info, trace, warn};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::types::LinkConfig;
use crate::device::constants::{CONFIRMATION_PULSE, DISCOVERY_ATTEMPTS, DISCOVERY_SETTLE_DELAY, EVENT_QUEUE_SIZE, MAX_RECONNECT_ATTEMPTS, RSSI_REFRESH_INTERVAL};
use crate::device::host::{BleClient, BleHost, ClientId, HostEvent, HostEventReceiver, HostEventSender, RemoteCharacteristic, ScanEpoch};
use crate::device::registry::DeviceRegistry;
use crate::device::types::{CompatibleDevice, ConnectionState, DeviceEvent, DeviceInfo};
use crate::error::{CommandError, ConnectionError};
use crate::protocol::{DeviceProtocol, ResponseChannel};

/// The client context of the current connection attempt and the attributes selected on it.
struct Link<C> {
    client: C,
    service: Option<Uuid>,
    response: Option<RemoteCharacteristic>,
}

impl<C> Link<C> {
    fn new(client: C) -> Self {
        Link { client, service: None, response: None }
    }
}

/// Drives one logical connection to a compatible peripheral.
///
/// The manager is ticked by calling [`ConnectionManager::update`]. Host callbacks arrive as
/// [`HostEvent`]s on a queue that is drained at the start of every tick, so all state is only ever
/// mutated from the tick.
pub struct ConnectionManager<H: BleHost> {
    host: H,
    config: LinkConfig,
    events: HostEventReceiver,
    event_sender: HostEventSender,
    subscribers: Vec<Sender<DeviceEvent>>,

    state: ConnectionState,
    state_changed_at: Instant,

    registry: DeviceRegistry,
    scan_epoch: ScanEpoch,
    active_scan: Option<ScanEpoch>,

    current_device: Option<CompatibleDevice>,
    last_address: Option<String>,
    protocol: Option<Box<dyn DeviceProtocol>>,
    link: Option<Link<H::Client>>,

    reconnect_attempts: u32,
    last_rssi_check: Option<Instant>,
    pulse_off_at: Option<Instant>,
}

impl<H: BleHost> ConnectionManager<H> {
    /// `event_sender` and `events` are the two ends of the queue the host reports to.
    pub fn new(host: H, config: LinkConfig, event_sender: HostEventSender, events: HostEventReceiver) -> Self {
        ConnectionManager {
            host,
            config,
            events,
            event_sender,
            subscribers: Vec::new(),
            state: ConnectionState::Idle,
            state_changed_at: Instant::now(),
            registry: DeviceRegistry::new(),
            scan_epoch: ScanEpoch(0),
            active_scan: None,
            current_device: None,
            last_address: None,
            protocol: None,
            link: None,
            reconnect_attempts: 0,
            last_rssi_check: None,
            pulse_off_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.active_scan.is_some()
    }

    pub fn is_connected_state(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.current_device.as_ref().map_or(false, |device| device.connected)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn devices(&self) -> impl Iterator<Item = &CompatibleDevice> {
        self.registry.devices()
    }

    /// The device of the current connection, only while it is connected.
    pub fn current_device(&self) -> Option<&CompatibleDevice> {
        self.current_device.as_ref().filter(|device| device.connected)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Uuid of the service selected on the current link.
    pub fn service_uuid(&self) -> Option<Uuid> {
        self.link.as_ref().and_then(|link| link.service)
    }

    /// Receive every state change and every device info/battery report from now on.
    pub fn subscribe(&mut self) -> Receiver<DeviceEvent> {
        let (sender, receiver) = channel::<DeviceEvent>(EVENT_QUEUE_SIZE);
        self.subscribers.push(sender);
        receiver
    }

    pub async fn start_scan(&mut self, duration: Duration) -> Result<(), ConnectionError> {
        // scans can only be started from idle or failed states
        if self.state != ConnectionState::Idle && self.state != ConnectionState::Failed {
            info!("Cannot start scan, BLE is busy. Current state: {}", self.state);
            return Err(ConnectionError::InvalidStateTransition { operation: "start scan", state: self.state });
        }

        debug!("Starting BLE scan for compatible devices...");
        let epoch = self.scan_epoch.next();
        self.scan_epoch = epoch;

        if let Err(err) = self.host.start_scan(duration, epoch).await {
            warn!("Scanning failed {:?}", err);
            return Err(ConnectionError::ScanFailed(err.to_string()));
        }

        // results are handled as they arrive on the event queue
        self.update_status(ConnectionState::Scanning, "Start scanning").await;
        Ok(())
    }

    pub async fn stop_scan(&mut self) {
        self.cancel_scan().await;
        if self.state == ConnectionState::Scanning {
            self.update_status(ConnectionState::Idle, "Scan stopped").await;
        }
    }

    /// Stops the radio and forgets the active scan, the state is left to the caller.
    async fn cancel_scan(&mut self) {
        if self.active_scan.take().is_some() {
            debug!("Manually stopping scan");
            if let Err(err) = self.host.stop_scan().await {
                warn!("Failed to stop scan: {}", err);
            }
        }
    }

    pub async fn connect_to_device(&mut self, address: &str) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Scanning | ConnectionState::Failed | ConnectionState::Reconnecting => {},
            state => {
                info!("Cannot connect, BLE is busy. Current state: {}", state);
                return Err(ConnectionError::InvalidStateTransition { operation: "connect", state });
            },
        }

        self.cancel_scan().await;
        self.last_address = Some(address.to_string());

        let device = match self.registry.get(address) {
            Some(device) => device.clone(),
            None => {
                debug!("Device not found in scan results: {}", address);
                return self.fail(ConnectionError::DeviceNotFound(address.to_string())).await;
            },
        };

        debug!("Connecting to {} ({}) - type: {}", device.name, device.address, device.address_kind);

        // the previous client and protocol are gone before anything new is created
        self.disconnect_and_cleanup_client().await;
        self.current_device = Some(device.clone());

        self.protocol = self.create_protocol_for_device(&device);
        if self.protocol.is_none() {
            return self.fail(ConnectionError::UnsupportedProtocol).await;
        }

        if self.host.created_client_count() >= self.host.max_clients() {
            return self.fail(ConnectionError::ResourceExhausted).await;
        }

        match self.host.create_client(&device.address, device.address_kind).await {
            Ok(client) => self.link = Some(Link::new(client)),
            Err(err) => return self.fail(ConnectionError::ConnectFailed(err.to_string())).await,
        }

        self.update_status(ConnectionState::Connecting, "Connecting to device...").await;
        Ok(())
    }

    /// Connect to the last successfully connected device if it is part of the current scan results.
    pub async fn connect_to_last_device(&mut self) -> bool {
        let address = match self.config.last_connected_device.clone() {
            Some(address) => address,
            None => {
                debug!("  > No last device to reconnect to");
                return false;
            },
        };

        if !self.registry.contains(&address) {
            debug!("  > Last device not found in scan results");
            return false;
        }

        debug!("  > Attempting to reconnect to last device: {}", address);
        let _ = self.connect_to_device(&address).await;
        true
    }

    pub async fn disconnect_and_cleanup_client(&mut self) {
        debug!("  > Cleaning up ble client...");

        self.update_device_state(false);
        self.pulse_off_at = None;
        self.last_rssi_check = None;

        if let Some(protocol) = self.protocol.as_mut() {
            if let Some(channel) = protocol.clear_channels() {
                trace!("  > Unbound response channel {}", channel.uuid());
            }
        }

        // the slot is emptied first, the client is released on every path below
        if let Some(mut link) = self.link.take() {
            if let Some(characteristic) = link.response.take() {
                if let Err(err) = link.client.unsubscribe(&characteristic).await {
                    debug!("Failed to unsubscribe from {}: {}", characteristic.uuid, err);
                }
            }

            match link.client.is_connected().await {
                Ok(true) => {
                    if let Err(err) = link.client.disconnect().await {
                        warn!("Failed to disconnect: {}", err);
                    }
                },
                Ok(false) => {},
                Err(err) => warn!("Error checking for connection state: {:?}", err),
            }

            self.host.release_client(link.client).await;
        }
    }

    /// Stop everything this manager started.
    pub async fn shutdown(&mut self) {
        self.stop_scan().await;
        self.disconnect_and_cleanup_client().await;
    }

    pub async fn update(&mut self) {
        self.process_events().await;

        match self.state {
            ConnectionState::Connecting => self.handle_connecting().await,
            ConnectionState::FindingService => self.handle_finding_service().await,
            ConnectionState::Reconnecting => self.handle_reconnecting().await,
            _ => self.handle_steady().await,
        }
    }

    /// The only place the state changes.
    pub async fn update_status(&mut self, new_state: ConnectionState, reason: &str) {
        let mut new_state = new_state;

        match new_state {
            ConnectionState::Scanning => {
                self.registry.clear();
                self.active_scan = Some(self.scan_epoch);
            },
            ConnectionState::Idle => {
                self.active_scan = None;
            },
            ConnectionState::Failed => {
                // the next connect cleans up, only record that the link is gone
                self.update_device_state(false);
                if self.should_try_reconnect() {
                    new_state = ConnectionState::Reconnecting;
                }
            },
            ConnectionState::Connected => {
                self.reconnect_attempts = 0;
                if let Some(device) = &self.current_device {
                    self.config.remember_device(&device.address, &device.name);
                }
            },
            _ => {},
        }

        info!("{} -> {} :: {}", self.state, new_state, reason);

        self.state = new_state;
        self.state_changed_at = Instant::now();
        self.notify(DeviceEvent::StateChange(new_state));

        match new_state {
            ConnectionState::Connected => self.greet_device(),
            ConnectionState::Failed => self.disconnect_and_cleanup_client().await,
            _ => {},
        }
    }

    pub fn set_vibration_level(&mut self, level: u8) -> Result<(), CommandError> {
        self.ready_protocol()?.set_vibration(level)
    }

    pub fn set_rotation_level(&mut self, level: u8) -> Result<(), CommandError> {
        self.ready_protocol()?.set_rotation(level)
    }

    pub fn change_rotation_direction(&mut self) -> Result<(), CommandError> {
        self.ready_protocol()?.change_rotation_direction()
    }

    pub fn set_air_level(&mut self, level: u8) -> Result<(), CommandError> {
        self.ready_protocol()?.set_air_level(level)
    }

    pub fn adjust_air_level_relative(&mut self, inflate: bool, amount: u8) -> Result<(), CommandError> {
        self.ready_protocol()?.adjust_air_level_relative(inflate, amount)
    }

    pub fn power_off_device(&mut self) -> Result<(), CommandError> {
        self.ready_protocol()?.power_off()
    }

    pub fn query_battery_level(&mut self) -> Result<(), CommandError> {
        self.ready_protocol()?.query_battery_level()
    }

    pub fn model_display_name(&self) -> Option<String> {
        self.protocol.as_ref().map(|protocol| protocol.model_display_name())
    }

    fn ready_protocol(&mut self) -> Result<&mut Box<dyn DeviceProtocol>, CommandError> {
        match self.protocol.as_mut() {
            Some(protocol) if protocol.is_ready() => Ok(protocol),
            _ => Err(CommandError::NotReady),
        }
    }

    async fn fail(&mut self, error: ConnectionError) -> Result<(), ConnectionError> {
        self.update_status(ConnectionState::Failed, &error.to_string()).await;
        Err(error)
    }

    fn notify(&mut self, event: DeviceEvent) {
        self.subscribers.retain_mut(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(err) if err.is_disconnected() => false,
            Err(err) => {
                warn!("Dropping device event for a slow subscriber: {}", err);
                true
            },
        });
    }

    fn should_try_reconnect(&mut self) -> bool {
        if !self.config.auto_reconnect {
            debug!("Auto-reconnect not enabled");
            return false;
        }

        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            debug!("  > Max reconnection attempts reached");
            self.reconnect_attempts = 0;
            return false;
        }

        self.reconnect_attempts += 1;
        debug!("  > Reconnect attempt {} of {}", self.reconnect_attempts, MAX_RECONNECT_ATTEMPTS);
        true
    }

    fn update_device_state(&mut self, connected: bool) {
        if let Some(device) = self.current_device.as_mut() {
            device.connected = connected;
            self.registry.set_connected(&device.address, connected);
        }
    }

    fn create_protocol_for_device(&self, device: &CompatibleDevice) -> Option<Box<dyn DeviceProtocol>> {
        let mut protocol = match device.protocol.create() {
            Some(protocol) => protocol,
            None => {
                debug!("  > Device type not supported: {:?}", device.protocol);
                return None;
            },
        };
        trace!("Setting up {:?} protocol for device: {}", device.protocol, device.name);

        // reports are queued and applied on the next drain, like any other host event
        let mut info_sender = self.event_sender.clone();
        protocol.set_device_info_callback(Box::new(move |info: &DeviceInfo| {
            if let Err(err) = info_sender.try_send(HostEvent::DeviceInfo(info.clone())) {
                warn!("Failed to queue device info: {}", err);
            }
        }));

        let mut battery_sender = self.event_sender.clone();
        protocol.set_battery_level_callback(Box::new(move |level: u8| {
            if let Err(err) = battery_sender.try_send(HostEvent::BatteryLevel(level)) {
                warn!("Failed to queue battery level: {}", err);
            }
        }));

        Some(protocol)
    }

    fn greet_device(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            if let Err(err) = protocol.query_device_type() {
                warn!("Failed to query device type: {}", err);
            }
            if let Err(err) = protocol.query_battery_level() {
                warn!("Failed to query battery level: {}", err);
            }
        }

        let level = self.config.default_vibration_level;
        let pulse = if level > 0 { level } else { 1 };
        if let Err(err) = self.set_vibration_level(pulse) {
            warn!("Failed to send confirmation pulse: {}", err);
            return;
        }

        if level == 0 {
            self.pulse_off_at = Some(Instant::now() + Duration::from_millis(CONFIRMATION_PULSE));
        }
    }

    fn is_current_client(&self, client: ClientId) -> bool {
        self.link.as_ref().map_or(false, |link| link.client.id() == client)
    }

    async fn process_events(&mut self) {
        while let Ok(Some(event)) = self.events.try_next() {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Advertisement { epoch, advertisement } => {
                if self.active_scan == Some(epoch) {
                    self.registry.on_advertisement(&advertisement);
                } else {
                    trace!("Ignoring advertisement from stale scan {:?}", epoch);
                }
            },
            HostEvent::ScanEnded { epoch } => {
                if self.active_scan == Some(epoch) {
                    self.on_scan_window_end().await;
                } else {
                    debug!("Ignoring end of stale scan {:?}", epoch);
                }
            },
            HostEvent::LinkUp { client } if self.is_current_client(client) => {
                debug!("  > Connected to: {}", self.current_device.as_ref().map_or("?", |device| device.address.as_str()));
                self.update_device_state(true);
            },
            HostEvent::LinkDown { client } if self.is_current_client(client) => {
                debug!("Client disconnected");
                self.update_device_state(false);
                if matches!(self.state, ConnectionState::Connecting | ConnectionState::FindingService | ConnectionState::Connected) {
                    let _ = self.fail(ConnectionError::UnexpectedDisconnect).await;
                }
            },
            HostEvent::ConnectFailed { client, reason } if self.is_current_client(client) => {
                info!("Connection failed, reason {}", reason);
                let _ = self.fail(ConnectionError::ConnectFailed(reason.to_string())).await;
            },
            HostEvent::ConnParamsUpdateRequest { client, params } if self.is_current_client(client) => {
                debug!("Connection parameter update request received");
                debug!("  > Min interval: {}", params.interval_min);
                debug!("  > Max interval: {}", params.interval_max);
                debug!("  > Latency: {}", params.latency);
                debug!("  > Timeout: {}", params.supervision_timeout);
            },
            HostEvent::Notification { client, characteristic, value } if self.is_current_client(client) => {
                if let Some(protocol) = self.protocol.as_mut() {
                    if protocol.response_channel().map(ResponseChannel::uuid) == Some(characteristic) {
                        protocol.handle_response(&value);
                    }
                }
            },
            HostEvent::DeviceInfo(info) => {
                debug!("Got device info: Model={}, Battery={:?}, Firmware={}", info.model_type, info.battery_level, info.firmware_version);
                if let Some(device) = self.current_device.as_mut() {
                    device.model_display_name = Some(info.model_type.clone());
                    device.firmware_version = Some(info.firmware_version.clone());
                }
                self.notify(DeviceEvent::DeviceInfo(info));
            },
            HostEvent::BatteryLevel(level) => {
                debug!("Got battery level: {}%", level);
                if let Some(device) = self.current_device.as_mut() {
                    device.battery_level = Some(level);
                }
                self.notify(DeviceEvent::BatteryLevel(level));
            },
            stale => trace!("Ignoring event for a released client: {:?}", stale),
        }
    }

    async fn on_scan_window_end(&mut self) {
        debug!("  > Scan stopped, found {} devices total", self.registry.len());
        self.update_status(ConnectionState::Idle, "Scan completed").await;

        if !self.config.auto_connect {
            return;
        }

        debug!("  > Auto-connect enabled");
        let target = self.registry.auto_connect_target(self.config.last_connected_device.as_deref());
        if let Some(address) = target {
            let _ = self.connect_to_device(&address).await;
        }
    }

    async fn has_timed_out(&mut self) -> bool {
        if self.state_changed_at.elapsed() > self.config.connection_timeout() {
            debug!("{} timed out after {:?}", self.state, self.config.connection_timeout());
            let _ = self.fail(ConnectionError::Timeout).await;
            return true;
        }

        false
    }

    async fn handle_connecting(&mut self) {
        if self.has_timed_out().await {
            return;
        }

        let link = match self.link.as_mut() {
            Some(link) => link,
            None => {
                let _ = self.fail(ConnectionError::ConnectFailed("no client".to_string())).await;
                return;
            },
        };

        if matches!(link.client.is_connected().await, Ok(true)) {
            self.update_status(ConnectionState::FindingService, "already connected").await;
            return;
        }

        debug!("Attempting to connect...");
        match link.client.connect().await {
            // the link-up itself is confirmed by a LinkUp event
            Ok(()) => self.update_status(ConnectionState::FindingService, "connect() success").await,
            Err(err) => {
                let _ = self.fail(ConnectionError::ConnectFailed(err.to_string())).await;
            },
        }
    }

    async fn handle_finding_service(&mut self) {
        if self.has_timed_out().await {
            return;
        }

        let link = match self.link.as_ref() {
            Some(link) => link,
            None => {
                trace!("Client is null!");
                return;
            },
        };

        if !matches!(link.client.is_connected().await, Ok(true)) {
            trace!("Waiting for connection...");
            return;
        }

        if !self.current_device.as_ref().map_or(false, |device| device.connected) {
            debug!("Waiting for connect callback...");
            return;
        }

        match self.discover_and_bind().await {
            Ok(()) => self.update_status(ConnectionState::Connected, "Connected successfully!").await,
            Err(err) => {
                let _ = self.fail(err).await;
            },
        }
    }

    async fn discover_and_bind(&mut self) -> Result<(), ConnectionError> {
        let (link, protocol) = match (self.link.as_mut(), self.protocol.as_mut()) {
            (Some(link), Some(protocol)) => (link, protocol),
            _ => return Err(ConnectionError::DiscoveryFailure),
        };

        sleep(Duration::from_millis(DISCOVERY_SETTLE_DELAY)).await;
        debug!("  > Discovering attributes...");

        let mut services = None;
        for attempt in 1..=DISCOVERY_ATTEMPTS {
            debug!("  > Discovery attempt {}", attempt);
            match link.client.discover_attributes().await {
                Ok(found) => {
                    debug!("  > Service discovery successful");
                    services = Some(found);
                    break;
                },
                Err(err) => {
                    debug!("  > Service discovery failed ({}), retrying...", err);
                    if attempt < DISCOVERY_ATTEMPTS {
                        sleep(Duration::from_millis(DISCOVERY_SETTLE_DELAY)).await;
                    }
                },
            }
        }

        let services = match services {
            Some(services) => services,
            None => {
                debug!("  > Service discovery failed after retries");
                return Err(ConnectionError::DiscoveryFailure);
            },
        };
        debug!("  > Found services {}", services.len());

        let service = services.into_iter()
            .find(|service| {
                trace!("  > Examining service: {}", service.uuid);
                protocol.is_compatible_service(&service.uuid.to_string())
            })
            .ok_or_else(|| {
                debug!("  > No compatible service found");
                ConnectionError::DiscoveryFailure
            })?;
        debug!("    > Selected as compatible service: {}", service.uuid);
        link.service = Some(service.uuid);

        let command = service.characteristics.iter().find(|characteristic| characteristic.can_write);
        let response = service.characteristics.iter().find(|characteristic| characteristic.can_notify);

        // the command channel is mandatory, notifications are optional
        let command = command.ok_or_else(|| {
            debug!("  > No writable characteristic");
            ConnectionError::DiscoveryFailure
        })?;
        let channel = link.client.command_channel(command).map_err(|err| {
            warn!("Failed to open command channel {}: {}", command.uuid, err);
            ConnectionError::DiscoveryFailure
        })?;
        debug!("    > Selected as control characteristic: {}", command.uuid);
        protocol.bind_command_channel(channel);

        if let Some(response) = response {
            match link.client.subscribe(response).await {
                Ok(()) => {
                    debug!("    > Selected as notify characteristic: {}", response.uuid);
                    protocol.bind_response_channel(ResponseChannel::new(response.uuid));
                    link.response = Some(response.clone());
                },
                Err(err) => warn!("Failed to subscribe to {}: {}", response.uuid, err),
            }
        }

        Ok(())
    }

    async fn handle_reconnecting(&mut self) {
        match self.last_address.clone() {
            Some(address) => {
                debug!("Reconnecting to device @ {}", address);
                let _ = self.connect_to_device(&address).await;
            },
            None => {
                let _ = self.fail(ConnectionError::DeviceNotFound(String::new())).await;
            },
        }
    }

    async fn handle_steady(&mut self) {
        if let Some(at) = self.pulse_off_at {
            if Instant::now() >= at {
                self.pulse_off_at = None;
                if let Err(err) = self.set_vibration_level(0) {
                    debug!("Failed to end confirmation pulse: {}", err);
                }
            }
        }

        if !self.is_connected_state() {
            return;
        }

        let link_up = match self.link.as_ref() {
            Some(link) => matches!(link.client.is_connected().await, Ok(true)),
            None => false,
        };

        if !link_up {
            let _ = self.fail(ConnectionError::UnexpectedDisconnect).await;
            return;
        }

        let refresh_due = self.last_rssi_check
            .map_or(true, |at| at.elapsed() >= Duration::from_millis(RSSI_REFRESH_INTERVAL));
        if !refresh_due {
            return;
        }
        self.last_rssi_check = Some(Instant::now());

        if let Some(link) = self.link.as_ref() {
            match link.client.rssi().await {
                Ok(Some(rssi)) => {
                    trace!("Updating rssi for connected device: {}", rssi);
                    if let Some(device) = self.current_device.as_mut() {
                        device.rssi = rssi;
                        self.registry.set_rssi(&device.address, rssi);
                    }
                },
                Ok(None) => {},
                Err(err) => debug!("Failed to read rssi: {}", err),
            }
        }
    }
}

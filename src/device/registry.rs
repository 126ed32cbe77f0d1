use indexmap::IndexMap;
use log::{debug, trace};

use crate::device::host::Advertisement;
use crate::device::types::CompatibleDevice;
use crate::protocol::classify;

/// Compatible peripherals seen during the current scan window, in the order they were first seen.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<String, CompatibleDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry { devices: IndexMap::new() }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Record an advertisement. Returns true if it added a new compatible device.
    pub fn on_advertisement(&mut self, advertisement: &Advertisement) -> bool {
        let name = match &advertisement.name {
            Some(name) => name,
            None => return false,
        };

        trace!(
            "  > Found device: {}, address: {}, type: {}, rssi: {}, services: {:?}",
            name,
            advertisement.address,
            advertisement.address_kind,
            advertisement.rssi,
            advertisement.services,
        );

        // first seen wins within one scan window
        if self.devices.contains_key(&advertisement.address) {
            return false;
        }

        let protocol = match classify(name) {
            Some(protocol) => protocol,
            None => return false,
        };

        debug!(
            "    > Compatible device identified: {}, address: {}, type: {}",
            name, advertisement.address, advertisement.address_kind,
        );

        let device = CompatibleDevice::new(
            &advertisement.address,
            advertisement.address_kind,
            name,
            advertisement.rssi,
            protocol,
        );
        self.devices.insert(advertisement.address.clone(), device);
        true
    }

    pub fn get(&self, address: &str) -> Option<&CompatibleDevice> {
        self.devices.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(address)
    }

    pub fn set_connected(&mut self, address: &str, connected: bool) {
        if let Some(device) = self.devices.get_mut(address) {
            device.connected = connected;
            trace!("  > Updated device {} in registry to connected={}", device.name, connected);
        }
    }

    pub fn set_rssi(&mut self, address: &str, rssi: i16) {
        if let Some(device) = self.devices.get_mut(address) {
            device.rssi = rssi;
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &CompatibleDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Which device to connect to once the scan window has ended: the last connected device if it was
    /// seen again, otherwise the only device found. `None` leaves the choice to the user.
    pub fn auto_connect_target(&self, last_connected: Option<&str>) -> Option<String> {
        if let Some(address) = last_connected {
            if self.contains(address) {
                debug!("  > Last connected device {} found in scan results", address);
                return Some(address.to_string());
            }
            debug!("  > Last device not found in scan results");
        }

        if self.devices.len() == 1 {
            debug!("  > Found only one device");
            return self.devices.keys().next().cloned();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::AddressKind;
    use crate::protocol::ProtocolKind;

    fn advertisement(name: Option<&str>, address: &str, rssi: i16) -> Advertisement {
        Advertisement {
            name: name.map(str::to_string),
            address: address.to_string(),
            address_kind: AddressKind::Random,
            rssi,
            services: Vec::new(),
        }
    }

    #[test]
    fn same_address_is_recorded_once() {
        let mut registry = DeviceRegistry::new();

        assert!(registry.on_advertisement(&advertisement(Some("LVS-Nora"), "aa:bb", -60)));
        assert!(!registry.on_advertisement(&advertisement(Some("LVS-Nora2"), "aa:bb", -40)));

        assert_eq!(registry.len(), 1);
        let device = registry.get("aa:bb").unwrap();
        assert_eq!(device.name, "LVS-Nora");
        assert_eq!(device.rssi, -60);
        assert_eq!(device.protocol, ProtocolKind::Lovense);
        assert_eq!(device.address_kind, AddressKind::Random);
        assert!(!device.connected);
    }

    #[test]
    fn nameless_and_unknown_are_ignored() {
        let mut registry = DeviceRegistry::new();

        assert!(!registry.on_advertisement(&advertisement(None, "aa:bb", -60)));
        assert!(!registry.on_advertisement(&advertisement(Some("Keyboard"), "cc:dd", -60)));
        assert!(registry.is_empty());
    }

    #[test]
    fn keeps_discovery_order() {
        let mut registry = DeviceRegistry::new();
        registry.on_advertisement(&advertisement(Some("LVS-B"), "02", -60));
        registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60));

        let addresses: Vec<&str> = registry.devices().map(|device| device.address.as_str()).collect();
        assert_eq!(addresses, vec!["02", "01"]);
    }

    #[test]
    fn set_connected_by_address() {
        let mut registry = DeviceRegistry::new();
        registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60));

        registry.set_connected("01", true);
        assert!(registry.get("01").unwrap().connected);

        registry.set_connected("missing", true);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rssi_refresh_keeps_first_seen_name() {
        let mut registry = DeviceRegistry::new();
        registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60));

        registry.set_rssi("01", -48);
        registry.set_rssi("missing", -30);

        let device = registry.get("01").unwrap();
        assert_eq!(device.rssi, -48);
        assert_eq!(device.name, "LVS-A");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn auto_connect_prefers_last_connected() {
        let mut registry = DeviceRegistry::new();
        registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60));
        registry.on_advertisement(&advertisement(Some("LVS-B"), "02", -60));

        assert_eq!(registry.auto_connect_target(Some("02")), Some("02".to_string()));
        assert_eq!(registry.auto_connect_target(Some("03")), None);
        assert_eq!(registry.auto_connect_target(None), None);
    }

    #[test]
    fn auto_connect_single_device() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.auto_connect_target(None), None);

        registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60));
        assert_eq!(registry.auto_connect_target(Some("99")), Some("01".to_string()));
    }

    #[test]
    fn clear_empties_window() {
        let mut registry = DeviceRegistry::new();
        registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.on_advertisement(&advertisement(Some("LVS-A"), "01", -60)));
    }
}

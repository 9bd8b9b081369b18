//! Defines shared data structures for the Bluetooth module.

use serde::Serialize;

use crate::core::registry::{Device, LedColor, Position, SlotIndex};
use crate::core::session::SessionPhase;

/// A peripheral seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// MAC address when the platform exposes one, otherwise the platform id
    pub address: String,
    /// Advertised name, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(address: String, name: Option<String>, rssi: Option<i16>) -> Self {
        Self { address, name, rssi }
    }
}

/// State changes published by the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    DeviceAdded { address: String, slot: SlotIndex },
    DeviceRemoved { address: String },
    /// Live link status changed
    ConnectionChanged { address: String, connected: bool },
    /// The link went down outside of a deliberate disconnect
    LinkDropped { address: String },
    BatteryUpdated { address: String, level: u8 },
    SessionPhaseChanged(SessionPhase),
    FleetReset,
}

/// Snapshot of one slot for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub slot: SlotIndex,
    pub address: String,
    pub name: String,
    pub position: Option<Position>,
    pub color: LedColor,
    pub battery: String,
    pub ready: bool,
    pub connected: bool,
}

impl DeviceStatus {
    pub fn from_device(slot: SlotIndex, device: &Device, connected: bool) -> Self {
        Self {
            slot,
            address: device.address.clone(),
            name: device.name.clone(),
            position: device.position,
            color: device.color,
            battery: device.battery.clone(),
            ready: device.ready,
            connected,
        }
    }
}

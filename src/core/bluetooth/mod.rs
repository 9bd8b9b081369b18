//! Bluetooth functionality for the sensor fleet
//! This module handles all radio operations: scanning, the link to the host
//! adapter, connection supervision and the sensor command set.

mod bluest_link;
pub mod commands;
mod connection;
pub mod constants;
pub mod link;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use bluest_link::BluestLink;
pub use commands::{CommandExecutor, CommandSender, SensorCommand};
pub use connection::{ConnectionSupervisor, DeviceSession};
pub use link::{DisconnectSubscription, LinkError, RadioLink};
pub use scanner::{BluetoothScanner, DeviceCache, extract_mac_address};
pub use types::{DeviceStatus, DiscoveredDevice, FleetEvent};

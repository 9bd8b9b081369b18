//! Constants used throughout the application
//! UUIDs of the MetaWear GATT profile and the standard services the fleet
//! reads from, plus scan tuning values.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// The UUID of the MetaWear service
pub const UUID_METAWEAR_SERVICE: Uuid = Uuid::from_u128(0x326a9000_85cb_9195_d9dd_464cfbbae75a);

/// The UUID of the MetaWear command (write) characteristic
pub const UUID_METAWEAR_COMMAND_CHAR: Uuid = Uuid::from_u128(0x326a9001_85cb_9195_d9dd_464cfbbae75a);

/// Service advertised by boards sitting in the bootloader
pub const UUID_METABOOT_SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

/// Advertised name of the boards
pub const METAWEAR_NAME: &str = "MetaWear";

/// Devices weaker than this are not offered as candidates
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

/// How long a persisted address is searched for before giving up
pub const DEVICE_LOOKUP_TIMEOUT_SECS: u64 = 8;

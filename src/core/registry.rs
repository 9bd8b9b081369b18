//! Device registry
//! Holds the configured sensors (at most four), their identity attributes and
//! the persisted session clock. Pure data and validation; no I/O happens here.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Maximum number of sensors in a fleet
pub const MAX_DEVICES: usize = 4;

/// Battery text shown until the first successful read
pub const BATTERY_UNKNOWN: &str = "Unknown";

/// On-device log memory is considered exhausted after three days of recording
pub const STORAGE_LIMIT: Duration = Duration::from_secs(3 * 24 * 60 * 60);

pub type SlotIndex = usize;

/// LED identity of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LedColor {
    #[default]
    Unassigned,
    Red,
    Green,
    Blue,
    Yellow,
}

/// Order in which colors are handed out to new devices
pub const COLOR_RING: [LedColor; MAX_DEVICES] =
    [LedColor::Red, LedColor::Green, LedColor::Blue, LedColor::Yellow];

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unassigned => "unassigned",
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
        };
        f.write_str(name)
    }
}

/// Body placement of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    Wrist,
    Waist,
    RightAnkle,
    LeftAnkle,
}

impl Position {
    pub const ALL: [Position; MAX_DEVICES] = [
        Position::Wrist,
        Position::Waist,
        Position::RightAnkle,
        Position::LeftAnkle,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Wrist => "Wrist",
            Self::Waist => "Waist",
            Self::RightAnkle => "Right Ankle",
            Self::LeftAnkle => "Left Ankle",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "wrist" => Ok(Self::Wrist),
            "waist" => Ok(Self::Waist),
            "rightankle" => Ok(Self::RightAnkle),
            "leftankle" => Ok(Self::LeftAnkle),
            _ => Err(format!("unknown position: {}", s)),
        }
    }
}

/// One configured sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable radio address, primary key
    pub address: String,
    /// User or peripheral supplied label
    pub name: String,
    pub position: Option<Position>,
    pub color: LedColor,
    /// Last known charge as text ("85%") or [`BATTERY_UNKNOWN`]
    pub battery: String,
    /// Configuration complete (a position is assigned)
    pub ready: bool,
}

impl Device {
    fn new(address: &str, slot: SlotIndex, color: LedColor) -> Self {
        Self {
            address: address.to_string(),
            name: placeholder_name(slot),
            position: None,
            color,
            battery: BATTERY_UNKNOWN.to_string(),
            ready: false,
        }
    }

    pub fn is_positioned(&self) -> bool {
        self.position.is_some()
    }

    /// Parses the stored battery text back into a percentage.
    pub fn battery_percent(&self) -> Option<u8> {
        self.battery.trim_end_matches('%').trim().parse().ok()
    }
}

pub fn placeholder_name(slot: SlotIndex) -> String {
    format!("Device {}", slot + 1)
}

/// Recording clock, persisted together with the devices.
///
/// The accumulated total keeps running across stop/start cycles and restarts.
/// Every read while logging folds the time since `last_start` into the total
/// and moves `last_start` to now, so a read is also a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    is_logging: bool,
    last_start: DateTime<Utc>,
    accumulated: Duration,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            is_logging: false,
            last_start: Utc::now(),
            accumulated: Duration::ZERO,
        }
    }
}

impl SessionState {
    pub fn is_logging(&self) -> bool {
        self.is_logging
    }

    pub fn set_logging_at(&mut self, logging: bool, now: DateTime<Utc>) {
        match (self.is_logging, logging) {
            (false, true) => self.last_start = now,
            (true, _) => self.checkpoint(now),
            (false, false) => {}
        }
        self.is_logging = logging;
    }

    pub fn elapsed_at(&mut self, now: DateTime<Utc>) -> Duration {
        if self.is_logging {
            self.checkpoint(now);
        }
        self.accumulated
    }

    fn checkpoint(&mut self, now: DateTime<Utc>) {
        // A clock that went backwards contributes nothing
        let delta = (now - self.last_start).to_std().unwrap_or_default();
        self.accumulated += delta;
        self.last_start = now;
    }
}

/// Formats a recording duration as `"{d}D {h}H {m}M {s}S"`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{}D {}H {}M {}S", days, hours, minutes, seconds)
}

/// The authoritative, ordered list of configured sensors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    session: SessionState,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn addresses(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.address.clone()).collect()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index_of(address).is_some()
    }

    pub fn index_of(&self, address: &str) -> Option<SlotIndex> {
        self.devices.iter().position(|d| d.address == address)
    }

    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.address == address)
    }

    fn get_mut(&mut self, address: &str) -> Option<&mut Device> {
        let found = self.devices.iter_mut().find(|d| d.address == address);
        if found.is_none() {
            warn!("Device {} not found in registry", address);
        }
        found
    }

    pub fn capacity_reached(&self) -> bool {
        self.devices.len() >= MAX_DEVICES
    }

    /// Appends a device and gives it the next free color.
    pub fn add(&mut self, address: &str) -> Result<SlotIndex> {
        if self.capacity_reached() {
            return Err(FleetError::CapacityExceeded { max: MAX_DEVICES });
        }
        if self.contains(address) {
            return Err(FleetError::Duplicate(address.to_string()));
        }
        // Unreachable while the capacity check above holds
        let color = self.next_available_color();
        if color == LedColor::Unassigned {
            return Err(FleetError::NoColorAvailable);
        }

        let slot = self.devices.len();
        self.devices.push(Device::new(address, slot, color));
        debug!("Added {} at slot {} with color {}", address, slot, color);
        Ok(slot)
    }

    /// Removes a device; later slots shift left and its color is freed.
    pub fn remove(&mut self, address: &str) -> bool {
        match self.index_of(address) {
            Some(index) => {
                self.devices.remove(index);
                debug!("Removed {} from slot {}", address, index);
                true
            }
            None => false,
        }
    }

    pub fn next_available_color(&self) -> LedColor {
        COLOR_RING
            .into_iter()
            .find(|color| !self.devices.iter().any(|d| d.color == *color))
            .unwrap_or(LedColor::Unassigned)
    }

    /// Assigns (or clears) a position. A position held by another device is
    /// swapped: that device receives this device's previous position.
    ///
    /// Returns the addresses whose position changed.
    pub fn set_position(&mut self, address: &str, position: Option<Position>) -> Vec<String> {
        let Some(index) = self.index_of(address) else {
            warn!("Cannot set position: {} not found", address);
            return Vec::new();
        };

        let previous = self.devices[index].position;
        let mut changed = vec![address.to_string()];

        if let Some(wanted) = position {
            let holder = self
                .devices
                .iter()
                .enumerate()
                .position(|(i, d)| i != index && d.position == Some(wanted));
            if let Some(other) = holder {
                let other_device = &mut self.devices[other];
                other_device.position = previous;
                other_device.ready = previous.is_some();
                changed.push(other_device.address.clone());
            }
        }

        let device = &mut self.devices[index];
        device.position = position;
        device.ready = position.is_some();
        changed
    }

    pub fn set_name(&mut self, address: &str, name: &str) {
        if let Some(device) = self.get_mut(address) {
            device.name = name.to_string();
        }
    }

    pub fn set_battery(&mut self, address: &str, battery: &str) {
        if let Some(device) = self.get_mut(address) {
            device.battery = battery.to_string();
        }
    }

    /// Sets a color directly, refusing one that another device already holds.
    pub fn set_color(&mut self, address: &str, color: LedColor) -> Result<()> {
        if color != LedColor::Unassigned {
            if let Some(owner) = self
                .devices
                .iter()
                .find(|d| d.color == color && d.address != address)
            {
                return Err(FleetError::ColorInUse {
                    color,
                    owner: owner.address.clone(),
                });
            }
        }
        let device = self
            .get_mut(address)
            .ok_or_else(|| FleetError::NotFound(address.to_string()))?;
        device.color = color;
        Ok(())
    }

    pub fn all_positions_assigned(&self) -> bool {
        !self.devices.is_empty() && self.devices.iter().all(Device::is_positioned)
    }

    pub fn is_logging(&self) -> bool {
        self.session.is_logging()
    }

    pub fn set_logging(&mut self, logging: bool) {
        self.set_logging_at(logging, Utc::now());
    }

    pub fn set_logging_at(&mut self, logging: bool, now: DateTime<Utc>) {
        self.session.set_logging_at(logging, now);
    }

    /// Total recording time; checkpoints the clock while logging.
    pub fn session_elapsed(&mut self) -> Duration {
        self.session_elapsed_at(Utc::now())
    }

    pub fn session_elapsed_at(&mut self, now: DateTime<Utc>) -> Duration {
        self.session.elapsed_at(now)
    }

    pub fn storage_full(&mut self) -> bool {
        self.session_elapsed() >= STORAGE_LIMIT
    }
}

//! Radio link capability
//! The narrow surface the fleet core needs from a BLE stack. The core never
//! talks to an adapter directly; it goes through [`RadioLink`].

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The operation was aborted on purpose; never retried
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("link is down")]
    Disconnected,
}

impl From<bluest::Error> for LinkError {
    fn from(err: bluest::Error) -> Self {
        LinkError::Failed(err.to_string())
    }
}

/// Receives one message per unexpected link drop of a device.
/// Dropping the subscription stops the watcher behind it.
pub struct DisconnectSubscription {
    events: mpsc::UnboundedReceiver<()>,
    _guard: Option<DropGuard>,
}

impl DisconnectSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<()>, guard: Option<DropGuard>) -> Self {
        Self {
            events,
            _guard: guard,
        }
    }

    /// Waits for the next unexpected disconnect; `None` once the link side
    /// stopped watching.
    pub async fn next(&mut self) -> Option<()> {
        self.events.recv().await
    }
}

#[async_trait::async_trait]
pub trait RadioLink: Send + Sync {
    async fn connect(&self, address: &str) -> Result<(), LinkError>;

    /// Deliberate disconnect; must not be reported through
    /// [`RadioLink::subscribe_disconnects`].
    async fn disconnect(&self, address: &str) -> Result<(), LinkError>;

    async fn read_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, LinkError>;

    async fn write_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), LinkError>;

    async fn subscribe_disconnects(&self, address: &str) -> Result<DisconnectSubscription, LinkError>;
}

#[cfg(test)]
pub mod fake {
    //! Scripted in-memory link used by the unit tests.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeDevice {
        connected: bool,
        scripted_connects: VecDeque<Result<(), LinkError>>,
        battery: Option<u8>,
        watchers: Vec<mpsc::UnboundedSender<()>>,
    }

    #[derive(Default)]
    pub struct FakeLink {
        devices: Mutex<HashMap<String, FakeDevice>>,
        missing: Mutex<HashSet<Uuid>>,
        writes: Mutex<Vec<(String, Vec<u8>)>>,
        connect_calls: Mutex<Vec<String>>,
        disconnect_calls: Mutex<Vec<String>>,
    }

    impl FakeLink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues results for the next connect attempts; afterwards connects succeed.
        pub fn script_connects(&self, address: &str, results: Vec<Result<(), LinkError>>) {
            let mut devices = self.devices.lock().unwrap();
            devices
                .entry(address.to_string())
                .or_default()
                .scripted_connects
                .extend(results);
        }

        pub fn set_battery(&self, address: &str, level: u8) {
            let mut devices = self.devices.lock().unwrap();
            devices.entry(address.to_string()).or_default().battery = Some(level);
        }

        pub fn remove_characteristic(&self, uuid: Uuid) {
            self.missing.lock().unwrap().insert(uuid);
        }

        /// Simulates the peripheral going out of range.
        pub fn drop_link(&self, address: &str) {
            let mut devices = self.devices.lock().unwrap();
            if let Some(device) = devices.get_mut(address) {
                device.connected = false;
                device.watchers.retain(|tx| tx.send(()).is_ok());
            }
        }

        pub fn is_connected(&self, address: &str) -> bool {
            let devices = self.devices.lock().unwrap();
            devices.get(address).is_some_and(|d| d.connected)
        }

        pub fn writes_to(&self, address: &str) -> Vec<Vec<u8>> {
            let writes = self.writes.lock().unwrap();
            writes
                .iter()
                .filter(|(a, _)| a == address)
                .map(|(_, data)| data.clone())
                .collect()
        }

        pub fn connect_count(&self, address: &str) -> usize {
            let calls = self.connect_calls.lock().unwrap();
            calls.iter().filter(|a| a.as_str() == address).count()
        }

        pub fn disconnect_count(&self, address: &str) -> usize {
            let calls = self.disconnect_calls.lock().unwrap();
            calls.iter().filter(|a| a.as_str() == address).count()
        }
    }

    #[async_trait::async_trait]
    impl RadioLink for FakeLink {
        async fn connect(&self, address: &str) -> Result<(), LinkError> {
            self.connect_calls.lock().unwrap().push(address.to_string());
            let mut devices = self.devices.lock().unwrap();
            let device = devices.entry(address.to_string()).or_default();
            let result = device.scripted_connects.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                device.connected = true;
            }
            result
        }

        async fn disconnect(&self, address: &str) -> Result<(), LinkError> {
            self.disconnect_calls.lock().unwrap().push(address.to_string());
            let mut devices = self.devices.lock().unwrap();
            if let Some(device) = devices.get_mut(address) {
                device.connected = false;
            }
            Ok(())
        }

        async fn read_characteristic(
            &self,
            address: &str,
            _service: Uuid,
            characteristic: Uuid,
        ) -> Result<Vec<u8>, LinkError> {
            if self.missing.lock().unwrap().contains(&characteristic) {
                return Err(LinkError::CharacteristicNotFound(characteristic));
            }
            let devices = self.devices.lock().unwrap();
            let device = devices
                .get(address)
                .ok_or_else(|| LinkError::DeviceNotFound(address.to_string()))?;
            if !device.connected {
                return Err(LinkError::Disconnected);
            }
            Ok(vec![device.battery.unwrap_or(100)])
        }

        async fn write_characteristic(
            &self,
            address: &str,
            _service: Uuid,
            characteristic: Uuid,
            data: &[u8],
        ) -> Result<(), LinkError> {
            if self.missing.lock().unwrap().contains(&characteristic) {
                return Err(LinkError::CharacteristicNotFound(characteristic));
            }
            if !self.is_connected(address) {
                return Err(LinkError::Disconnected);
            }
            self.writes
                .lock()
                .unwrap()
                .push((address.to_string(), data.to_vec()));
            Ok(())
        }

        async fn subscribe_disconnects(&self, address: &str) -> Result<DisconnectSubscription, LinkError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut devices = self.devices.lock().unwrap();
            devices.entry(address.to_string()).or_default().watchers.push(tx);
            Ok(DisconnectSubscription::new(rx, None))
        }
    }
}

//! Radio link over the host Bluetooth adapter
//! Addresses are resolved to platform devices through the scan cache, the
//! adapter's connected devices, and as a last resort a short scan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::DEVICE_LOOKUP_TIMEOUT_SECS;
use crate::core::bluetooth::link::{DisconnectSubscription, LinkError, RadioLink};
use crate::core::bluetooth::scanner::{DeviceCache, device_address};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deliberate disconnects whose platform event has not arrived yet.
/// Only the event watcher consumes them, so a late event after a quick
/// reconnect is still recognized.
#[derive(Default)]
struct ExpectedDisconnects(Mutex<HashMap<String, u32>>);

impl ExpectedDisconnects {
    fn expect(&self, address: &str) {
        *lock(&self.0).entry(address.to_string()).or_default() += 1;
    }

    /// True when the event belongs to a deliberate disconnect.
    fn consume(&self, address: &str) -> bool {
        let mut pending = lock(&self.0);
        match pending.get_mut(address) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                pending.remove(address);
                true
            }
            None => false,
        }
    }
}

pub struct BluestLink {
    adapter: Adapter,
    devices: DeviceCache,
    expected_disconnects: Arc<ExpectedDisconnects>,
}

impl BluestLink {
    pub fn new(adapter: Adapter, devices: DeviceCache) -> Self {
        Self {
            adapter,
            devices,
            expected_disconnects: Arc::new(ExpectedDisconnects::default()),
        }
    }

    async fn resolve(&self, address: &str) -> Result<Device, LinkError> {
        if let Some(device) = lock(&self.devices).get(address).cloned() {
            return Ok(device);
        }

        for device in self.adapter.connected_devices().await? {
            if device_address(&device) == address {
                lock(&self.devices).insert(address.to_string(), device.clone());
                return Ok(device);
            }
        }

        debug!("{} not cached, scanning for it", address);
        let lookup = async {
            let mut scan_stream = self.adapter.scan(&[]).await?;
            while let Some(discovered) = scan_stream.next().await {
                if device_address(&discovered.device) == address {
                    return Ok(discovered.device);
                }
            }
            Err(LinkError::DeviceNotFound(address.to_string()))
        };
        let device = tokio::time::timeout(Duration::from_secs(DEVICE_LOOKUP_TIMEOUT_SECS), lookup)
            .await
            .map_err(|_| LinkError::DeviceNotFound(address.to_string()))??;
        lock(&self.devices).insert(address.to_string(), device.clone());
        Ok(device)
    }

    async fn characteristic(
        &self,
        address: &str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Characteristic, LinkError> {
        let device = self.resolve(address).await?;
        let services = device.services().await?;
        let service = services
            .iter()
            .find(|s| s.uuid() == service_uuid)
            .ok_or(LinkError::CharacteristicNotFound(service_uuid))?;

        service
            .characteristics()
            .await?
            .into_iter()
            .find(|c| c.uuid() == characteristic_uuid)
            .ok_or(LinkError::CharacteristicNotFound(characteristic_uuid))
    }
}

#[async_trait::async_trait]
impl RadioLink for BluestLink {
    async fn connect(&self, address: &str) -> Result<(), LinkError> {
        let device = self.resolve(address).await?;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", address);
            self.adapter.connect_device(&device).await?;
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), LinkError> {
        let device = self.resolve(address).await?;
        if device.is_connected().await {
            self.expected_disconnects.expect(address);
            self.adapter.disconnect_device(&device).await?;
        } else {
            debug!("Device {} not connected", address);
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, LinkError> {
        let characteristic = self.characteristic(address, service, characteristic).await?;
        Ok(characteristic.read().await?)
    }

    async fn write_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), LinkError> {
        let characteristic = self.characteristic(address, service, characteristic).await?;
        characteristic.write(data).await?;
        Ok(())
    }

    async fn subscribe_disconnects(&self, address: &str) -> Result<DisconnectSubscription, LinkError> {
        let device = self.resolve(address).await?;
        let adapter = self.adapter.clone();
        let expected = self.expected_disconnects.clone();
        let address = address.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let stop_for_task = stop.clone();

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Connection events unavailable for {}: {}", address, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = stop_for_task.cancelled() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            if expected.consume(&address) {
                                continue;
                            }
                            if tx.send(()).is_err() {
                                break;
                            }
                        }
                        Some(ConnectionEvent::Connected) => {}
                        None => break,
                    },
                }
            }
        });

        Ok(DisconnectSubscription::new(rx, Some(stop.drop_guard())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_disconnect_is_consumed_by_its_event() {
        let expected = ExpectedDisconnects::default();
        expected.expect("A");

        assert!(expected.consume("A"));
        assert!(!expected.consume("A"));
    }

    #[test]
    fn each_deliberate_disconnect_covers_one_event() {
        let expected = ExpectedDisconnects::default();
        expected.expect("A");
        expected.expect("A");

        assert!(!expected.consume("B"));
        assert!(expected.consume("A"));
        assert!(expected.consume("A"));
        assert!(!expected.consume("A"));
    }
}

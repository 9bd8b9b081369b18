use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use anyhow::Result;
use bluest::{Adapter, AdvertisingDevice, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    METAWEAR_NAME, MIN_RSSI_THRESHOLD, UUID_METABOOT_SERVICE, UUID_METAWEAR_SERVICE,
};
use crate::core::bluetooth::types::DiscoveredDevice;

/// Devices seen during scans, keyed by address. Shared with the radio link,
/// which needs a platform handle to reach an address.
pub type DeviceCache = Arc<Mutex<HashMap<String, Device>>>;

static MAC_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok());

/// Last MAC-looking part of a platform device id, upper-cased.
pub fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = MAC_PATTERN.as_ref()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}

/// Address used as the fleet key: the MAC when the platform id carries one.
pub fn device_address(device: &Device) -> String {
    let id = device.id().to_string();
    extract_mac_address(&id).unwrap_or(id)
}

/// A MetaWear board (or one sitting in its bootloader) with usable signal.
pub fn is_sensor_candidate(name: Option<&str>, services: &[Uuid], rssi: Option<i16>) -> bool {
    let strong_enough = rssi.is_some_and(|signal| signal >= MIN_RSSI_THRESHOLD);
    let advertises_sensor = services
        .iter()
        .any(|uuid| *uuid == UUID_METAWEAR_SERVICE || *uuid == UUID_METABOOT_SERVICE);
    let named_sensor = name.is_some_and(|name| name.contains(METAWEAR_NAME));
    strong_enough && (advertises_sensor || named_sensor)
}

pub struct BluetoothScanner {
    adapter: Adapter,
    devices: DeviceCache,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter, devices: DeviceCache) -> Self {
        Self {
            adapter,
            devices,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    /// Starts a background scan that sends every sensor candidate to `found`.
    pub async fn start_scan(&mut self, found: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<()> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await?;
        }

        self.cancel_token = CancellationToken::new();
        let cancel_token_for_task = self.cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let devices_for_task = self.devices.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = Self::internal_scan_task(
                adapter_for_task,
                devices_for_task,
                found,
                cancel_token_for_task,
            )
            .await
            {
                error!("Scan task failed: {}", e);
            }
        });
        self.scan_task_handle = Some(handle);

        info!("Device scan task started.");
        Ok(())
    }

    /// Scans for `duration` and returns the distinct candidates seen.
    pub async fn scan_for(&mut self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.start_scan(tx).await?;

        let mut found: Vec<DiscoveredDevice> = Vec::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(device) => {
                        match found.iter_mut().find(|d| d.address == device.address) {
                            Some(known) => *known = device,
                            None => found.push(device),
                        }
                    }
                    None => break,
                },
            }
        }

        self.stop_scan().await?;
        found.sort_by_key(|d| std::cmp::Reverse(d.rssi));
        Ok(found)
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceCache,
        found: mpsc::UnboundedSender<DiscoveredDevice>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        adapter.wait_available().await?;

        // Boards already linked to this host do not advertise
        info!("Checking for connected devices");
        for device in adapter.connected_devices().await? {
            let name = device.name().ok();
            if name.as_deref().is_some_and(|n| n.contains(METAWEAR_NAME)) {
                let rssi = device.rssi().await.ok();
                Self::emit_device_found(&devices, &found, device, name, rssi);
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let AdvertisingDevice { device, adv_data, rssi, .. } = discovered;
                            debug!("Found device - Device: {:?}, RSSI: {:?}", device, rssi);
                            let name = adv_data.local_name.clone().or_else(|| device.name().ok());
                            if is_sensor_candidate(name.as_deref(), &adv_data.services, rssi) {
                                Self::emit_device_found(&devices, &found, device, name, rssi);
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            match handle.await {
                Ok(()) => info!("Scan task finished."),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
                Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
            }
        }
        Ok(())
    }

    fn emit_device_found(
        devices: &DeviceCache,
        found: &mpsc::UnboundedSender<DiscoveredDevice>,
        device: Device,
        name: Option<String>,
        rssi: Option<i16>,
    ) {
        let address = device_address(&device);
        info!("Found sensor: Address: {}, Name: {:?}, RSSI: {:?}", address, name, rssi);

        devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(address.clone(), device);

        if found.send(DiscoveredDevice::new(address, name, rssi)).is_err() {
            debug!("Scan listener went away");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_extracted_from_platform_ids() {
        assert_eq!(
            extract_mac_address("hci0/dev_c8_4b/C8:4B:2A:11:90:01"),
            Some("C8:4B:2A:11:90:01".to_string())
        );
        assert_eq!(
            extract_mac_address("BluetoothLE#BluetoothLE00:1a:7d:da:71:13-e3-0f-6d-5a-12-7c"),
            Some("E3:0F:6D:5A:12:7C".to_string())
        );
        assert_eq!(extract_mac_address("7F3A1C2E-0000-4B5A"), None);
    }

    #[test]
    fn candidates_need_sensor_service_or_name_and_signal() {
        assert!(is_sensor_candidate(None, &[UUID_METAWEAR_SERVICE], Some(-70)));
        assert!(is_sensor_candidate(None, &[UUID_METABOOT_SERVICE], Some(-90)));
        assert!(is_sensor_candidate(Some("MetaWear"), &[], Some(-50)));
        assert!(!is_sensor_candidate(Some("MetaWear"), &[], Some(-91)));
        assert!(!is_sensor_candidate(Some("Headphones"), &[], Some(-40)));
        assert!(!is_sensor_candidate(None, &[UUID_METAWEAR_SERVICE], None));
    }
}

//! Application state management
//! This module wires the host adapter, the scanner and the fleet manager.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bluest::Adapter;
use log::info;
use tokio::sync::Mutex;

use crate::alerts::LogAlertSink;
use crate::config::AppConfig;
use crate::core::FleetManager;
use crate::core::bluetooth::{BluestLink, BluetoothScanner, DeviceCache, DiscoveredDevice};
use crate::store::SnapshotStore;

/// Global application state
pub struct AppState {
    pub fleet: Arc<FleetManager>,
    pub scanner: Arc<Mutex<BluetoothScanner>>,
    /// Candidates of the most recent scan, strongest first
    pub last_scan: Mutex<Vec<DiscoveredDevice>>,
}

impl AppState {
    /// Creates a new AppState on the default adapter.
    pub async fn new(config: &AppConfig, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let devices = DeviceCache::default();
        let scanner = BluetoothScanner::new(adapter.clone(), devices.clone());
        let link = Arc::new(BluestLink::new(adapter, devices));

        info!("Initializing FleetManager...");
        let fleet = FleetManager::new(link, store, Arc::new(LogAlertSink), config.fleet.clone()).await;

        Ok(Self {
            fleet: Arc::new(fleet),
            scanner: Arc::new(Mutex::new(scanner)),
            last_scan: Mutex::new(Vec::new()),
        })
    }
}

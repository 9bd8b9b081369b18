//! Fleet snapshot persistence
//! The registry (devices + session clock) is saved after every mutation and
//! loaded once at startup. Only the round trip matters: what was saved is
//! what comes back.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};
use tokio::fs;

use crate::core::registry::DeviceRegistry;
use crate::error::{FleetError, Result};
use crate::utils::write_file_atomically;

const SNAPSHOT_FILE_NAME: &str = "fleet_state.json";

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &DeviceRegistry) -> Result<()>;

    /// `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<DeviceRegistry>>;
}

/// Loads the last snapshot, starting fresh when there is none or it is unreadable.
pub async fn load_or_default(store: &dyn SnapshotStore) -> DeviceRegistry {
    match store.load().await {
        Ok(Some(registry)) => {
            info!(
                "Restored {} devices, logging: {}",
                registry.len(),
                registry.is_logging()
            );
            registry
        }
        Ok(None) => DeviceRegistry::new(),
        Err(e) => {
            warn!("Could not load saved state, using fresh state: {}", e);
            DeviceRegistry::new()
        }
    }
}

fn persistence_failure(e: impl std::fmt::Display) -> FleetError {
    FleetError::PersistenceFailure(e.to_string())
}

/// Pretty JSON file in the application config directory
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SNAPSHOT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, snapshot: &DeviceRegistry) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(persistence_failure)?;
        write_file_atomically(&self.path, &json)
            .await
            .map_err(persistence_failure)
    }

    async fn load(&self) -> Result<Option<DeviceRegistry>> {
        if !self.path.exists() {
            info!("No fleet snapshot at {:?}", self.path);
            return Ok(None);
        }
        let json = fs::read(&self.path).await.map_err(persistence_failure)?;
        let registry = serde_json::from_slice(&json).map_err(persistence_failure)?;
        Ok(Some(registry))
    }
}

/// Keeps the serialized snapshot in memory; used when no config directory exists.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: &DeviceRegistry) -> Result<()> {
        let json = serde_json::to_string(snapshot).map_err(persistence_failure)?;
        *self.snapshot.lock().map_err(persistence_failure)? = Some(json);
        Ok(())
    }

    async fn load(&self) -> Result<Option<DeviceRegistry>> {
        let guard = self.snapshot.lock().map_err(persistence_failure)?;
        guard
            .as_deref()
            .map(|json| serde_json::from_str(json).map_err(persistence_failure))
            .transpose()
    }
}

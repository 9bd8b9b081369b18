//! Shared fleet state handed to every component.

use std::sync::Arc;

use log::error;
use tokio::sync::{Mutex, broadcast};

use crate::alerts::AlertSink;
use crate::config::fleet_config::FleetConfig;
use crate::core::bluetooth::{ConnectionSupervisor, FleetEvent, RadioLink};
use crate::core::registry::DeviceRegistry;
use crate::store::SnapshotStore;

const EVENT_CHANNEL_CAPACITY: usize = 128;

pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

#[derive(Clone)]
pub struct FleetContext {
    pub registry: SharedRegistry,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub store: Arc<dyn SnapshotStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub events: broadcast::Sender<FleetEvent>,
    pub config: Arc<FleetConfig>,
}

impl FleetContext {
    pub fn new(
        registry: DeviceRegistry,
        link: Arc<dyn RadioLink>,
        store: Arc<dyn SnapshotStore>,
        alerts: Arc<dyn AlertSink>,
        config: FleetConfig,
    ) -> Self {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = ConnectionSupervisor::new(link, config.clone(), events.clone());
        Self {
            registry: Arc::new(Mutex::new(registry)),
            supervisor,
            store,
            alerts,
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: FleetEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Saves the current registry. A failure is logged and the in-memory
    /// state stays authoritative.
    pub async fn persist(&self) {
        let snapshot = self.registry.lock().await.clone();
        if let Err(e) = self.store.save(&snapshot).await {
            error!("{}", e);
        }
    }
}

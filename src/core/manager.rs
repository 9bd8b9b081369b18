//! Fleet manager
//! This module provides the main interface for fleet operations: device
//! configuration, the session controller and the battery monitor.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::alerts::AlertSink;
use crate::config::fleet_config::FleetConfig;
use crate::core::battery::BatteryMonitor;
use crate::core::bluetooth::{DeviceStatus, DiscoveredDevice, FleetEvent, RadioLink};
use crate::core::chains::{self, LedIdentity};
use crate::core::context::FleetContext;
use crate::core::registry::{Position, SlotIndex};
use crate::core::session::SessionController;
use crate::error::{FleetError, Result};
use crate::store::{SnapshotStore, load_or_default};

/// Manages the sensor fleet
pub struct FleetManager {
    ctx: FleetContext,
    sessions: Arc<SessionController>,
    battery: Arc<BatteryMonitor>,
}

impl FleetManager {
    /// Creates a manager from the last saved snapshot.
    pub async fn new(
        link: Arc<dyn RadioLink>,
        store: Arc<dyn SnapshotStore>,
        alerts: Arc<dyn AlertSink>,
        config: FleetConfig,
    ) -> Self {
        let registry = load_or_default(store.as_ref()).await;
        Self::with_context(FleetContext::new(registry, link, store, alerts, config)).await
    }

    pub async fn with_context(ctx: FleetContext) -> Self {
        let logging = ctx.registry.lock().await.is_logging();
        Self {
            sessions: SessionController::new(ctx.clone(), logging),
            battery: BatteryMonitor::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &FleetContext {
        &self.ctx
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    pub fn battery(&self) -> &Arc<BatteryMonitor> {
        &self.battery
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.ctx.subscribe()
    }

    /// Reconnects every restored device through the onboarding chain.
    pub async fn restore(&self) -> Vec<JoinHandle<()>> {
        let addresses = self.ctx.registry.lock().await.addresses();
        info!("Restoring {} devices", addresses.len());
        addresses
            .into_iter()
            .map(|address| self.spawn_onboarding(address))
            .collect()
    }

    /// Adds a device and starts its onboarding in the background.
    pub async fn add_device(&self, address: &str, name: Option<&str>) -> Result<SlotIndex> {
        let slot = {
            let mut registry = self.ctx.registry.lock().await;
            let slot = registry.add(address)?;
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                registry.set_name(address, name.trim());
            }
            slot
        };
        info!("Added {} at slot {}", address, slot);
        self.ctx.persist().await;
        self.ctx.emit(FleetEvent::DeviceAdded {
            address: address.to_string(),
            slot,
        });
        self.spawn_onboarding(address.to_string());
        Ok(slot)
    }

    fn spawn_onboarding(&self, address: String) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let battery = self.battery.clone();
        tokio::spawn(async move {
            let identity = {
                let registry = ctx.registry.lock().await;
                if registry.is_logging() {
                    None
                } else {
                    registry.get(&address).map(|d| LedIdentity {
                        color: d.color,
                        positioned: d.is_positioned(),
                    })
                }
            };
            match chains::onboard(&ctx.supervisor, &address, identity).await {
                Ok(level) => {
                    battery.record_level(&address, level, false).await;
                    ctx.persist().await;
                }
                Err(FleetError::ConnectCancelled(_)) => debug!("Onboarding of {} cancelled", address),
                Err(e) => warn!("Onboarding of {} failed: {}", address, e),
            }
        })
    }

    /// Removes a device, cancels its pending work and switches its LED off.
    pub async fn remove_device(&self, address: &str) -> Result<JoinHandle<()>> {
        if !self.ctx.registry.lock().await.remove(address) {
            return Err(FleetError::NotFound(address.to_string()));
        }
        self.ctx.supervisor.forget(address);
        info!("Removed {}", address);
        self.ctx.persist().await;
        self.ctx.emit(FleetEvent::DeviceRemoved {
            address: address.to_string(),
        });

        let ctx = self.ctx.clone();
        let address = address.to_string();
        Ok(tokio::spawn(async move {
            if let Err(e) = chains::release(&ctx.supervisor, &address).await {
                debug!("LED cleanup of removed {} skipped: {}", address, e);
            }
            // A re-added device owns its connection state again
            let registry = ctx.registry.lock().await;
            if !registry.contains(&address) {
                ctx.supervisor.forget(&address);
            }
        }))
    }

    /// Assigns or clears a position; a taken position is swapped. The LEDs
    /// of every affected device are refreshed in the background.
    pub async fn set_position(&self, address: &str, position: Option<Position>) -> Result<Vec<String>> {
        let changed = {
            let mut registry = self.ctx.registry.lock().await;
            if !registry.contains(address) {
                return Err(FleetError::NotFound(address.to_string()));
            }
            registry.set_position(address, position)
        };
        match position {
            Some(position) => info!("{} placed at {}", address, position),
            None => info!("{} removed from its position", address),
        }
        self.ctx.persist().await;

        for changed_address in &changed {
            let sessions = self.sessions.clone();
            let changed_address = changed_address.clone();
            tokio::spawn(async move {
                if let Err(e) = sessions.update_device_led(&changed_address).await {
                    debug!("LED update of {} skipped: {}", changed_address, e);
                }
            });
        }
        Ok(changed)
    }

    pub async fn set_name(&self, address: &str, name: &str) -> Result<()> {
        {
            let mut registry = self.ctx.registry.lock().await;
            if !registry.contains(address) {
                return Err(FleetError::NotFound(address.to_string()));
            }
            registry.set_name(address, name.trim());
        }
        self.ctx.persist().await;
        Ok(())
    }

    /// Drops discovered devices that are already configured.
    pub async fn filter_candidates(&self, discovered: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
        let registry = self.ctx.registry.lock().await;
        discovered
            .into_iter()
            .filter(|candidate| !registry.contains(&candidate.address))
            .collect()
    }

    pub async fn status(&self) -> Vec<DeviceStatus> {
        self.battery.status().await
    }
}

//! Connection supervision for the sensor fleet
//! This module tracks which sensors currently hold a live link, serializes
//! the command chains of each sensor and owns the retry policies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::fleet_config::FleetConfig;
use crate::core::bluetooth::commands::{CommandExecutor, CommandSender, SensorCommand};
use crate::core::bluetooth::constants::{
    UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_METAWEAR_COMMAND_CHAR, UUID_METAWEAR_SERVICE,
};
use crate::core::bluetooth::link::{DisconnectSubscription, LinkError, RadioLink};
use crate::core::bluetooth::types::FleetEvent;
use crate::error::{FleetError, Result};

type DeviceLock = Arc<tokio::sync::Mutex<()>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The maps stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection supervisor for the fleet
pub struct ConnectionSupervisor {
    link: Arc<dyn RadioLink>,
    config: Arc<FleetConfig>,
    events: broadcast::Sender<FleetEvent>,
    live: Mutex<HashMap<String, bool>>,
    device_locks: Mutex<HashMap<String, DeviceLock>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        link: Arc<dyn RadioLink>,
        config: Arc<FleetConfig>,
        events: broadcast::Sender<FleetEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            config,
            events,
            live: Mutex::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Whether the last connect succeeded and no unexpected drop happened since.
    pub fn is_live(&self, address: &str) -> bool {
        lock(&self.live).get(address).copied().unwrap_or(false)
    }

    /// Number of `configured` devices currently live. Entries for addresses
    /// that are no longer configured are ignored.
    pub fn connected_count(&self, configured: &[String]) -> usize {
        let live = lock(&self.live);
        configured
            .iter()
            .filter(|address| live.get(address.as_str()).copied().unwrap_or(false))
            .count()
    }

    fn set_live(&self, address: &str, connected: bool) {
        let previous = lock(&self.live).insert(address.to_string(), connected);
        if previous != Some(connected) {
            let _ = self.events.send(FleetEvent::ConnectionChanged {
                address: address.to_string(),
                connected,
            });
        }
    }

    fn device_lock(&self, address: &str) -> DeviceLock {
        lock(&self.device_locks)
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    fn cancel_token(&self, address: &str) -> CancellationToken {
        lock(&self.tokens)
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    /// Waits for exclusive use of `address` and returns the chain handle.
    pub async fn session(self: &Arc<Self>, address: &str) -> Result<DeviceSession> {
        let token = self.cancel_token(address);
        let device_lock = self.device_lock(address);
        let guard = tokio::select! {
            _ = token.cancelled() => return Err(FleetError::ConnectCancelled(address.to_string())),
            guard = device_lock.clone().lock_owned() => guard,
        };
        Ok(DeviceSession {
            supervisor: Arc::clone(self),
            address: address.to_string(),
            device_lock,
            guard: Some(guard),
            token,
        })
    }

    /// Connects and keeps retrying until the link is up or the device is
    /// forgotten. The link is left open.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<()> {
        let mut session = self.session(address).await?;
        session.connect_persistently(1).await
    }

    /// Forces a fresh link: deliberate disconnect, settle, then [`Self::connect`].
    pub async fn disconnect_then_reconnect(self: &Arc<Self>, address: &str) -> Result<()> {
        {
            let mut session = self.session(address).await?;
            if let Err(e) = session.disconnect().await {
                debug!("Disconnect before reconnect of {} failed: {}", address, e);
            }
            self.set_live(address, false);
            session.settle(self.config.reconnect_settle()).await?;
        }
        self.connect(address).await
    }

    /// Drops every piece of state kept for `address` and cancels its chains.
    /// The device lock survives while a chain still holds or awaits it, so
    /// the next chain waits for the cancelled one to wind down.
    pub fn forget(&self, address: &str) {
        if let Some(token) = lock(&self.tokens).remove(address) {
            token.cancel();
        }
        if let Some(watcher) = lock(&self.watchers).remove(address) {
            watcher.abort();
        }
        {
            let mut device_locks = lock(&self.device_locks);
            if device_locks
                .get(address)
                .is_some_and(|device_lock| Arc::strong_count(device_lock) == 1)
            {
                device_locks.remove(address);
            }
        }
        lock(&self.live).remove(address);
        debug!("Forgot connection state of {}", address);
    }

    pub fn forget_all(&self) {
        let addresses: Vec<String> = lock(&self.tokens)
            .keys()
            .chain(lock(&self.live).keys())
            .cloned()
            .collect();
        for address in addresses {
            self.forget(&address);
        }
    }

    async fn on_connected(self: &Arc<Self>, address: &str) {
        self.set_live(address, true);

        let watching = lock(&self.watchers)
            .get(address)
            .is_some_and(|watcher| !watcher.is_finished());
        if watching {
            return;
        }
        match self.link.subscribe_disconnects(address).await {
            Ok(subscription) => self.watch_disconnects(address, subscription),
            Err(e) => warn!("Cannot watch link state of {}: {}", address, e),
        }
    }

    fn watch_disconnects(self: &Arc<Self>, address: &str, mut subscription: DisconnectSubscription) {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let watched = address.to_string();
        let watcher = tokio::spawn(async move {
            while subscription.next().await.is_some() {
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                warn!("Link to {} dropped unexpectedly", watched);
                supervisor.set_live(&watched, false);
                let _ = supervisor.events.send(FleetEvent::LinkDropped {
                    address: watched.clone(),
                });
            }
        });
        if let Some(previous) = lock(&self.watchers).insert(address.to_string(), watcher) {
            previous.abort();
        }
    }
}

/// Exclusive handle on one device for the length of a command chain.
/// Other chains for the same device wait until it is dropped.
pub struct DeviceSession {
    supervisor: Arc<ConnectionSupervisor>,
    address: String,
    device_lock: DeviceLock,
    guard: Option<OwnedMutexGuard<()>>,
    token: CancellationToken,
}

impl DeviceSession {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn cancelled(&self) -> FleetError {
        FleetError::ConnectCancelled(self.address.clone())
    }

    async fn attempt_connect(&self) -> Result<()> {
        let result = tokio::select! {
            _ = self.token.cancelled() => Err(LinkError::Cancelled),
            result = self.supervisor.link.connect(&self.address) => result,
        };
        match result {
            Ok(()) => {
                info!("Connected to {}", self.address);
                self.supervisor.on_connected(&self.address).await;
                Ok(())
            }
            Err(e) => {
                let err = FleetError::from_link(&self.address, e);
                if err.is_transient() {
                    self.supervisor.set_live(&self.address, false);
                }
                Err(err)
            }
        }
    }

    /// Up to `attempts` connects, back to back. Cancellation is never retried.
    pub async fn connect_with_retry(&self, attempts: u32) -> Result<()> {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.attempt_connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt, attempts, self.address, e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| FleetError::ConnectFailed {
            address: self.address.clone(),
            reason: format!("failed after {} attempts", attempts),
        }))
    }

    /// `bounded` quick attempts, then keeps trying with a pause between
    /// attempts until connected or cancelled. The device lock is released
    /// during each pause.
    pub async fn connect_persistently(&mut self, bounded: u32) -> Result<()> {
        match self.connect_with_retry(bounded).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => info!("{}; reconnecting to {} until it succeeds", e, self.address),
        }

        let backoff = self.supervisor.config.reconnect_backoff();
        loop {
            self.pause(backoff).await?;
            match self.attempt_connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => debug!("Reconnect to {} failed: {}", self.address, e),
                Err(e) => return Err(e),
            }
        }
    }

    async fn pause(&mut self, delay: Duration) -> Result<()> {
        self.guard = None;
        self.settle(delay).await?;
        let guard = tokio::select! {
            _ = self.token.cancelled() => return Err(self.cancelled()),
            guard = self.device_lock.clone().lock_owned() => guard,
        };
        self.guard = Some(guard);
        Ok(())
    }

    /// Fixed wait that lets the radio stack settle. Ends early on cancellation.
    pub async fn settle(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(self.cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Battery level in percent from the standard battery service.
    pub async fn read_battery(&self) -> Result<u8> {
        let data = self
            .supervisor
            .link
            .read_characteristic(&self.address, UUID_BATTERY_SERVICE, UUID_BATTERY_LEVEL)
            .await
            .map_err(|e| FleetError::from_link(&self.address, e))?;
        data.first().copied().ok_or_else(|| FleetError::ModuleUnavailable {
            address: self.address.clone(),
            module: "battery level".to_string(),
        })
    }

    /// Deliberate disconnect; does not count as a link drop.
    pub async fn disconnect(&self) -> Result<()> {
        self.supervisor
            .link
            .disconnect(&self.address)
            .await
            .map_err(|e| FleetError::from_link(&self.address, e))?;
        debug!("Disconnected from {}", self.address);
        Ok(())
    }

    pub fn executor(&self) -> CommandExecutor<'_, Self> {
        CommandExecutor::new(self)
    }
}

#[async_trait::async_trait]
impl CommandSender for DeviceSession {
    async fn send_command(&self, command: SensorCommand) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(self.cancelled());
        }
        for frame in command.to_frames() {
            self.supervisor
                .link
                .write_characteristic(
                    &self.address,
                    UUID_METAWEAR_SERVICE,
                    UUID_METAWEAR_COMMAND_CHAR,
                    &frame,
                )
                .await
                .map_err(|e| FleetError::from_link(&self.address, e))?;
        }
        Ok(())
    }
}

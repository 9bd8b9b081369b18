//! Session control
//! Fleet-wide operations (start, stop, reset, reconnect) run one at a time
//! behind a single "operation in progress" flag. Each operation fans out one
//! chain per device and the flag is released once every chain finished or
//! the operation timeout elapsed, whichever comes first.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};

use crate::core::bluetooth::FleetEvent;
use crate::core::chains::{self, LedIdentity};
use crate::core::context::FleetContext;
use crate::core::registry::{Device, MAX_DEVICES};
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a reconnect-all refreshed healthy links or repaired broken ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconnectMode {
    Refresh,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    Start,
    Stop,
    Reset,
    Reconnect(ReconnectMode),
}

/// Outcome of a fleet operation once its guard was released
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub kind: OperationKind,
    pub total: usize,
    /// Device chains that completed without error
    pub succeeded: usize,
    /// Live devices among the configured ones at release time
    pub connected: usize,
    /// The guard was released by the timeout cap
    pub timed_out: bool,
}

impl fmt::Display for OperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperationKind::Reconnect(mode) => write!(
                f,
                "{:?}: {}/{} connected",
                mode, self.connected, self.total
            )?,
            kind => write!(f, "{:?}: {}/{} devices done", kind, self.succeeded, self.total)?,
        }
        if self.timed_out {
            f.write_str(" (timed out)")?;
        }
        Ok(())
    }
}

/// Holds the fleet-wide flag; dropping it releases the flag.
struct OperationGuard {
    busy: Arc<AtomicBool>,
}

impl OperationGuard {
    fn acquire(busy: &Arc<AtomicBool>) -> Result<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FleetError::OperationInProgress)?;
        Ok(Self { busy: busy.clone() })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Handle on a dispatched fleet operation
pub struct FleetOperation {
    kind: OperationKind,
    total: usize,
    handle: JoinHandle<OperationReport>,
}

impl FleetOperation {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Waits until the operation released its guard.
    pub async fn wait(self) -> OperationReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!("{:?} operation task failed: {}", self.kind, e);
                OperationReport {
                    kind: self.kind,
                    total: self.total,
                    succeeded: 0,
                    connected: 0,
                    timed_out: false,
                }
            }
        }
    }
}

fn identity_of(device: &Device) -> LedIdentity {
    LedIdentity {
        color: device.color,
        positioned: device.is_positioned(),
    }
}

pub struct SessionController {
    ctx: FleetContext,
    busy: Arc<AtomicBool>,
    phase: Mutex<SessionPhase>,
}

impl SessionController {
    /// The phase starts as `Active` when the restored registry was logging.
    pub fn new(ctx: FleetContext, logging: bool) -> Arc<Self> {
        let phase = if logging {
            SessionPhase::Active
        } else {
            SessionPhase::Idle
        };
        Arc::new(Self {
            ctx,
            busy: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(phase),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
        info!("Session phase: {}", phase);
        self.ctx.emit(FleetEvent::SessionPhaseChanged(phase));
    }

    /// Starts on-board logging on all four sensors.
    pub async fn start_session(self: &Arc<Self>) -> Result<FleetOperation> {
        let guard = OperationGuard::acquire(&self.busy)?;
        let addresses = {
            let mut registry = self.ctx.registry.lock().await;
            if registry.is_logging() {
                return Err(FleetError::SessionActive);
            }
            let addresses = registry.addresses();
            let connected = self.ctx.supervisor.connected_count(&addresses);
            let positioned = registry.all_positions_assigned();
            if addresses.len() != MAX_DEVICES || connected != MAX_DEVICES || !positioned {
                return Err(FleetError::NotReady {
                    devices: addresses.len(),
                    connected,
                    positioned,
                });
            }
            registry.set_logging(true);
            addresses
        };

        self.set_phase(SessionPhase::Starting);
        let tasks = self.dispatch(addresses.clone(), |ctx, address| async move {
            chains::start_logging(&ctx.supervisor, &address).await
        });
        self.set_phase(SessionPhase::Active);
        self.ctx.persist().await;

        Ok(self.supervise(OperationKind::Start, addresses.len(), tasks, guard, None))
    }

    /// Stops on-board logging and restores the identity LEDs.
    pub async fn stop_session(self: &Arc<Self>) -> Result<FleetOperation> {
        let guard = OperationGuard::acquire(&self.busy)?;
        let addresses = {
            let mut registry = self.ctx.registry.lock().await;
            if !registry.is_logging() {
                return Err(FleetError::SessionInactive);
            }
            registry.set_logging(false);
            registry.addresses()
        };

        self.set_phase(SessionPhase::Stopping);
        self.ctx.persist().await;
        let total = addresses.len();
        let tasks = self.dispatch(addresses, |ctx, address| async move {
            let identity = ctx
                .registry
                .lock()
                .await
                .get(&address)
                .map(identity_of)
                .ok_or_else(|| FleetError::NotFound(address.clone()))?;
            chains::stop_logging(&ctx.supervisor, &address, identity).await
        });

        Ok(self.supervise(OperationKind::Stop, total, tasks, guard, Some(SessionPhase::Idle)))
    }

    /// Turns every LED off and clears the fleet.
    pub async fn reset_fleet(self: &Arc<Self>) -> Result<FleetOperation> {
        let guard = OperationGuard::acquire(&self.busy)?;
        let addresses = {
            let mut registry = self.ctx.registry.lock().await;
            if registry.is_logging() {
                return Err(FleetError::SessionActive);
            }
            let addresses = registry.addresses();
            *registry = Default::default();
            addresses
        };
        info!("Resetting fleet of {} devices", addresses.len());
        self.ctx.emit(FleetEvent::FleetReset);

        let total = addresses.len();
        let reset_addresses = addresses.clone();
        let tasks = self.dispatch(addresses, |ctx, address| async move {
            chains::reset(&ctx.supervisor, &address).await
        });

        let ctx = self.ctx.clone();
        Ok(self.supervise_then(OperationKind::Reset, total, tasks, guard, None, async move {
            {
                // Devices added while the reset ran keep their links
                let registry = ctx.registry.lock().await;
                for address in reset_addresses.iter().filter(|a| !registry.contains(a)) {
                    ctx.supervisor.forget(address);
                }
            }
            ctx.persist().await;
        }))
    }

    /// Cycles every link. Devices that were all live are refreshed, otherwise
    /// the broken ones are repaired.
    pub async fn reconnect_all(self: &Arc<Self>) -> Result<FleetOperation> {
        let guard = OperationGuard::acquire(&self.busy)?;
        let addresses = self.ctx.registry.lock().await.addresses();
        if addresses.is_empty() {
            return Err(FleetError::NoDevices);
        }
        let mode = if self.ctx.supervisor.connected_count(&addresses) == addresses.len() {
            ReconnectMode::Refresh
        } else {
            ReconnectMode::Repair
        };
        info!("Reconnecting {} devices ({:?})", addresses.len(), mode);

        let total = addresses.len();
        let tasks = self.dispatch(addresses, |ctx, address| async move {
            ctx.supervisor.disconnect_then_reconnect(&address).await?;
            let identity = {
                let registry = ctx.registry.lock().await;
                if registry.is_logging() {
                    None
                } else {
                    registry.get(&address).map(identity_of)
                }
            };
            match identity {
                Some(identity) => {
                    let attempts = ctx.config.led_connect_attempts;
                    chains::show_identity(&ctx.supervisor, &address, identity, attempts).await
                }
                None => Ok(()),
            }
        });

        Ok(self.supervise(OperationKind::Reconnect(mode), total, tasks, guard, None))
    }

    /// Re-applies the identity LED of one device. Skipped while a fleet
    /// operation is running or the fleet is logging.
    pub async fn update_device_led(&self, address: &str) -> Result<()> {
        if self.is_busy() {
            debug!("Skipping LED update of {}: fleet operation in progress", address);
            return Err(FleetError::OperationInProgress);
        }
        let identity = {
            let registry = self.ctx.registry.lock().await;
            if registry.is_logging() {
                return Err(FleetError::SessionActive);
            }
            registry
                .get(address)
                .map(identity_of)
                .ok_or_else(|| FleetError::NotFound(address.to_string()))?
        };
        chains::show_identity(
            &self.ctx.supervisor,
            address,
            identity,
            self.ctx.config.led_connect_attempts,
        )
        .await
    }

    fn dispatch<F, Fut>(&self, addresses: Vec<String>, chain: F) -> JoinSet<(String, Result<()>)>
    where
        F: Fn(FleetContext, String) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for address in addresses {
            let task = chain(self.ctx.clone(), address.clone());
            set.spawn(async move { (address, task.await) });
        }
        set
    }

    fn supervise(
        self: &Arc<Self>,
        kind: OperationKind,
        total: usize,
        chains: JoinSet<(String, Result<()>)>,
        guard: OperationGuard,
        final_phase: Option<SessionPhase>,
    ) -> FleetOperation {
        self.supervise_then(kind, total, chains, guard, final_phase, async {})
    }

    /// Waits for the chains under the timeout cap, runs `finish`, then
    /// releases the guard. Chains still running at the cap keep running.
    fn supervise_then<Fin>(
        self: &Arc<Self>,
        kind: OperationKind,
        total: usize,
        mut chains: JoinSet<(String, Result<()>)>,
        guard: OperationGuard,
        final_phase: Option<SessionPhase>,
        finish: Fin,
    ) -> FleetOperation
    where
        Fin: Future<Output = ()> + Send + 'static,
    {
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut succeeded = 0;
            let cap = controller.ctx.config.fleet_operation_timeout();
            let drained = tokio::time::timeout(cap, async {
                while let Some(joined) = chains.join_next().await {
                    match joined {
                        Ok((_, Ok(()))) => succeeded += 1,
                        Ok((address, Err(e))) if e.is_expected() => {
                            warn!("{:?} on {} failed: {}", kind, address, e)
                        }
                        Ok((address, Err(e))) => error!("{:?} on {} failed: {}", kind, address, e),
                        Err(e) => error!("{:?} device task aborted: {}", kind, e),
                    }
                }
            })
            .await;

            let timed_out = drained.is_err();
            if timed_out {
                warn!(
                    "{:?} still has {} device chains running after {:?}, releasing anyway",
                    kind,
                    chains.len(),
                    cap
                );
                chains.detach_all();
            }

            finish.await;
            if let Some(phase) = final_phase {
                controller.set_phase(phase);
            }
            let addresses = controller.ctx.registry.lock().await.addresses();
            let report = OperationReport {
                kind,
                total,
                succeeded,
                connected: controller.ctx.supervisor.connected_count(&addresses),
                timed_out,
            };
            drop(guard);
            info!("{}", report);
            report
        });

        FleetOperation { kind, total, handle }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::core::bluetooth::commands::SensorCommand;
    use crate::core::bluetooth::link::LinkError;
    use crate::core::context::testing::{TestFleet, test_fleet};
    use crate::core::registry::{DeviceRegistry, LedColor, Position};
    use crate::store::SnapshotStore;

    const ADDRS: [&str; 4] = [
        "C8:4B:2A:11:90:0A",
        "C8:4B:2A:11:90:0B",
        "C8:4B:2A:11:90:0C",
        "C8:4B:2A:11:90:0D",
    ];

    fn registry_of(count: usize, positioned: bool) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        for (address, position) in ADDRS.iter().zip(Position::ALL).take(count) {
            registry.add(address).unwrap();
            if positioned {
                registry.set_position(address, Some(position));
            }
        }
        registry
    }

    async fn connect_all(fleet: &TestFleet, count: usize) {
        for address in ADDRS.iter().take(count) {
            fleet.ctx.supervisor.connect(address).await.unwrap();
        }
    }

    fn phases(rx: &mut broadcast::Receiver<FleetEvent>) -> Vec<SessionPhase> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FleetEvent::SessionPhaseChanged(phase) = event {
                seen.push(phase);
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn start_rejected_with_three_of_four_connected() {
        let fleet = test_fleet(registry_of(4, true));
        connect_all(&fleet, 3).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);

        let result = controller.start_session().await;

        assert!(matches!(
            result,
            Err(FleetError::NotReady { devices: 4, connected: 3, positioned: true })
        ));
        assert!(!fleet.ctx.registry.lock().await.is_logging());
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(!controller.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn start_rejected_with_missing_position() {
        let mut registry = registry_of(4, true);
        registry.set_position(ADDRS[2], None);
        let fleet = test_fleet(registry);
        connect_all(&fleet, 4).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);

        assert!(matches!(
            controller.start_session().await,
            Err(FleetError::NotReady { positioned: false, .. })
        ));
        assert!(!fleet.ctx.registry.lock().await.is_logging());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_operation_is_rejected() {
        let fleet = test_fleet(registry_of(4, true));
        connect_all(&fleet, 4).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);

        let start = controller.start_session().await.unwrap();
        assert!(controller.is_busy());
        assert!(matches!(
            controller.reconnect_all().await,
            Err(FleetError::OperationInProgress)
        ));
        assert!(matches!(
            controller.update_device_led(ADDRS[0]).await,
            Err(FleetError::OperationInProgress)
        ));

        start.wait().await;
        assert!(!controller.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn full_session_walks_all_phases() {
        let fleet = test_fleet(registry_of(4, true));
        connect_all(&fleet, 4).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);
        let mut rx = fleet.ctx.subscribe();

        let started = controller.start_session().await.unwrap().wait().await;
        assert_eq!(started.succeeded, 4);
        assert!(!started.timed_out);
        assert!(fleet.store.load().await.unwrap().unwrap().is_logging());
        assert_eq!(controller.phase(), SessionPhase::Active);
        for address in ADDRS {
            let start_frames = SensorCommand::LoggingStart { overwrite: true }.to_frames();
            assert!(fleet.link.writes_to(address).ends_with(&start_frames));
        }

        std::thread::sleep(Duration::from_millis(5));

        let stopped = controller.stop_session().await.unwrap().wait().await;
        assert_eq!(stopped.succeeded, 4);
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(!controller.is_busy());

        assert_eq!(
            phases(&mut rx),
            vec![
                SessionPhase::Starting,
                SessionPhase::Active,
                SessionPhase::Stopping,
                SessionPhase::Idle
            ]
        );
        let mut registry = fleet.ctx.registry.lock().await;
        assert!(!registry.is_logging());
        assert!(registry.session_elapsed() > Duration::ZERO);
        assert!(!fleet.store.load().await.unwrap().unwrap().is_logging());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_session_is_rejected() {
        let fleet = test_fleet(registry_of(2, false));
        let controller = SessionController::new(fleet.ctx.clone(), false);

        assert!(matches!(
            controller.stop_session().await,
            Err(FleetError::SessionInactive)
        ));
        assert!(!controller.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_does_not_block_the_others() {
        let fleet = test_fleet(registry_of(4, true));
        connect_all(&fleet, 4).await;
        fleet.link.script_connects(
            ADDRS[1],
            (0..3).map(|_| Err(LinkError::Failed("out of range".into()))).collect(),
        );
        let controller = SessionController::new(fleet.ctx.clone(), false);

        let report = controller.start_session().await.unwrap().wait().await;

        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded, 3);
        assert!(fleet.ctx.registry.lock().await.is_logging());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_stop_releases_guard_at_timeout() {
        let fleet = test_fleet(registry_of(4, true));
        connect_all(&fleet, 4).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);
        controller.start_session().await.unwrap().wait().await;
        fleet.link.script_connects(
            ADDRS[3],
            (0..1000).map(|_| Err(LinkError::Failed("gone".into()))).collect(),
        );

        let report = controller.stop_session().await.unwrap().wait().await;

        assert!(report.timed_out);
        assert_eq!(report.succeeded, 3);
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(!controller.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_turns_leds_off_and_clears_fleet() {
        let fleet = test_fleet(registry_of(3, false));
        connect_all(&fleet, 3).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);

        let operation = controller.reset_fleet().await.unwrap();
        assert!(fleet.ctx.registry.lock().await.is_empty());
        let report = operation.wait().await;

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.connected, 0);
        for address in ADDRS.iter().take(3) {
            assert_eq!(
                fleet.link.writes_to(address),
                SensorCommand::LedStop { clear: true }.to_frames()
            );
            assert!(!fleet.ctx.supervisor.is_live(address));
        }
        assert!(fleet.store.load().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn device_added_during_reset_keeps_its_link() {
        let fleet = test_fleet(registry_of(3, false));
        connect_all(&fleet, 3).await;
        let controller = SessionController::new(fleet.ctx.clone(), false);

        let operation = controller.reset_fleet().await.unwrap();
        fleet.ctx.registry.lock().await.add(ADDRS[3]).unwrap();
        fleet.ctx.supervisor.connect(ADDRS[3]).await.unwrap();
        operation.wait().await;

        assert!(fleet.ctx.supervisor.is_live(ADDRS[3]));
        for address in ADDRS.iter().take(3) {
            assert!(!fleet.ctx.supervisor.is_live(address));
        }
        assert_eq!(fleet.store.load().await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_refused_while_logging() {
        let mut registry = registry_of(4, true);
        registry.set_logging(true);
        let fleet = test_fleet(registry);
        let controller = SessionController::new(fleet.ctx.clone(), true);

        assert!(matches!(
            controller.reset_fleet().await,
            Err(FleetError::SessionActive)
        ));
        assert_eq!(fleet.ctx.registry.lock().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reports_mode() {
        let fleet = test_fleet(registry_of(2, false));
        let controller = SessionController::new(fleet.ctx.clone(), false);

        let repair = controller.reconnect_all().await.unwrap().wait().await;
        assert_eq!(repair.kind, OperationKind::Reconnect(ReconnectMode::Repair));
        assert_eq!(repair.connected, 2);

        let refresh = controller.reconnect_all().await.unwrap().wait().await;
        assert_eq!(refresh.kind, OperationKind::Reconnect(ReconnectMode::Refresh));
        assert_eq!(refresh.to_string(), "Refresh: 2/2 connected");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_without_devices_is_rejected() {
        let fleet = test_fleet(DeviceRegistry::new());
        let controller = SessionController::new(fleet.ctx.clone(), false);

        assert!(matches!(
            controller.reconnect_all().await,
            Err(FleetError::NoDevices)
        ));
        assert!(!controller.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn led_update_blinks_unpositioned_device() {
        let fleet = test_fleet(registry_of(1, false));
        let controller = SessionController::new(fleet.ctx.clone(), false);

        controller.update_device_led(ADDRS[0]).await.unwrap();

        let blink = crate::core::bluetooth::commands::led_program(
            LedColor::Red,
            crate::core::bluetooth::commands::PatternPreset::Blink,
            crate::core::bluetooth::commands::REPEAT_FOREVER,
        );
        let expected: Vec<Vec<u8>> = blink.iter().flat_map(|c| c.to_frames()).collect();
        assert_eq!(fleet.link.writes_to(ADDRS[0]), expected);
    }
}

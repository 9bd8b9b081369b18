//! Battery monitoring
//! While a session is logging, every sensor is polled on a fixed interval.
//! Low charge raises an alert and, under a lower threshold, pulses the LED.
//! Storage exhaustion is checked once per tick.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, MEMORY_ALERT_KEY};
use crate::core::bluetooth::{DeviceStatus, FleetEvent};
use crate::core::chains;
use crate::core::context::FleetContext;
use crate::core::registry::format_elapsed;

pub struct BatteryMonitor {
    ctx: FleetContext,
}

impl BatteryMonitor {
    pub fn new(ctx: FleetContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Runs [`Self::tick`] every poll interval until `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = self.ctx.config.battery_poll_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Battery monitor polling every {:?}", period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.tick().await;
                    }
                }
            }
            info!("Battery monitor stopped");
        })
    }

    /// One polling round. Does nothing unless the fleet is logging.
    /// Returns the number of devices read successfully.
    pub async fn tick(&self) -> usize {
        let targets: Vec<_> = {
            let registry = self.ctx.registry.lock().await;
            if !registry.is_logging() {
                debug!("Not logging, skipping battery poll");
                return 0;
            }
            registry
                .devices()
                .iter()
                .map(|d| (d.address.clone(), d.color))
                .collect()
        };

        let mut polls = JoinSet::new();
        for (address, color) in targets {
            let supervisor = self.ctx.supervisor.clone();
            polls.spawn(async move {
                let level = chains::poll_battery(&supervisor, &address, color).await;
                (address, level)
            });
        }

        let mut read = 0;
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok((address, Ok(level))) => {
                    self.record_level(&address, level, true).await;
                    read += 1;
                }
                Ok((address, Err(e))) => warn!("Battery poll of {} failed: {}", address, e),
                Err(e) => warn!("Battery poll task aborted: {}", e),
            }
        }
        self.ctx.persist().await;
        self.check_storage().await;
        read
    }

    pub(crate) async fn record_level(&self, address: &str, level: u8, alert: bool) {
        let name = {
            let mut registry = self.ctx.registry.lock().await;
            registry.set_battery(address, &format!("{}%", level));
            registry.get(address).map(|d| d.name.clone())
        };
        // Removed while the read was in flight
        let Some(name) = name else {
            return;
        };
        self.ctx.emit(FleetEvent::BatteryUpdated {
            address: address.to_string(),
            level,
        });
        if alert && level < self.ctx.config.low_battery_alert_percent {
            self.ctx
                .alerts
                .notify(Alert::new(address, format!("{} Low Battery: {}%", name, level)));
        }
    }

    async fn check_storage(&self) {
        let full = {
            let mut registry = self.ctx.registry.lock().await;
            registry
                .storage_full()
                .then(|| registry.session_elapsed())
        };
        if let Some(elapsed) = full {
            self.ctx.alerts.notify(Alert::new(
                MEMORY_ALERT_KEY,
                format!("Memory Full - {}", format_elapsed(elapsed)),
            ));
        }
    }

    /// Reads every device now, logging or not. Results that arrive before
    /// the status timeout are applied; the status of all devices is returned.
    pub async fn refresh_status(&self) -> Vec<DeviceStatus> {
        let addresses = self.ctx.registry.lock().await.addresses();
        let mut reads = JoinSet::new();
        for address in addresses {
            let supervisor = self.ctx.supervisor.clone();
            reads.spawn(async move {
                let level = chains::read_status(&supervisor, &address).await;
                (address, level)
            });
        }

        let timeout = self.ctx.config.status_timeout();
        let collected = tokio::time::timeout(timeout, async {
            while let Some(joined) = reads.join_next().await {
                match joined {
                    Ok((address, Ok(level))) => self.record_level(&address, level, false).await,
                    Ok((address, Err(e))) => warn!("Status read of {} failed: {}", address, e),
                    Err(e) => warn!("Status read task aborted: {}", e),
                }
            }
        })
        .await;
        if collected.is_err() {
            warn!("Status refresh timed out after {:?}, showing partial results", timeout);
            // Late reads still run to their disconnect
            reads.detach_all();
        }

        self.ctx.persist().await;
        self.status().await
    }

    pub async fn status(&self) -> Vec<DeviceStatus> {
        let registry = self.ctx.registry.lock().await;
        registry
            .devices()
            .iter()
            .enumerate()
            .map(|(slot, device)| {
                DeviceStatus::from_device(slot, device, self.ctx.supervisor.is_live(&device.address))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::alerts::notification_id;
    use crate::core::bluetooth::link::LinkError;
    use crate::config::fleet_config::FleetConfig;
    use crate::core::context::testing::{test_fleet, test_fleet_with};
    use crate::core::registry::{BATTERY_UNKNOWN, DeviceRegistry};

    const ADDRS: [&str; 3] = ["E3:0F:6D:5A:12:01", "E3:0F:6D:5A:12:02", "E3:0F:6D:5A:12:03"];

    fn registry(logging: bool) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        for address in ADDRS {
            registry.add(address).unwrap();
        }
        if logging {
            registry.set_logging(true);
        }
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_a_no_op_when_idle() {
        let fleet = test_fleet(registry(false));
        let monitor = BatteryMonitor::new(fleet.ctx.clone());

        assert_eq!(monitor.tick().await, 0);
        assert_eq!(fleet.link.connect_count(ADDRS[0]), 0);
        assert!(fleet.alerts.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_records_levels_and_alerts_low_devices() {
        let fleet = test_fleet(registry(true));
        fleet.link.set_battery(ADDRS[0], 80);
        fleet.link.set_battery(ADDRS[1], 25);
        fleet.link.set_battery(ADDRS[2], 30);
        let monitor = BatteryMonitor::new(fleet.ctx.clone());

        assert_eq!(monitor.tick().await, 3);

        let registry = fleet.ctx.registry.lock().await;
        assert_eq!(registry.get(ADDRS[0]).unwrap().battery, "80%");
        assert_eq!(registry.get(ADDRS[1]).unwrap().battery, "25%");
        let alerts = fleet.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].text, "Device 2 Low Battery: 25%");
        assert_eq!(alerts[0].id, notification_id(ADDRS[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_keeps_previous_level() {
        let fleet = test_fleet(registry(true));
        fleet.link.script_connects(
            ADDRS[2],
            vec![Err(LinkError::Failed("x".into())), Err(LinkError::Failed("y".into()))],
        );
        let monitor = BatteryMonitor::new(fleet.ctx.clone());

        assert_eq!(monitor.tick().await, 2);
        assert_eq!(
            fleet.ctx.registry.lock().await.get(ADDRS[2]).unwrap().battery,
            BATTERY_UNKNOWN
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_alert_after_three_days() {
        let mut registry = registry(false);
        registry.set_logging_at(true, Utc::now() - TimeDelta::days(3) - TimeDelta::hours(1));
        let fleet = test_fleet(registry);
        let monitor = BatteryMonitor::new(fleet.ctx.clone());

        monitor.tick().await;

        let memory: Vec<_> = fleet
            .alerts
            .alerts()
            .into_iter()
            .filter(|a| a.key == MEMORY_ALERT_KEY)
            .collect();
        assert_eq!(memory.len(), 1);
        assert!(memory[0].text.starts_with("Memory Full - 3D 1H"));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_polls_on_interval_until_shutdown() {
        let fleet = test_fleet(registry(true));
        let monitor = BatteryMonitor::new(fleet.ctx.clone());
        let shutdown = CancellationToken::new();
        let handle = monitor.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fleet.link.connect_count(ADDRS[0]), 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fleet.link.connect_count(ADDRS[0]), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_status_reads_while_idle() {
        let fleet = test_fleet(registry(false));
        fleet.link.set_battery(ADDRS[1], 15);
        let monitor = BatteryMonitor::new(fleet.ctx.clone());

        let status = monitor.refresh_status().await;

        assert_eq!(status.len(), 3);
        assert_eq!(status[1].battery, "15%");
        assert_eq!(status[1].slot, 1);
        // Status reads never alert
        assert!(fleet.alerts.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_status_returns_partial_results_on_timeout() {
        let fleet = test_fleet(registry(false));
        fleet.link.set_battery(ADDRS[0], 70);
        let monitor = BatteryMonitor::new(fleet.ctx.clone());
        // Hold the device lock so the read for ADDRS[2] cannot start
        let blocker = fleet.ctx.supervisor.session(ADDRS[2]).await.unwrap();

        let status = monitor.refresh_status().await;

        assert_eq!(status[0].battery, "70%");
        assert_eq!(status[2].battery, BATTERY_UNKNOWN);
        drop(blocker);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_refresh_still_disconnects_every_device() {
        let config = FleetConfig {
            status_settle_ms: 15_000,
            ..FleetConfig::default()
        };
        let fleet = test_fleet_with(registry(false), config);
        let monitor = BatteryMonitor::new(fleet.ctx.clone());

        monitor.refresh_status().await;
        for address in ADDRS {
            assert!(fleet.link.is_connected(address));
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        for address in ADDRS {
            assert!(!fleet.link.is_connected(address));
            assert_eq!(fleet.link.disconnect_count(address), 1);
        }
    }
}

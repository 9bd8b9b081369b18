use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and policy knobs of the fleet.
///
/// The settle delays are empirical waits that let the radio stack stabilize
/// after a state-changing operation; they are not completion confirmations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Settle after a short configuration step before disconnecting
    pub connection_settle_ms: u64,
    /// Settle after starting on-board logging
    pub logging_start_settle_ms: u64,
    /// Settle after stopping on-board logging
    pub logging_stop_settle_ms: u64,
    /// Settle after programming an LED pattern
    pub led_settle_ms: u64,
    /// Settle after switching the LED off during a reset
    pub reset_settle_ms: u64,
    /// Settle after switching the LED off for a removed device
    pub removal_settle_ms: u64,
    /// Wait between the forced disconnect and the reconnect of a refresh
    pub reconnect_settle_ms: u64,
    /// Settle after the battery read of the onboarding chain
    pub onboarding_settle_ms: u64,
    /// Settle after the battery read of an on-demand status refresh
    pub status_settle_ms: u64,
    /// Pause between attempts of the unbounded reconnect loop
    pub reconnect_backoff_ms: u64,

    pub start_connect_attempts: u32,
    pub reset_connect_attempts: u32,
    pub battery_connect_attempts: u32,
    pub led_connect_attempts: u32,
    pub onboarding_connect_attempts: u32,

    pub battery_poll_interval_secs: u64,
    /// Below this charge a low-battery alert is raised
    pub low_battery_alert_percent: u8,
    /// Below this charge the board pulses its LED while logging
    pub low_battery_led_percent: u8,

    /// Upper bound before a fleet operation releases its guard anyway
    pub fleet_operation_timeout_secs: u64,
    /// Upper bound for an on-demand status refresh
    pub status_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            connection_settle_ms: 200,
            logging_start_settle_ms: 500,
            logging_stop_settle_ms: 300,
            led_settle_ms: 1000,
            reset_settle_ms: 1500,
            removal_settle_ms: 100,
            reconnect_settle_ms: 1500,
            onboarding_settle_ms: 1000,
            status_settle_ms: 500,
            reconnect_backoff_ms: 1000,
            start_connect_attempts: 3,
            reset_connect_attempts: 3,
            battery_connect_attempts: 2,
            led_connect_attempts: 2,
            onboarding_connect_attempts: 3,
            battery_poll_interval_secs: 300,
            low_battery_alert_percent: 30,
            low_battery_led_percent: 20,
            fleet_operation_timeout_secs: 20,
            status_timeout_secs: 10,
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl FleetConfig {
    pub fn connection_settle(&self) -> Duration {
        ms(self.connection_settle_ms)
    }

    pub fn logging_start_settle(&self) -> Duration {
        ms(self.logging_start_settle_ms)
    }

    pub fn logging_stop_settle(&self) -> Duration {
        ms(self.logging_stop_settle_ms)
    }

    pub fn led_settle(&self) -> Duration {
        ms(self.led_settle_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        ms(self.reset_settle_ms)
    }

    pub fn removal_settle(&self) -> Duration {
        ms(self.removal_settle_ms)
    }

    pub fn reconnect_settle(&self) -> Duration {
        ms(self.reconnect_settle_ms)
    }

    pub fn onboarding_settle(&self) -> Duration {
        ms(self.onboarding_settle_ms)
    }

    pub fn status_settle(&self) -> Duration {
        ms(self.status_settle_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        ms(self.reconnect_backoff_ms)
    }

    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_interval_secs)
    }

    pub fn fleet_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.fleet_operation_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

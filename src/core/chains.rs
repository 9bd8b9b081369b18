//! Per-device command chains
//! Each chain holds the device session from connect to disconnect, so two
//! chains never interleave on one sensor. Settle waits are part of the chain.

use std::sync::Arc;

use log::{debug, info};

use crate::core::bluetooth::{ConnectionSupervisor, DeviceSession};
use crate::core::registry::LedColor;
use crate::error::Result;

/// LED state a device should show when idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedIdentity {
    pub color: LedColor,
    pub positioned: bool,
}

/// Disconnects, then reports the chain outcome first and the disconnect
/// failure second.
async fn close(session: &DeviceSession, outcome: Result<()>) -> Result<()> {
    let closed = session.disconnect().await;
    outcome.and(closed)
}

/// Initial setup of a newly added or restored device. Returns the battery level.
pub async fn onboard(
    supervisor: &Arc<ConnectionSupervisor>,
    address: &str,
    identity: Option<LedIdentity>,
) -> Result<u8> {
    let config = supervisor.config();
    let mut session = supervisor.session(address).await?;
    session
        .connect_persistently(config.onboarding_connect_attempts)
        .await?;

    let mut level = 0;
    let outcome = async {
        let executor = session.executor();
        executor.apply_connection_parameters().await?;
        if let Some(identity) = identity {
            executor
                .show_identity(identity.color, identity.positioned)
                .await?;
        }
        level = session.read_battery().await?;
        session.settle(config.onboarding_settle()).await
    }
    .await;

    close(&session, outcome).await?;
    info!("Onboarded {} (battery {}%)", address, level);
    Ok(level)
}

/// LED off, fast connection parameters, start on-board logging.
pub async fn start_logging(supervisor: &Arc<ConnectionSupervisor>, address: &str) -> Result<()> {
    let config = supervisor.config();
    let session = supervisor.session(address).await?;
    session.connect_with_retry(config.start_connect_attempts).await?;

    let outcome = async {
        let executor = session.executor();
        executor.turn_off_led().await?;
        executor.apply_connection_parameters().await?;
        executor.start_logging().await?;
        session.settle(config.logging_start_settle()).await
    }
    .await;
    close(&session, outcome).await
}

/// Stops on-board logging, reconnecting as long as it takes, then restores
/// the identity LED.
pub async fn stop_logging(
    supervisor: &Arc<ConnectionSupervisor>,
    address: &str,
    identity: LedIdentity,
) -> Result<()> {
    let config = supervisor.config();
    {
        let mut session = supervisor.session(address).await?;
        session.connect_persistently(1).await?;

        let outcome = async {
            let executor = session.executor();
            executor.apply_connection_parameters().await?;
            executor.stop_logging().await?;
            session.settle(config.logging_stop_settle()).await
        }
        .await;
        close(&session, outcome).await?;
    }

    show_identity(supervisor, address, identity, 1).await
}

/// Shows the blink or solid identity pattern.
pub async fn show_identity(
    supervisor: &Arc<ConnectionSupervisor>,
    address: &str,
    identity: LedIdentity,
    attempts: u32,
) -> Result<()> {
    let session = supervisor.session(address).await?;
    session.connect_with_retry(attempts).await?;

    let outcome = async {
        session
            .executor()
            .show_identity(identity.color, identity.positioned)
            .await?;
        session.settle(supervisor.config().led_settle()).await
    }
    .await;
    close(&session, outcome).await
}

/// Switches the LED off before the fleet is cleared.
pub async fn reset(supervisor: &Arc<ConnectionSupervisor>, address: &str) -> Result<()> {
    let config = supervisor.config();
    let session = supervisor.session(address).await?;
    session.connect_with_retry(config.reset_connect_attempts).await?;

    let outcome = async {
        session.executor().turn_off_led().await?;
        session.settle(config.reset_settle()).await
    }
    .await;
    close(&session, outcome).await
}

/// Best-effort LED off for a device that was just removed. One attempt only.
pub async fn release(supervisor: &Arc<ConnectionSupervisor>, address: &str) -> Result<()> {
    let session = supervisor.session(address).await?;
    session.connect_with_retry(1).await?;

    let outcome = async {
        session.executor().turn_off_led().await?;
        session.settle(supervisor.config().removal_settle()).await
    }
    .await;
    close(&session, outcome).await
}

/// Periodic battery read while logging. Pulses the LED when the charge is
/// under the LED threshold.
pub async fn poll_battery(
    supervisor: &Arc<ConnectionSupervisor>,
    address: &str,
    color: LedColor,
) -> Result<u8> {
    let config = supervisor.config();
    let session = supervisor.session(address).await?;
    session.connect_with_retry(config.battery_connect_attempts).await?;

    let mut level = 0;
    let outcome = async {
        level = session.read_battery().await?;
        if level < config.low_battery_led_percent {
            debug!("{} at {}%, pulsing LED", address, level);
            session.executor().low_battery_pulse(color).await?;
        }
        session.settle(config.connection_settle()).await
    }
    .await;
    close(&session, outcome).await?;
    Ok(level)
}

/// On-demand battery read, independent of the session state.
pub async fn read_status(supervisor: &Arc<ConnectionSupervisor>, address: &str) -> Result<u8> {
    let config = supervisor.config();
    let session = supervisor.session(address).await?;
    session.connect_with_retry(config.start_connect_attempts).await?;

    let mut level = 0;
    let outcome = async {
        level = session.read_battery().await?;
        session.settle(config.status_settle()).await
    }
    .await;
    close(&session, outcome).await?;
    Ok(level)
}

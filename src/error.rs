//! Error types for the sensor fleet
//! Domain failures are tagged so callers can tell a transient radio hiccup
//! from an invariant violation or an internal fault.

use thiserror::Error;

use crate::core::bluetooth::LinkError;
use crate::core::registry::LedColor;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("maximum of {max} devices already configured")]
    CapacityExceeded { max: usize },

    #[error("device {0} is already configured")]
    Duplicate(String),

    #[error("device {0} is not configured")]
    NotFound(String),

    #[error("no LED color left to assign")]
    NoColorAvailable,

    #[error("color {color:?} is already assigned to {owner}")]
    ColorInUse { color: LedColor, owner: String },

    #[error("connection to {0} was cancelled")]
    ConnectCancelled(String),

    #[error("connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("link to {0} dropped")]
    LinkDropped(String),

    #[error("{module} is not available on {address}")]
    ModuleUnavailable { address: String, module: String },

    #[error("failed to persist fleet state: {0}")]
    PersistenceFailure(String),

    #[error("another fleet operation is in progress")]
    OperationInProgress,

    #[error("fleet not ready: {devices}/4 devices, {connected} connected, positions assigned: {positioned}")]
    NotReady {
        devices: usize,
        connected: usize,
        positioned: bool,
    },

    #[error("a logging session is active")]
    SessionActive,

    #[error("no logging session is active")]
    SessionInactive,

    #[error("no devices configured")]
    NoDevices,
}

impl FleetError {
    /// Maps a radio failure on `address` into the fleet taxonomy.
    pub fn from_link(address: &str, err: LinkError) -> Self {
        match err {
            LinkError::Cancelled => Self::ConnectCancelled(address.to_string()),
            LinkError::Disconnected => Self::LinkDropped(address.to_string()),
            LinkError::CharacteristicNotFound(uuid) => Self::ModuleUnavailable {
                address: address.to_string(),
                module: uuid.to_string(),
            },
            LinkError::DeviceNotFound(reason) | LinkError::Failed(reason) => Self::ConnectFailed {
                address: address.to_string(),
                reason,
            },
        }
    }

    /// Failures worth retrying under the caller's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::LinkDropped(_))
    }

    /// Expected failures are shown to the user as a short message; everything
    /// else is logged and the operation fails silently.
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            Self::NoColorAvailable | Self::PersistenceFailure(_) | Self::ModuleUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_errors_map_onto_fleet_taxonomy() {
        let cancelled = FleetError::from_link("AA", LinkError::Cancelled);
        assert!(matches!(cancelled, FleetError::ConnectCancelled(_)));
        assert!(!cancelled.is_transient());

        let failed = FleetError::from_link("AA", LinkError::Failed("timeout".into()));
        assert!(failed.is_transient());

        let missing = FleetError::from_link("AA", LinkError::CharacteristicNotFound(uuid::Uuid::nil()));
        assert!(matches!(missing, FleetError::ModuleUnavailable { .. }));
        assert!(!missing.is_expected());
    }
}

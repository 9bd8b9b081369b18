//! Core functionality of the sensor fleet
//! Registry, connection supervision, session control and battery monitoring.

pub mod battery;
pub mod bluetooth;
pub mod chains;
pub mod context;
pub mod manager;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use context::FleetContext;
pub use manager::FleetManager;
pub use session::{OperationReport, SessionPhase};

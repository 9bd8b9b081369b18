//! Sensor fleet library
//! Manages up to four MetaWear motion sensors: registration, connection
//! supervision, logging sessions and battery monitoring.

// Module declarations
pub mod alerts;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;
pub mod store;
pub mod utils;

//! MyH2O Bridge Library
//!
//! This library polls the Fort Worth MyH2O water portal and republishes its
//! meter readings to Home Assistant, both as live sensors and as backdated
//! hourly history.

pub mod backfill;
pub mod bridge_coordinator;
pub mod config;
pub mod error;
pub mod history;
pub mod history_importer;
pub mod home_assistant;
pub mod live_poller;
pub mod portal;
pub mod readings;
pub mod scheduler;
pub mod usage_parser;

// Re-export commonly used types for easier access
pub use backfill::ImportMode;
pub use bridge_coordinator::BridgeCoordinator;
pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use home_assistant::{HomeAssistantAPI, StateSink};
pub use readings::{Classification, Delta, PublishedState, Reading};
pub use usage_parser::UsageSnapshot;

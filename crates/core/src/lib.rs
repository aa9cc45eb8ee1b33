//! Core functionality for the fleetloop transport dispatcher.
//!
//! This crate provides the loop topology, the mission model, configuration,
//! logging initialisation and the persistent store used across the workspace.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod mission;
pub mod store;
pub mod types;

pub use config::{
    BatteryConfig, FacilityConfig, FacilityMode, FleetConfig, LoggingConfig, SeedMission,
    ServerConfig, StoreConfig, TimingConfig,
};
pub use error::{Error, Result};
pub use mission::{Mission, MissionError, MissionPhase, MissionStatus};
pub use store::{BatterySample, FacilityRecord, FleetStore, SqliteStore, StoreError};
pub use types::{now_ms, Direction, ParseTokenError, Position, Route};

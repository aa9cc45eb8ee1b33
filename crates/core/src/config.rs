//! Configuration management for fleetloop.
//!
//! Every timeout, threshold and wait time the dispatcher uses lives here.
//! Missing sections fall back to the defaults below.

use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Position;

/// Top-level dispatcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// TCP listener settings
    pub server: ServerConfig,
    /// Persistent store settings
    pub store: StoreConfig,
    /// Log output settings
    pub logging: LoggingConfig,
    /// Battery thresholds
    pub battery: BatteryConfig,
    /// Timeouts and retry policy
    pub timing: TimingConfig,
    /// Infrastructure link settings
    pub facility: FacilityConfig,
    /// Missions enqueued at start-up when the queue is empty
    pub seed_missions: Vec<SeedMission>,
}

/// TCP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the truck/device listener binds to
    pub listen_addr: String,
    /// Identifier used as `sender` on outbound messages
    pub server_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            server_id: "SERVER".to_string(),
        }
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "data/fleetloop.db".to_string(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Battery thresholds (percent)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// At or below this level a truck is sent to charge
    pub low_threshold: u8,
    /// Level at which charging is complete
    pub full_level: u8,
    /// Let a low-battery truck that is already at standby take a mission
    pub allow_low_battery_at_standby: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            low_threshold: 30,
            full_level: 100,
            allow_low_battery_at_standby: false,
        }
    }
}

/// Timeouts and retry policy (milliseconds unless noted)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Gate acknowledgment timeout per attempt
    pub gate_timeout_ms: u64,
    /// Belt acknowledgment timeout per attempt
    pub belt_timeout_ms: u64,
    /// Dispenser acknowledgment timeout per attempt
    pub dispenser_timeout_ms: u64,
    /// Force-complete a load when DISPENSER_LOADED never arrives
    pub loading_safety_timeout_ms: u64,
    /// Attempts per infrastructure command before force-advancing
    pub retry_attempts: u32,
    /// Pause between infrastructure attempts
    pub retry_backoff_ms: u64,
    /// Attempts when a resource is busy with another truck's operation
    pub busy_retry_attempts: u32,
    /// Pause between busy retries
    pub busy_retry_backoff_ms: u64,
    /// Repeats of the same signal inside this window are dropped
    pub dedup_window_ms: u64,
    /// `wait_time` sent with NO_MISSION (seconds)
    pub no_mission_wait_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            gate_timeout_ms: 12_000,
            belt_timeout_ms: 10_000,
            dispenser_timeout_ms: 10_000,
            loading_safety_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            busy_retry_attempts: 5,
            busy_retry_backoff_ms: 500,
            dedup_window_ms: 1_000,
            no_mission_wait_secs: 10,
        }
    }
}

impl TimingConfig {
    /// Gate acknowledgment timeout
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    /// Belt acknowledgment timeout
    pub fn belt_timeout(&self) -> Duration {
        Duration::from_millis(self.belt_timeout_ms)
    }

    /// Dispenser acknowledgment timeout
    pub fn dispenser_timeout(&self) -> Duration {
        Duration::from_millis(self.dispenser_timeout_ms)
    }

    /// Loading safety timeout
    pub fn loading_safety_timeout(&self) -> Duration {
        Duration::from_millis(self.loading_safety_timeout_ms)
    }

    /// Backoff between infrastructure attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Backoff between busy retries
    pub fn busy_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_retry_backoff_ms)
    }

    /// Idempotency window
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// How infrastructure commands reach the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacilityMode {
    /// In-process simulator acknowledges every command
    Simulated,
    /// Devices connect to the TCP server under their resource id
    Network,
}

/// Infrastructure link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacilityConfig {
    /// Link implementation
    pub mode: FacilityMode,
    /// Simulated acknowledgment latency
    pub sim_ack_delay_ms: u64,
    /// Simulated time from dispenser open to LOADED
    pub sim_load_delay_ms: u64,
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self {
            mode: FacilityMode::Simulated,
            sim_ack_delay_ms: 200,
            sim_load_delay_ms: 3_000,
        }
    }
}

/// Mission enqueued at start-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedMission {
    /// Cargo description
    pub cargo_type: String,
    /// Cargo quantity
    pub cargo_amount: u32,
    /// Load bay (`LOAD_A` or `LOAD_B`)
    pub source: Position,
}

impl FleetConfig {
    /// Load configuration from a TOML file
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FleetConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatcher cannot operate with
    pub fn validate(&self) -> Result<()> {
        let battery = &self.battery;
        if battery.full_level > 100 || battery.low_threshold > 100 {
            return Err(Error::Config(
                "battery levels must be within 0..=100".to_string(),
            ));
        }
        if battery.low_threshold >= battery.full_level {
            return Err(Error::Config(format!(
                "low_threshold {} must be below full_level {}",
                battery.low_threshold, battery.full_level
            )));
        }

        let timing = &self.timing;
        if timing.gate_timeout_ms == 0
            || timing.belt_timeout_ms == 0
            || timing.dispenser_timeout_ms == 0
            || timing.loading_safety_timeout_ms == 0
        {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if timing.dedup_window_ms == 0 {
            return Err(Error::Config("dedup_window_ms must be non-zero".to_string()));
        }

        if let Some(seed) = self.seed_missions.iter().find(|m| !m.source.is_load_bay()) {
            return Err(Error::Config(format!(
                "seed mission source {} is not a load bay",
                seed.source
            )));
        }

        Ok(())
    }
}

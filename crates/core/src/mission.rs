//! Mission lifecycle model
//!
//! A mission is one cargo transport task from a load bay to the unload belt.
//! Status changes are validated here; ownership of live missions belongs to
//! the mission queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{ParseTokenError, Position};

/// Mission errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MissionError {
    /// Status change not allowed from the current status
    #[error("Invalid mission transition for {mission_id}: {from} -> {to}")]
    InvalidTransition {
        /// Mission identifier
        mission_id: String,
        /// Current status
        from: MissionStatus,
        /// Requested status
        to: MissionStatus,
    },

    /// Source is not a load bay
    #[error("Invalid mission source: {0}")]
    InvalidSource(Position),
}

/// Mission lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    /// Queued, not yet assigned
    Waiting,
    /// Bound to a truck
    Assigned,
    /// Cargo delivered and truck back at standby
    Completed,
    /// Withdrawn
    Canceled,
    /// Execution failed; can only be canceled
    Error,
}

impl MissionStatus {
    /// Check if state is terminal (completed or canceled)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionStatus::Completed | MissionStatus::Canceled)
    }

    /// Check if transition to new state is valid
    pub fn can_transition_to(&self, new_status: MissionStatus) -> bool {
        match (self, new_status) {
            (MissionStatus::Waiting, MissionStatus::Assigned) => true,
            (MissionStatus::Waiting, MissionStatus::Canceled) => true,
            (MissionStatus::Assigned, MissionStatus::Completed) => true,
            (MissionStatus::Assigned, MissionStatus::Canceled) => true,
            (MissionStatus::Assigned, MissionStatus::Error) => true,
            (MissionStatus::Error, MissionStatus::Canceled) => true,
            _ => false,
        }
    }

    /// Storage / wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Waiting => "WAITING",
            MissionStatus::Assigned => "ASSIGNED",
            MissionStatus::Completed => "COMPLETED",
            MissionStatus::Canceled => "CANCELED",
            MissionStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MissionStatus {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WAITING" => Ok(MissionStatus::Waiting),
            "ASSIGNED" => Ok(MissionStatus::Assigned),
            "COMPLETED" => Ok(MissionStatus::Completed),
            "CANCELED" | "CANCELLED" => Ok(MissionStatus::Canceled),
            "ERROR" => Ok(MissionStatus::Error),
            _ => Err(ParseTokenError {
                kind: "mission status",
                value: s.to_string(),
            }),
        }
    }
}

/// Progress of a truck through its bound mission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionPhase {
    /// No mission bound
    None,
    /// Heading for the load bay
    ToLoading,
    /// Stopped at the load bay
    AtLoading,
    /// Loaded, heading for the belt
    ToUnloading,
    /// Stopped at the belt
    AtUnloading,
    /// Unloaded, heading back to standby
    Returning,
    /// Back at standby, mission closed
    Completed,
}

/// Cargo transport mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    /// Unique mission identifier
    pub mission_id: String,
    /// Cargo description
    pub cargo_type: String,
    /// Cargo quantity
    pub cargo_amount: u32,
    /// Load bay the cargo is collected from
    pub source: Position,
    /// Always the unload belt
    pub destination: Position,
    /// Current lifecycle status
    pub status: MissionStatus,
    /// Truck the mission is bound to, if any
    pub assigned_truck_id: Option<String>,
    /// Creation timestamp (Unix epoch milliseconds)
    pub created_at: u64,
    /// Assignment timestamp
    pub assigned_at: Option<u64>,
    /// Completion / cancellation timestamp
    pub completed_at: Option<u64>,
}

impl Mission {
    /// Create a new waiting mission
    pub fn new(
        mission_id: impl Into<String>,
        cargo_type: impl Into<String>,
        cargo_amount: u32,
        source: Position,
        timestamp: u64,
    ) -> Result<Self, MissionError> {
        if !source.is_load_bay() {
            return Err(MissionError::InvalidSource(source));
        }

        Ok(Self {
            mission_id: mission_id.into(),
            cargo_type: cargo_type.into(),
            cargo_amount,
            source,
            destination: Position::Belt,
            status: MissionStatus::Waiting,
            assigned_truck_id: None,
            created_at: timestamp,
            assigned_at: None,
            completed_at: None,
        })
    }

    /// Transition to a new status, stamping the matching timestamp
    pub fn transition(&mut self, new_status: MissionStatus, timestamp: u64) -> Result<(), MissionError> {
        if !self.status.can_transition_to(new_status) {
            return Err(MissionError::InvalidTransition {
                mission_id: self.mission_id.clone(),
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;
        match new_status {
            MissionStatus::Assigned => self.assigned_at = Some(timestamp),
            MissionStatus::Completed | MissionStatus::Canceled => {
                self.completed_at = Some(timestamp)
            }
            _ => {}
        }

        Ok(())
    }

    /// Bind to a truck and mark assigned
    pub fn assign(&mut self, truck_id: impl Into<String>, timestamp: u64) -> Result<(), MissionError> {
        self.transition(MissionStatus::Assigned, timestamp)?;
        self.assigned_truck_id = Some(truck_id.into());
        Ok(())
    }

    /// Check if mission is closed
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

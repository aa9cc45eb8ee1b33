//! Gate controller
//!
//! At rest a gate is CLOSED or OPENED; OPENING and CLOSING exist only while
//! an acknowledgment is awaited.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::link::{DeviceAction, DeviceCommand, DeviceStatus, ResourceKind};
use crate::operation::{DevicePort, InFlight, OperationOutcome};
use crate::FacilityError;

/// Gate states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    /// Barrier down
    Closed,
    /// Open requested, awaiting acknowledgment
    Opening,
    /// Barrier up
    Opened,
    /// Close requested, awaiting acknowledgment
    Closing,
}

impl GateState {
    /// Audit token
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Closed => "CLOSED",
            GateState::Opening => "OPENING",
            GateState::Opened => "OPENED",
            GateState::Closing => "CLOSING",
        }
    }

    /// Sub-activity reported alongside the state
    pub fn operation(&self) -> &'static str {
        match self {
            GateState::Opening => "OPENING",
            GateState::Closing => "CLOSING",
            GateState::Closed | GateState::Opened => "IDLE",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller for one gate
pub struct GateController {
    gate_id: String,
    state: Mutex<GateState>,
    in_flight: InFlight,
    port: DevicePort,
}

impl GateController {
    pub(crate) fn new(gate_id: impl Into<String>, port: DevicePort) -> Self {
        Self {
            gate_id: gate_id.into(),
            state: Mutex::new(GateState::Closed),
            in_flight: InFlight::default(),
            port,
        }
    }

    /// Gate identifier
    pub fn id(&self) -> &str {
        &self.gate_id
    }

    /// Current state
    pub fn state(&self) -> GateState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an open/close is awaiting acknowledgment
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_set()
    }

    fn set_state(&self, state: GateState, detail: Option<String>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.port
            .audit(ResourceKind::Gate, &self.gate_id, state.as_str(), state.operation(), detail);
    }

    /// Open the gate and wait for the acknowledgment
    pub async fn open(&self) -> Result<OperationOutcome, FacilityError> {
        self.transition(DeviceAction::Open, GateState::Opening, GateState::Opened, DeviceStatus::Opened)
            .await
    }

    /// Close the gate and wait for the acknowledgment
    pub async fn close(&self) -> Result<OperationOutcome, FacilityError> {
        self.transition(DeviceAction::Close, GateState::Closing, GateState::Closed, DeviceStatus::Closed)
            .await
    }

    async fn transition(
        &self,
        action: DeviceAction,
        pending: GateState,
        target: GateState,
        expect: DeviceStatus,
    ) -> Result<OperationOutcome, FacilityError> {
        let _guard = self.in_flight.try_begin(&self.gate_id)?;

        if self.state() == target {
            return Ok(OperationOutcome::AlreadyInState);
        }

        self.set_state(pending, None);
        let command = DeviceCommand::new(self.gate_id.clone(), action);

        match self.port.execute(&command, &[expect]).await {
            Some(_) => {
                self.set_state(target, None);
                info!(gate_id = %self.gate_id, state = %target, "Gate confirmed");
                Ok(OperationOutcome::Confirmed)
            }
            None => {
                self.set_state(target, Some("forced after retries".to_string()));
                warn!(gate_id = %self.gate_id, state = %target, "Gate forced to expected state");
                Ok(OperationOutcome::Forced)
            }
        }
    }

    /// Record an unsolicited status report
    pub(crate) fn observe(&self, status: DeviceStatus) {
        if self.is_busy() {
            return;
        }
        let observed = match status {
            DeviceStatus::Opened => GateState::Opened,
            DeviceStatus::Closed => GateState::Closed,
            _ => return,
        };
        if self.state() != observed {
            self.set_state(observed, Some("reported by device".to_string()));
        }
    }
}

//! Belt controller
//!
//! STOPPED / RUNNING, plus a full sensor that preempts RUN.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::link::{DeviceAction, DeviceCommand, DeviceStatus, ResourceKind};
use crate::operation::{DevicePort, InFlight, OperationOutcome};
use crate::FacilityError;

/// Belt states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BeltState {
    /// Conveyor halted
    Stopped,
    /// Conveyor moving
    Running,
}

impl BeltState {
    /// Audit token
    pub fn as_str(&self) -> &'static str {
        match self {
            BeltState::Stopped => "STOPPED",
            BeltState::Running => "RUNNING",
        }
    }
}

impl fmt::Display for BeltState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller for the unloading belt
pub struct BeltController {
    belt_id: String,
    state: Mutex<BeltState>,
    full: AtomicBool,
    // Bumped by every emergency stop; a pending run/stop that sees it move
    // leaves the state alone
    epoch: AtomicU64,
    in_flight: InFlight,
    port: DevicePort,
}

impl BeltController {
    pub(crate) fn new(belt_id: impl Into<String>, port: DevicePort) -> Self {
        Self {
            belt_id: belt_id.into(),
            state: Mutex::new(BeltState::Stopped),
            full: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            in_flight: InFlight::default(),
            port,
        }
    }

    /// Belt identifier
    pub fn id(&self) -> &str {
        &self.belt_id
    }

    /// Current state
    pub fn state(&self) -> BeltState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the full sensor is tripped
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::SeqCst)
    }

    /// Whether a run/stop is awaiting acknowledgment
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_set()
    }

    fn operation(&self) -> &'static str {
        if self.is_busy() {
            "PENDING"
        } else if self.is_full() {
            "FULL"
        } else {
            "IDLE"
        }
    }

    fn set_state(&self, state: BeltState, detail: Option<String>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.port
            .audit(ResourceKind::Belt, &self.belt_id, state.as_str(), self.operation(), detail);
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start the belt; refused while the full sensor is tripped
    pub async fn run(&self) -> Result<OperationOutcome, FacilityError> {
        if self.is_full() {
            return Err(FacilityError::BeltFull(self.belt_id.clone()));
        }
        let _guard = self.in_flight.try_begin(&self.belt_id)?;
        if self.state() == BeltState::Running {
            return Ok(OperationOutcome::AlreadyInState);
        }

        let started = self.epoch();
        let command = DeviceCommand::new(self.belt_id.clone(), DeviceAction::Run);
        let ack = self
            .port
            .execute(&command, &[DeviceStatus::Running, DeviceStatus::Full])
            .await;
        if self.epoch() != started {
            warn!(belt_id = %self.belt_id, "Belt RUN overtaken by emergency stop");
            return Err(FacilityError::Interrupted(self.belt_id.clone()));
        }

        match ack {
            Some(DeviceStatus::Full) => {
                self.set_full(true);
                warn!(belt_id = %self.belt_id, "Belt refused RUN: full");
                Err(FacilityError::BeltFull(self.belt_id.clone()))
            }
            Some(_) => {
                self.set_state(BeltState::Running, None);
                info!(belt_id = %self.belt_id, "Belt running");
                Ok(OperationOutcome::Confirmed)
            }
            None => {
                self.set_state(BeltState::Running, Some("forced after retries".to_string()));
                warn!(belt_id = %self.belt_id, "Belt forced to RUNNING");
                Ok(OperationOutcome::Forced)
            }
        }
    }

    /// Stop the belt
    pub async fn stop(&self) -> Result<OperationOutcome, FacilityError> {
        let _guard = self.in_flight.try_begin(&self.belt_id)?;
        if self.state() == BeltState::Stopped {
            return Ok(OperationOutcome::AlreadyInState);
        }
        let started = self.epoch();
        let outcome = self.send_stop().await;
        if self.epoch() != started {
            return Err(FacilityError::Interrupted(self.belt_id.clone()));
        }
        self.settle_stopped(outcome);
        Ok(outcome)
    }

    /// Stop the belt now, whatever else is pending
    ///
    /// Ignores the in-flight flag and always sends STOP since the recorded
    /// state may be stale. Any run or stop still awaiting its acknowledgment
    /// finishes as [`FacilityError::Interrupted`] without touching the state.
    pub async fn force_stop(&self) -> OperationOutcome {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let outcome = self.send_stop().await;
        self.settle_stopped(outcome);
        outcome
    }

    async fn send_stop(&self) -> OperationOutcome {
        let command = DeviceCommand::new(self.belt_id.clone(), DeviceAction::Stop);
        match self.port.execute(&command, &[DeviceStatus::Stopped]).await {
            Some(_) => OperationOutcome::Confirmed,
            None => OperationOutcome::Forced,
        }
    }

    fn settle_stopped(&self, outcome: OperationOutcome) {
        if outcome == OperationOutcome::Forced {
            self.set_state(BeltState::Stopped, Some("forced after retries".to_string()));
            warn!(belt_id = %self.belt_id, "Belt forced to STOPPED");
        } else {
            self.set_state(BeltState::Stopped, None);
            info!(belt_id = %self.belt_id, "Belt stopped");
        }
    }

    /// Record the full sensor input
    pub(crate) fn set_full(&self, full: bool) {
        if self.full.swap(full, Ordering::SeqCst) != full {
            info!(belt_id = %self.belt_id, full, "Belt full sensor changed");
            let detail = if full { "full" } else { "cleared" };
            self.port.audit(
                ResourceKind::Belt,
                &self.belt_id,
                self.state().as_str(),
                self.operation(),
                Some(detail.to_string()),
            );
        }
    }

    /// Record an unsolicited status report
    pub(crate) fn observe(&self, status: DeviceStatus) {
        match status {
            DeviceStatus::Full => self.set_full(true),
            DeviceStatus::Cleared => self.set_full(false),
            DeviceStatus::Running | DeviceStatus::Stopped if !self.is_busy() => {
                let observed = if status == DeviceStatus::Running {
                    BeltState::Running
                } else {
                    BeltState::Stopped
                };
                if self.state() != observed {
                    self.set_state(observed, Some("reported by device".to_string()));
                }
            }
            _ => {}
        }
    }
}

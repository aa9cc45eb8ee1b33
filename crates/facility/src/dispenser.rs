//! Dispenser controller
//!
//! CLOSED / OPENED plus the route it is aligned to. Opening, closing and
//! re-routing are independent operations sharing one in-progress flag.

use fleetloop_core::Route;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::link::{DeviceAction, DeviceCommand, DeviceStatus, ResourceKind};
use crate::operation::{DevicePort, InFlight, OperationOutcome};
use crate::FacilityError;

/// Dispenser hatch states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispenserState {
    /// Hatch closed
    Closed,
    /// Hatch open, cargo flowing
    Opened,
}

impl DispenserState {
    /// Audit token
    pub fn as_str(&self) -> &'static str {
        match self {
            DispenserState::Closed => "CLOSED",
            DispenserState::Opened => "OPENED",
        }
    }
}

impl fmt::Display for DispenserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct DispenserStatus {
    state: DispenserState,
    route: Route,
    operation: &'static str,
}

/// Controller for the loading dispenser
pub struct DispenserController {
    dispenser_id: String,
    status: Mutex<DispenserStatus>,
    in_flight: InFlight,
    port: DevicePort,
}

impl DispenserController {
    pub(crate) fn new(dispenser_id: impl Into<String>, port: DevicePort) -> Self {
        Self {
            dispenser_id: dispenser_id.into(),
            status: Mutex::new(DispenserStatus {
                state: DispenserState::Closed,
                route: Route::RouteA,
                operation: "IDLE",
            }),
            in_flight: InFlight::default(),
            port,
        }
    }

    /// Dispenser identifier
    pub fn id(&self) -> &str {
        &self.dispenser_id
    }

    /// Hatch state
    pub fn state(&self) -> DispenserState {
        self.status().state
    }

    /// Current alignment
    pub fn route(&self) -> Route {
        self.status().route
    }

    /// Current sub-activity
    pub fn operation(&self) -> &'static str {
        self.status().operation
    }

    /// Whether an operation is awaiting acknowledgment
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_set()
    }

    fn status(&self) -> DispenserStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, detail: Option<String>, f: impl FnOnce(&mut DispenserStatus)) {
        let status = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut status);
            *status
        };
        let detail = Some(match detail {
            Some(d) => format!("{} ({})", status.route, d),
            None => status.route.to_string(),
        });
        self.port.audit(
            ResourceKind::Dispenser,
            &self.dispenser_id,
            status.state.as_str(),
            status.operation,
            detail,
        );
    }

    /// Open the hatch
    pub async fn open(&self) -> Result<OperationOutcome, FacilityError> {
        self.set_hatch(DeviceAction::Open, DispenserState::Opened, DeviceStatus::Opened, "OPENING")
            .await
    }

    /// Close the hatch
    pub async fn close(&self) -> Result<OperationOutcome, FacilityError> {
        self.set_hatch(DeviceAction::Close, DispenserState::Closed, DeviceStatus::Closed, "CLOSING")
            .await
    }

    async fn set_hatch(
        &self,
        action: DeviceAction,
        target: DispenserState,
        expect: DeviceStatus,
        operation: &'static str,
    ) -> Result<OperationOutcome, FacilityError> {
        let _guard = self.in_flight.try_begin(&self.dispenser_id)?;
        if self.state() == target {
            return Ok(OperationOutcome::AlreadyInState);
        }

        self.update(None, |s| s.operation = operation);
        let command = DeviceCommand::new(self.dispenser_id.clone(), action);
        let confirmed = self.port.execute(&command, &[expect]).await.is_some();

        let detail = (!confirmed).then(|| "forced after retries".to_string());
        self.update(detail, |s| {
            s.state = target;
            s.operation = "IDLE";
        });

        if confirmed {
            info!(dispenser_id = %self.dispenser_id, state = %target, "Dispenser confirmed");
            Ok(OperationOutcome::Confirmed)
        } else {
            warn!(dispenser_id = %self.dispenser_id, state = %target, "Dispenser forced to expected state");
            Ok(OperationOutcome::Forced)
        }
    }

    /// Align to a route
    ///
    /// SET_ROUTE is always sent, even when the recorded route already
    /// matches, since the hardware may have drifted since the last handoff.
    pub async fn set_route(&self, route: Route) -> Result<OperationOutcome, FacilityError> {
        let _guard = self.in_flight.try_begin(&self.dispenser_id)?;

        self.update(None, |s| s.operation = "ROUTING");
        let command = DeviceCommand::new(self.dispenser_id.clone(), DeviceAction::SetRoute(route));
        let confirmed = self
            .port
            .execute(&command, &[DeviceStatus::RouteSet(route)])
            .await
            .is_some();

        let detail = (!confirmed).then(|| "forced after retries".to_string());
        self.update(detail, |s| {
            s.route = route;
            s.operation = "IDLE";
        });

        info!(dispenser_id = %self.dispenser_id, route = %route, confirmed, "Dispenser routed");
        Ok(if confirmed {
            OperationOutcome::Confirmed
        } else {
            OperationOutcome::Forced
        })
    }

    /// Record an unsolicited status report
    pub(crate) fn observe(&self, status: DeviceStatus) {
        if self.is_busy() {
            return;
        }
        let current = self.status();
        match status {
            DeviceStatus::Opened if current.state != DispenserState::Opened => {
                self.update(Some("reported by device".to_string()), |s| s.state = DispenserState::Opened)
            }
            DeviceStatus::Closed if current.state != DispenserState::Closed => {
                self.update(Some("reported by device".to_string()), |s| s.state = DispenserState::Closed)
            }
            DeviceStatus::RouteSet(route) if current.route != route => {
                self.update(Some("reported by device".to_string()), |s| s.route = route)
            }
            _ => {}
        }
    }
}

//! Facility manager
//!
//! Owns the two gates, the belt and the dispenser, and feeds device reports
//! back to them.

use fleetloop_core::{FleetStore, Route, TimingConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::belt::BeltController;
use crate::dispenser::DispenserController;
use crate::gate::GateController;
use crate::link::{AckHub, DeviceAck, DeviceLink, ResourceKind};
use crate::operation::{DevicePort, OperationOutcome, RetryPolicy};
use crate::{FacilityError, BELT, DISPENSER, GATE_A, GATE_B};

/// Point-in-time view of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource identifier
    pub resource_id: String,
    /// Resource kind
    pub kind: ResourceKind,
    /// State token
    pub state: String,
    /// Sub-activity token
    pub operation: String,
    /// Dispenser alignment
    pub route: Option<Route>,
    /// Belt full sensor
    pub full: Option<bool>,
}

/// Every shared plant resource behind one handle
pub struct FacilityManager {
    gates: Vec<GateController>,
    belt: BeltController,
    dispenser: DispenserController,
    hub: Arc<AckHub>,
}

impl FacilityManager {
    /// Build the controllers over a device link
    pub fn new(link: Arc<dyn DeviceLink>, store: Arc<dyn FleetStore>, timing: &TimingConfig) -> Self {
        let hub = Arc::new(AckHub::new());
        let port = |timeout: Duration| DevicePort {
            link: link.clone(),
            hub: hub.clone(),
            store: store.clone(),
            policy: RetryPolicy::new(timeout, timing.retry_attempts, timing.retry_backoff()),
        };

        Self {
            gates: vec![
                GateController::new(GATE_A, port(timing.gate_timeout())),
                GateController::new(GATE_B, port(timing.gate_timeout())),
            ],
            belt: BeltController::new(BELT, port(timing.belt_timeout())),
            dispenser: DispenserController::new(DISPENSER, port(timing.dispenser_timeout())),
            hub,
        }
    }

    /// Look a gate up by id
    pub fn gate(&self, gate_id: &str) -> Result<&GateController, FacilityError> {
        self.gates
            .iter()
            .find(|g| g.id() == gate_id)
            .ok_or_else(|| FacilityError::UnknownResource(gate_id.to_string()))
    }

    /// The belt
    pub fn belt(&self) -> &BeltController {
        &self.belt
    }

    /// The dispenser
    pub fn dispenser(&self) -> &DispenserController {
        &self.dispenser
    }

    /// Whether `resource_id` names one of the managed resources
    pub fn is_resource(&self, resource_id: &str) -> bool {
        resource_id == BELT || resource_id == DISPENSER || self.gate(resource_id).is_ok()
    }

    /// Open a gate
    pub async fn open_gate(&self, gate_id: &str) -> Result<OperationOutcome, FacilityError> {
        self.gate(gate_id)?.open().await
    }

    /// Close a gate
    pub async fn close_gate(&self, gate_id: &str) -> Result<OperationOutcome, FacilityError> {
        self.gate(gate_id)?.close().await
    }

    /// Start the belt
    pub async fn run_belt(&self) -> Result<OperationOutcome, FacilityError> {
        self.belt.run().await
    }

    /// Stop the belt
    pub async fn stop_belt(&self) -> Result<OperationOutcome, FacilityError> {
        self.belt.stop().await
    }

    /// Stop the belt regardless of a pending operation
    pub async fn emergency_stop_belt(&self) -> OperationOutcome {
        self.belt.force_stop().await
    }

    /// Whether the belt full sensor is tripped
    pub fn belt_full(&self) -> bool {
        self.belt.is_full()
    }

    /// Align the dispenser to `route` and open it
    pub async fn prepare_dispenser(&self, route: Route) -> Result<OperationOutcome, FacilityError> {
        let routed = self.dispenser.set_route(route).await?;
        let opened = self.dispenser.open().await?;
        Ok(if routed == OperationOutcome::Forced {
            OperationOutcome::Forced
        } else {
            opened
        })
    }

    /// Close the dispenser
    pub async fn close_dispenser(&self) -> Result<OperationOutcome, FacilityError> {
        self.dispenser.close().await
    }

    /// Apply a device report; returns `false` for unknown resources
    pub fn deliver(&self, ack: &DeviceAck) -> bool {
        match ack.resource_id.as_str() {
            BELT => self.belt.observe(ack.status),
            DISPENSER => self.dispenser.observe(ack.status),
            id => match self.gate(id) {
                Ok(gate) => gate.observe(ack.status),
                Err(_) => {
                    debug!(resource_id = %id, "Report from unknown resource");
                    return false;
                }
            },
        }
        self.hub.deliver(ack);
        true
    }

    /// State of every resource
    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let mut resources: Vec<ResourceSnapshot> = self
            .gates
            .iter()
            .map(|g| {
                let state = g.state();
                ResourceSnapshot {
                    resource_id: g.id().to_string(),
                    kind: ResourceKind::Gate,
                    state: state.as_str().to_string(),
                    operation: state.operation().to_string(),
                    route: None,
                    full: None,
                }
            })
            .collect();

        resources.push(ResourceSnapshot {
            resource_id: self.belt.id().to_string(),
            kind: ResourceKind::Belt,
            state: self.belt.state().as_str().to_string(),
            operation: if self.belt.is_busy() { "PENDING" } else { "IDLE" }.to_string(),
            route: None,
            full: Some(self.belt.is_full()),
        });

        resources.push(ResourceSnapshot {
            resource_id: self.dispenser.id().to_string(),
            kind: ResourceKind::Dispenser,
            state: self.dispenser.state().as_str().to_string(),
            operation: self.dispenser.operation().to_string(),
            route: Some(self.dispenser.route()),
            full: None,
        });

        resources
    }
}

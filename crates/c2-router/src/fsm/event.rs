//! FSM event vocabulary

use fleetloop_core::Position;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event discriminant used as the transition table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Truck asks for work
    AssignMission,
    /// Truck reached a node
    Arrived,
    /// Truck saw the gate open
    AckGateOpened,
    /// Truck began loading
    StartLoading,
    /// Truck reports loading complete
    FinishLoading,
    /// Dispenser finished transferring cargo
    DispenserLoaded,
    /// Truck began unloading
    StartUnloading,
    /// Truck reports unloading complete
    FinishUnloading,
    /// Truck should charge
    StartCharging,
    /// Charging complete
    FinishCharging,
    /// Halt immediately
    EmergencyTriggered,
    /// Back to IDLE
    Reset,
}

impl EventKind {
    /// Every event kind
    pub const ALL: [EventKind; 12] = [
        EventKind::AssignMission,
        EventKind::Arrived,
        EventKind::AckGateOpened,
        EventKind::StartLoading,
        EventKind::FinishLoading,
        EventKind::DispenserLoaded,
        EventKind::StartUnloading,
        EventKind::FinishUnloading,
        EventKind::StartCharging,
        EventKind::FinishCharging,
        EventKind::EmergencyTriggered,
        EventKind::Reset,
    ];

    /// Log token
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AssignMission => "ASSIGN_MISSION",
            EventKind::Arrived => "ARRIVED",
            EventKind::AckGateOpened => "ACK_GATE_OPENED",
            EventKind::StartLoading => "START_LOADING",
            EventKind::FinishLoading => "FINISH_LOADING",
            EventKind::DispenserLoaded => "DISPENSER_LOADED",
            EventKind::StartUnloading => "START_UNLOADING",
            EventKind::FinishUnloading => "FINISH_UNLOADING",
            EventKind::StartCharging => "START_CHARGING",
            EventKind::FinishCharging => "FINISH_CHARGING",
            EventKind::EmergencyTriggered => "EMERGENCY_TRIGGERED",
            EventKind::Reset => "RESET",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered to the engine for one truck
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruckEvent {
    /// Truck asks for work
    AssignMission,
    /// Truck reached `position`
    Arrived {
        /// Reported node
        position: Position,
        /// Gate the truck believes it is at, if reported
        gate_id: Option<String>,
    },
    /// Truck saw the gate open
    AckGateOpened {
        /// Gate reported by the truck
        gate_id: Option<String>,
    },
    /// Truck began loading
    StartLoading,
    /// Truck reports loading complete
    FinishLoading,
    /// Dispenser finished transferring cargo
    DispenserLoaded {
        /// Reporting dispenser
        dispenser_id: String,
        /// Load bay served, if reported
        position: Option<Position>,
        /// Loading ticket the signal belongs to; `None` matches the active one
        ticket: Option<u64>,
        /// Raised by the loading safety timer rather than the dispenser
        forced: bool,
    },
    /// Truck began unloading
    StartUnloading,
    /// Truck reports unloading complete
    FinishUnloading,
    /// Truck should charge
    StartCharging,
    /// Charging complete
    FinishCharging,
    /// Halt immediately
    EmergencyTriggered {
        /// Originating command (OBSTACLE, ERROR, ...)
        reason: String,
    },
    /// Back to IDLE
    Reset,
}

impl TruckEvent {
    /// Table key
    pub fn kind(&self) -> EventKind {
        match self {
            TruckEvent::AssignMission => EventKind::AssignMission,
            TruckEvent::Arrived { .. } => EventKind::Arrived,
            TruckEvent::AckGateOpened { .. } => EventKind::AckGateOpened,
            TruckEvent::StartLoading => EventKind::StartLoading,
            TruckEvent::FinishLoading => EventKind::FinishLoading,
            TruckEvent::DispenserLoaded { .. } => EventKind::DispenserLoaded,
            TruckEvent::StartUnloading => EventKind::StartUnloading,
            TruckEvent::FinishUnloading => EventKind::FinishUnloading,
            TruckEvent::StartCharging => EventKind::StartCharging,
            TruckEvent::FinishCharging => EventKind::FinishCharging,
            TruckEvent::EmergencyTriggered { .. } => EventKind::EmergencyTriggered,
            TruckEvent::Reset => EventKind::Reset,
        }
    }

    /// Reported position of an arrival
    pub fn arrived_at(&self) -> Option<Position> {
        match self {
            TruckEvent::Arrived { position, .. } => Some(*position),
            _ => None,
        }
    }
}

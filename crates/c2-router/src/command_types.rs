//! Wire command vocabulary
//!
//! Inbound tokens come from trucks and plant devices; outbound tokens go to
//! trucks (and, in network mode, to devices).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands accepted from trucks and devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundCommand {
    /// Session registration
    Hello,
    /// Truck asks for work
    AssignMission,
    /// Truck reached a node (payload `position`, optional `gate_id`)
    Arrived,
    /// Truck saw the gate open
    AckGateOpened,
    /// Truck began loading
    StartLoading,
    /// Truck reports loading complete
    FinishLoading,
    /// Truck began unloading
    StartUnloading,
    /// Truck reports unloading complete
    FinishUnloading,
    /// Dispenser finished transferring cargo
    DispenserLoaded,
    /// Battery telemetry
    BatteryLevel,
    /// Combined battery / position telemetry
    StatusUpdate,
    /// Obstacle detected
    Obstacle,
    /// Truck fault
    Error,
    /// Operator-raised emergency
    EmergencyTriggered,
    /// Clear emergency
    Reset,
    /// Truck asks to charge
    StartCharging,
    /// Truck reports charging complete
    FinishCharging,
    /// Acknowledgment from a gate, the belt or the dispenser
    DeviceAck,
}

impl InboundCommand {
    /// Classify an uppercase wire token
    pub fn parse(cmd: &str) -> Option<Self> {
        let command = match cmd {
            "HELLO" => InboundCommand::Hello,
            "ASSIGN_MISSION" => InboundCommand::AssignMission,
            "ARRIVED" => InboundCommand::Arrived,
            "ACK_GATE_OPENED" => InboundCommand::AckGateOpened,
            "START_LOADING" => InboundCommand::StartLoading,
            "FINISH_LOADING" => InboundCommand::FinishLoading,
            "START_UNLOADING" => InboundCommand::StartUnloading,
            "FINISH_UNLOADING" => InboundCommand::FinishUnloading,
            "DISPENSER_LOADED" => InboundCommand::DispenserLoaded,
            "BATTERY_LEVEL" => InboundCommand::BatteryLevel,
            "STATUS_UPDATE" => InboundCommand::StatusUpdate,
            "OBSTACLE" => InboundCommand::Obstacle,
            "ERROR" => InboundCommand::Error,
            "EMERGENCY_TRIGGERED" => InboundCommand::EmergencyTriggered,
            "RESET" => InboundCommand::Reset,
            "START_CHARGING" => InboundCommand::StartCharging,
            "FINISH_CHARGING" => InboundCommand::FinishCharging,
            other if fleetloop_facility::DeviceStatus::is_wire_ack(other) => InboundCommand::DeviceAck,
            _ => return None,
        };
        Some(command)
    }

    /// Emergency-class commands bypass the per-connection queue
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            InboundCommand::Obstacle | InboundCommand::Error | InboundCommand::EmergencyTriggered
        )
    }

    /// Signals whose repeats inside the dedup window are dropped
    pub fn is_idempotent_signal(&self) -> bool {
        matches!(
            self,
            InboundCommand::DispenserLoaded
                | InboundCommand::AckGateOpened
                | InboundCommand::StartLoading
                | InboundCommand::StartUnloading
                | InboundCommand::FinishUnloading
        )
    }
}

/// Commands the dispatcher sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundCommand {
    /// Mission bound (payload `mission_id`, `source`)
    MissionAssigned,
    /// Proceed to the next node
    Run,
    /// Halt
    Stop,
    /// Gate is open (payload `gate_id`)
    GateOpened,
    /// Gate is closed (payload `gate_id`)
    GateClosed,
    /// Begin loading at the bay
    StartLoading,
    /// Cargo transferred
    FinishLoading,
    /// Begin unloading at the belt
    StartUnloading,
    /// Go charge
    StartCharging,
    /// Charging finished
    ChargingCompleted,
    /// Nothing queued (payload `wait_time`)
    NoMission,
    /// Status reply (payload `status`)
    Ack,
    /// Device: open
    Open,
    /// Device: close
    Close,
    /// Device: align dispenser (payload `route`)
    SetRoute,
}

impl OutboundCommand {
    /// Wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundCommand::MissionAssigned => "MISSION_ASSIGNED",
            OutboundCommand::Run => "RUN",
            OutboundCommand::Stop => "STOP",
            OutboundCommand::GateOpened => "GATE_OPENED",
            OutboundCommand::GateClosed => "GATE_CLOSED",
            OutboundCommand::StartLoading => "START_LOADING",
            OutboundCommand::FinishLoading => "FINISH_LOADING",
            OutboundCommand::StartUnloading => "START_UNLOADING",
            OutboundCommand::StartCharging => "START_CHARGING",
            OutboundCommand::ChargingCompleted => "CHARGING_COMPLETED",
            OutboundCommand::NoMission => "NO_MISSION",
            OutboundCommand::Ack => "ACK",
            OutboundCommand::Open => "OPEN",
            OutboundCommand::Close => "CLOSE",
            OutboundCommand::SetRoute => "SET_ROUTE",
        }
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_truck_and_device_tokens() {
        assert_eq!(InboundCommand::parse("ARRIVED"), Some(InboundCommand::Arrived));
        assert_eq!(InboundCommand::parse("BELT_FULL"), Some(InboundCommand::DeviceAck));
        assert_eq!(InboundCommand::parse("ARRIVED_AT_BELT"), None);
    }

    #[test]
    fn test_emergency_class() {
        assert!(InboundCommand::Obstacle.is_emergency());
        assert!(InboundCommand::Error.is_emergency());
        assert!(!InboundCommand::Reset.is_emergency());
        assert!(!InboundCommand::Error.is_idempotent_signal());
        assert!(InboundCommand::DispenserLoaded.is_idempotent_signal());
    }

    #[test]
    fn test_outbound_tokens() {
        assert_eq!(OutboundCommand::ChargingCompleted.to_string(), "CHARGING_COMPLETED");
        assert_eq!(OutboundCommand::SetRoute.as_str(), "SET_ROUTE");
    }
}

//! Message router
//!
//! Dispatches decoded messages by top-level `cmd`. Telemetry updates the truck
//! context without a transition, device acknowledgments go to the facility
//! manager and everything else becomes a [`TruckEvent`] for the engine.
//! Repeats of idempotent signals inside the dedup window are dropped here.

use fleetloop_core::{now_ms, BatterySample, FleetConfig, FleetStore, Position, Route};
use fleetloop_facility::{DeviceAck, DeviceStatus, DISPENSER};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::Message;
use crate::command_types::InboundCommand;
use crate::context::TruckState;
use crate::fsm::{FsmEngine, TransitionOutcome, TruckEvent};
use crate::idempotency::DedupWindow;

/// What the router did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Event went to the engine
    Transition(TransitionOutcome),
    /// HELLO accepted
    Registered,
    /// Context fields updated, no transition
    Telemetry,
    /// Device acknowledgment applied
    DeviceAck {
        /// Whether the resource is known
        delivered: bool,
    },
    /// Repeat inside the dedup window
    Duplicate,
    /// Unknown or malformed
    Dropped,
}

/// Whether a message must bypass the per-connection queue
pub fn is_emergency(message: &Message) -> bool {
    InboundCommand::parse(&message.cmd).is_some_and(|c| c.is_emergency())
}

fn battery_reading(message: &Message) -> Option<i64> {
    ["battery_level", "battery", "level"]
        .iter()
        .find_map(|key| message.payload_i64(key))
}

fn payload_position(message: &Message) -> Option<Position> {
    message.payload_str("position").and_then(|p| p.parse().ok())
}

/// Routes inbound messages to the engine
pub struct MessageRouter {
    engine: Arc<FsmEngine>,
    store: Arc<dyn FleetStore>,
    dedup: DedupWindow,
}

impl MessageRouter {
    /// Create a router in front of `engine`
    pub fn new(engine: Arc<FsmEngine>, store: Arc<dyn FleetStore>, config: &FleetConfig) -> Self {
        Self {
            engine,
            store,
            dedup: DedupWindow::new(config.timing.dedup_window()),
        }
    }

    /// The engine behind this router
    pub fn engine(&self) -> &Arc<FsmEngine> {
        &self.engine
    }

    /// Route one message
    pub async fn route(&self, message: Message) -> RouteOutcome {
        let Some(command) = InboundCommand::parse(&message.cmd) else {
            warn!(sender = %message.sender, cmd = %message.cmd, "Unknown command dropped");
            return RouteOutcome::Dropped;
        };

        if command.is_idempotent_signal() {
            let key = match command {
                InboundCommand::DispenserLoaded => message.payload_str("dispenser_id").unwrap_or(DISPENSER),
                _ => message.sender.as_str(),
            };
            if let Err(e) = self.dedup.check(&message.cmd, key) {
                debug!(error = %e, "Duplicate signal dropped");
                return RouteOutcome::Duplicate;
            }
        }

        let truck_id = message.sender.as_str();
        let event = match command {
            InboundCommand::Hello => return self.hello(&message).await,
            InboundCommand::BatteryLevel | InboundCommand::StatusUpdate => {
                return match self.apply_telemetry(truck_id, &message).await {
                    Some(outcome) => RouteOutcome::Transition(outcome),
                    None => RouteOutcome::Telemetry,
                };
            }
            InboundCommand::DeviceAck => return self.device_ack(&message),
            InboundCommand::DispenserLoaded => return self.dispenser_loaded(&message).await,
            InboundCommand::Obstacle | InboundCommand::Error | InboundCommand::EmergencyTriggered => {
                let target = message.payload_str("truck_id").unwrap_or(truck_id);
                let outcome = self.engine.trigger_emergency(target, &message.cmd);
                return RouteOutcome::Transition(outcome);
            }
            InboundCommand::AssignMission => TruckEvent::AssignMission,
            InboundCommand::Arrived => {
                let Some(position) = payload_position(&message) else {
                    warn!(truck_id = %truck_id, payload = ?message.payload, "ARRIVED without a valid position");
                    return RouteOutcome::Dropped;
                };
                TruckEvent::Arrived {
                    position,
                    gate_id: message.payload_str("gate_id").map(str::to_string),
                }
            }
            InboundCommand::AckGateOpened => TruckEvent::AckGateOpened {
                gate_id: message.payload_str("gate_id").map(str::to_string),
            },
            InboundCommand::StartLoading => TruckEvent::StartLoading,
            InboundCommand::FinishLoading => TruckEvent::FinishLoading,
            InboundCommand::StartUnloading => TruckEvent::StartUnloading,
            InboundCommand::FinishUnloading => TruckEvent::FinishUnloading,
            InboundCommand::StartCharging => TruckEvent::StartCharging,
            InboundCommand::FinishCharging => {
                if let Some(level) = battery_reading(&message) {
                    self.record_battery(truck_id, level);
                }
                TruckEvent::FinishCharging
            }
            InboundCommand::Reset => TruckEvent::Reset,
        };

        RouteOutcome::Transition(self.engine.handle(truck_id, event).await)
    }

    async fn hello(&self, message: &Message) -> RouteOutcome {
        let sender = message.sender.as_str();
        if self.engine.facility().is_resource(sender) {
            debug!(resource_id = %sender, "Device registered");
            return RouteOutcome::Registered;
        }

        self.engine.contexts().slot(sender);
        if let Some(outcome) = self.apply_telemetry(sender, message).await {
            debug!(truck_id = %sender, ?outcome, "Telemetry in HELLO raised a transition");
        }
        RouteOutcome::Registered
    }

    /// Store battery/position readings; may raise FINISH_CHARGING
    async fn apply_telemetry(&self, truck_id: &str, message: &Message) -> Option<TransitionOutcome> {
        if let Some(level) = battery_reading(message) {
            self.record_battery(truck_id, level);
        }
        if let Some(position) = payload_position(message) {
            self.engine.contexts().update_position(truck_id, position);
        }

        let context = self.engine.contexts().get(truck_id)?;
        if context.state == TruckState::Charging && context.battery_level >= self.engine.battery().full_level {
            debug!(truck_id = %truck_id, battery_level = context.battery_level, "Battery full while charging");
            return Some(self.engine.handle(truck_id, TruckEvent::FinishCharging).await);
        }
        None
    }

    fn record_battery(&self, truck_id: &str, level: i64) {
        let contexts = self.engine.contexts();
        let stored = contexts.update_battery(truck_id, level);
        if i64::from(stored) != level {
            debug!(truck_id = %truck_id, reported = level, stored, "Battery reading clamped");
        }

        let sample = BatterySample {
            truck_id: truck_id.to_string(),
            level: stored,
            is_charging: contexts.get(truck_id).is_some_and(|c| c.is_charging),
            timestamp: now_ms(),
        };
        if let Err(e) = self.store.append_battery(&sample) {
            warn!(truck_id = %truck_id, error = %e, "Battery write failed");
        }
    }

    fn device_ack(&self, message: &Message) -> RouteOutcome {
        let route = message.payload_str("route").and_then(|r| r.parse::<Route>().ok());
        let Some(status) = DeviceStatus::from_wire(&message.cmd, route) else {
            warn!(sender = %message.sender, cmd = %message.cmd, "Unreadable device report");
            return RouteOutcome::Dropped;
        };

        let delivered = self
            .engine
            .facility()
            .deliver(&DeviceAck::new(message.sender.clone(), status));
        RouteOutcome::DeviceAck { delivered }
    }

    async fn dispenser_loaded(&self, message: &Message) -> RouteOutcome {
        let position = payload_position(message);
        let route = message
            .payload_str("route")
            .and_then(|r| r.parse::<Route>().ok())
            .or_else(|| position.and_then(|p| p.route()));

        let contexts = self.engine.contexts();
        let sender = message.sender.as_str();
        let target = contexts.find_loading_truck(route).or_else(|| {
            (contexts.contains(sender) && !self.engine.facility().is_resource(sender)).then(|| sender.to_string())
        });
        let Some(truck_id) = target else {
            warn!(sender = %sender, route = ?route, "DISPENSER_LOADED with no truck loading");
            return RouteOutcome::Dropped;
        };

        let event = TruckEvent::DispenserLoaded {
            dispenser_id: message.payload_str("dispenser_id").unwrap_or(DISPENSER).to_string(),
            position,
            ticket: None,
            forced: false,
        };
        RouteOutcome::Transition(self.engine.handle(&truck_id, event).await)
    }
}

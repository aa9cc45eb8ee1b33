//! Truck FSM engine
//!
//! Consumes `(truck_id, event)`, looks the transition up in the
//! [`TransitionTable`], runs the action against a working copy of the truck's
//! context and commits the result. Transition logic for one truck runs only
//! while holding that truck's turn lock; emergencies skip the turn entirely.
//!
//! Actions may block on infrastructure acknowledgments. A transition that was
//! in flight when an emergency landed commits its mission bookkeeping but
//! never overwrites EMERGENCY.

use fleetloop_core::{
    now_ms, BatteryConfig, Direction, FleetConfig, FleetStore, MissionPhase, Position, TimingConfig,
};
use fleetloop_facility::{FacilityError, FacilityManager, OperationOutcome, DISPENSER};
use fleetloop_mission::{MissionQueue, QueueError};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::command_types::OutboundCommand;
use crate::context::{ContextStore, TruckContext, TruckSlot, TruckState};
use crate::dispatcher::CommandDispatcher;
use crate::fsm::event::{EventKind, TruckEvent};
use crate::fsm::gate_policy::{gate_action, GateAction};
use crate::fsm::table::{Action, Facts, TransitionTable};

/// Follow-up events an action may raise within one turn
const MAX_CHAINED_EVENTS: usize = 4;

/// Result of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// A transition ran; `to` is the state after any chained events
    Applied {
        /// State before the event
        from: TruckState,
        /// State after the event
        to: TruckState,
    },
    /// Entries exist for the event but every guard refused it
    Rejected(TruckState),
    /// No entry for (state, event)
    Unmatched(TruckState),
    /// An emergency landed while the transition was in flight
    Preempted,
}

impl TransitionOutcome {
    /// Whether a transition was committed
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// What an action decided beyond the table's target state
enum ActionResult {
    Proceed,
    Redirect(TruckState),
    Chain(TruckEvent),
}

fn payload<const N: usize>(fields: [(&str, Value); N]) -> Map<String, Value> {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// The dispatch core
pub struct FsmEngine {
    contexts: Arc<ContextStore>,
    queue: Arc<MissionQueue>,
    facility: Arc<FacilityManager>,
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<dyn FleetStore>,
    table: TransitionTable,
    battery: BatteryConfig,
    timing: TimingConfig,
    this: Weak<FsmEngine>,
}

impl FsmEngine {
    /// Build an engine over shared components
    pub fn new(
        contexts: Arc<ContextStore>,
        queue: Arc<MissionQueue>,
        facility: Arc<FacilityManager>,
        dispatcher: Arc<CommandDispatcher>,
        store: Arc<dyn FleetStore>,
        config: &FleetConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            contexts,
            queue,
            facility,
            dispatcher,
            store,
            table: TransitionTable::standard(),
            battery: config.battery.clone(),
            timing: config.timing.clone(),
            this: this.clone(),
        })
    }

    /// Truck contexts
    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    /// Mission queue
    pub fn queue(&self) -> &Arc<MissionQueue> {
        &self.queue
    }

    /// Infrastructure
    pub fn facility(&self) -> &Arc<FacilityManager> {
        &self.facility
    }

    /// Battery thresholds
    pub fn battery(&self) -> &BatteryConfig {
        &self.battery
    }

    /// Process one event for `truck_id`
    pub async fn handle(&self, truck_id: &str, event: TruckEvent) -> TransitionOutcome {
        if let TruckEvent::EmergencyTriggered { reason } = &event {
            return self.trigger_emergency(truck_id, reason);
        }

        let slot = self.contexts.slot(truck_id);
        let _turn = slot.begin_turn().await;
        let origin = slot.snapshot().state;

        let mut next = Some(event);
        let mut steps = 0;
        while let Some(event) = next.take() {
            let (outcome, chained) = self.step(truck_id, &slot, &event).await;
            match outcome {
                TransitionOutcome::Preempted => return outcome,
                TransitionOutcome::Applied { .. } => {}
                _ if steps == 0 => return outcome,
                _ => debug!(truck_id = %truck_id, event = %event.kind(), ?outcome, "Chained event not applied"),
            }

            steps += 1;
            if steps > MAX_CHAINED_EVENTS {
                warn!(truck_id = %truck_id, "Chained event limit reached");
                break;
            }
            next = chained;
        }

        TransitionOutcome::Applied {
            from: origin,
            to: slot.snapshot().state,
        }
    }

    /// Halt a truck without waiting behind its in-flight transition
    ///
    /// STOP goes out immediately; the belt is stopped in the background.
    pub fn trigger_emergency(&self, truck_id: &str, reason: &str) -> TransitionOutcome {
        let slot = self.contexts.slot(truck_id);
        let applied = slot.with(|context| {
            let from = context.state;
            let transition = self
                .table
                .lookup(from, EventKind::EmergencyTriggered)
                .and_then(|candidates| candidates.first().copied())?;

            context.state = transition.to;
            context.is_charging = false;
            context.halts += 1;
            context.last_update_time = now_ms();
            Some((from, transition.to))
        });

        let Some((from, to)) = applied else {
            return TransitionOutcome::Unmatched(slot.snapshot().state);
        };

        warn!(truck_id = %truck_id, reason = %reason, from = %from, "Emergency stop");
        self.notify(truck_id, OutboundCommand::Stop, Map::new());

        let facility = self.facility.clone();
        tokio::spawn(async move {
            let outcome = facility.emergency_stop_belt().await;
            debug!(?outcome, "Belt halted for emergency");
        });

        TransitionOutcome::Applied { from, to }
    }

    async fn step(&self, truck_id: &str, slot: &TruckSlot, event: &TruckEvent) -> (TransitionOutcome, Option<TruckEvent>) {
        let before = slot.snapshot();
        let kind = event.kind();

        let Some(candidates) = self.table.lookup(before.state, kind) else {
            debug!(truck_id = %truck_id, state = %before.state, event = %kind, "No transition for event");
            return (TransitionOutcome::Unmatched(before.state), None);
        };

        let facts = Facts {
            context: &before,
            event,
            battery: &self.battery,
            belt_full: self.facility.belt_full(),
        };
        let Some(transition) = candidates.iter().find(|t| t.admits(&facts)).copied() else {
            info!(truck_id = %truck_id, state = %before.state, event = %kind, "Event refused by guard");
            return (TransitionOutcome::Rejected(before.state), None);
        };

        let mut working = before.clone();
        if let Some(position) = event.arrived_at() {
            working.position = position;
            working.target_position = working.mission_source.map(|bay| position.next_stop(bay));
        }

        let result = self.perform(transition.action, truck_id, slot, &mut working, event).await;
        let (to, chained) = match result {
            ActionResult::Proceed => (transition.to, None),
            ActionResult::Redirect(state) => (state, None),
            ActionResult::Chain(next) => (transition.to, Some(next)),
        };

        if !self.commit(slot, &before, working, to, event) {
            warn!(truck_id = %truck_id, event = %kind, "Transition preempted by emergency");
            return (TransitionOutcome::Preempted, None);
        }

        info!(truck_id = %truck_id, from = %before.state, event = %kind, to = %to, "Transition applied");
        if let Some(position) = event.arrived_at() {
            if let Err(e) = self.store.append_position(truck_id, position, to.as_str(), now_ms()) {
                warn!(truck_id = %truck_id, error = %e, "Position write failed");
            }
        }

        (TransitionOutcome::Applied { from: before.state, to }, chained)
    }

    /// Write the working copy back; `false` when an emergency preempted it
    fn commit(&self, slot: &TruckSlot, before: &TruckContext, mut working: TruckContext, to: TruckState, event: &TruckEvent) -> bool {
        let arrived = event.arrived_at().is_some();
        slot.with(|live| {
            if live.halts != before.halts {
                // Keep mission bookkeeping so RESET can cancel what was bound.
                live.mission_id = working.mission_id;
                live.mission_source = working.mission_source;
                live.mission_phase = working.mission_phase;
                live.direction = working.direction;
                live.target_position = working.target_position;
                live.loading = working.loading;
                if arrived {
                    live.position = working.position;
                }
                live.last_update_time = now_ms();
                return false;
            }

            working.battery_level = live.battery_level;
            if !arrived {
                working.position = live.position;
            }
            working.state = to;
            working.last_update_time = now_ms();
            *live = working;
            true
        })
    }

    async fn perform(
        &self,
        action: Action,
        truck_id: &str,
        slot: &TruckSlot,
        ctx: &mut TruckContext,
        event: &TruckEvent,
    ) -> ActionResult {
        match action {
            Action::AssignMission => self.assign_mission(truck_id, ctx),
            Action::StartCharging => {
                self.start_charging(truck_id, ctx);
                ActionResult::Proceed
            }
            Action::ArriveCheckpoint => self.arrive_checkpoint(truck_id, ctx).await,
            Action::ArriveLoadBay => self.arrive_load_bay(truck_id, slot, ctx).await,
            Action::ArriveBelt => {
                ctx.mission_phase = MissionPhase::AtUnloading;
                self.notify(truck_id, OutboundCommand::Stop, Map::new());
                self.notify(
                    truck_id,
                    OutboundCommand::StartUnloading,
                    payload([("position", Value::from(Position::Belt.as_str()))]),
                );
                ActionResult::Proceed
            }
            Action::CompleteMission => {
                if let Some(mission_id) = ctx.mission_id.as_deref() {
                    if let Err(e) = self.queue.complete(mission_id) {
                        warn!(truck_id = %truck_id, mission_id = %mission_id, error = %e, "Mission completion refused");
                    }
                }
                ctx.clear_mission();
                self.notify(truck_id, OutboundCommand::Stop, Map::new());
                ActionResult::Chain(TruckEvent::AssignMission)
            }
            Action::ParkAtStandby => {
                ctx.direction = None;
                ctx.target_position = None;
                self.notify(truck_id, OutboundCommand::Stop, Map::new());
                ActionResult::Proceed
            }
            Action::PassThrough | Action::ResumeAfterGate => {
                self.notify(truck_id, OutboundCommand::Run, Map::new());
                ActionResult::Proceed
            }
            Action::BeginLoading => match &ctx.loading {
                Some(ticket) if ticket.cargo_ready => ActionResult::Chain(TruckEvent::DispenserLoaded {
                    dispenser_id: ticket.dispenser_id.clone(),
                    position: Some(ctx.position),
                    ticket: Some(ticket.ticket),
                    forced: false,
                }),
                _ => ActionResult::Proceed,
            },
            Action::MarkCargoReady => {
                if let Some(ticket) = ctx.loading.as_mut() {
                    ticket.cargo_ready = true;
                }
                info!(truck_id = %truck_id, "Cargo loaded before truck confirmed loading");
                self.close_dispenser(truck_id).await;
                ActionResult::Proceed
            }
            Action::FinishDispensing => {
                if let TruckEvent::DispenserLoaded { forced: true, .. } = event {
                    warn!(truck_id = %truck_id, "Loading force-completed by safety timer");
                }
                self.close_dispenser(truck_id).await;
                ctx.loading = None;
                self.notify(truck_id, OutboundCommand::FinishLoading, Map::new());
                self.depart_load_bay(truck_id, ctx);
                ActionResult::Proceed
            }
            Action::DepartLoadBay => {
                ctx.loading = None;
                self.depart_load_bay(truck_id, ctx);
                ActionResult::Proceed
            }
            Action::BeginUnloading => {
                let facility = &self.facility;
                match self.retry_busy(move || facility.run_belt()).await {
                    Ok(outcome) => {
                        debug!(truck_id = %truck_id, ?outcome, "Belt running for unload");
                        ActionResult::Proceed
                    }
                    Err(FacilityError::BeltFull(_)) => {
                        self.notify(truck_id, OutboundCommand::Ack, payload([("status", Value::from("BELT_FULL"))]));
                        ActionResult::Redirect(TruckState::Waiting)
                    }
                    Err(e) => {
                        warn!(truck_id = %truck_id, error = %e, "Belt not started; unloading anyway");
                        ActionResult::Proceed
                    }
                }
            }
            Action::DepartBelt => {
                ctx.mission_phase = MissionPhase::Returning;
                ctx.direction = Some(Direction::Return);
                ctx.target_position = Some(Position::Standby);
                self.notify(truck_id, OutboundCommand::Run, Map::new());

                let facility = &self.facility;
                if let Err(e) = self.retry_busy(move || facility.stop_belt()).await {
                    warn!(truck_id = %truck_id, error = %e, "Belt stop failed");
                }
                ActionResult::Proceed
            }
            Action::FinishCharging => {
                ctx.is_charging = false;
                self.notify(
                    truck_id,
                    OutboundCommand::ChargingCompleted,
                    payload([("battery_level", Value::from(ctx.battery_level))]),
                );
                ActionResult::Chain(TruckEvent::AssignMission)
            }
            Action::EnterEmergency => {
                // Reached only if an emergency is ever fed through the table
                ctx.is_charging = false;
                ctx.halts += 1;
                self.notify(truck_id, OutboundCommand::Stop, Map::new());
                ActionResult::Proceed
            }
            Action::Reset => {
                if let Some(mission_id) = ctx.mission_id.as_deref() {
                    match self.queue.cancel(mission_id) {
                        Ok(_) => info!(truck_id = %truck_id, mission_id = %mission_id, "Mission canceled by reset"),
                        Err(e) => warn!(truck_id = %truck_id, mission_id = %mission_id, error = %e, "Mission cancel refused"),
                    }
                }
                if ctx.loading.is_some() {
                    self.close_dispenser(truck_id).await;
                }
                ctx.clear_mission();
                ctx.is_charging = false;
                ActionResult::Proceed
            }
            Action::Refuse(status) => {
                info!(truck_id = %truck_id, status, "Request refused");
                self.notify(truck_id, OutboundCommand::Ack, payload([("status", Value::from(status))]));
                ActionResult::Proceed
            }
        }
    }

    fn assign_mission(&self, truck_id: &str, ctx: &mut TruckContext) -> ActionResult {
        match self.queue.assign_next(truck_id) {
            Ok(mission) => {
                ctx.mission_id = Some(mission.mission_id.clone());
                ctx.mission_source = Some(mission.source);
                ctx.mission_phase = MissionPhase::ToLoading;
                ctx.direction = Some(Direction::Inbound);
                ctx.target_position = Some(Position::Standby.next_stop(mission.source));

                self.notify(
                    truck_id,
                    OutboundCommand::MissionAssigned,
                    payload([
                        ("mission_id", Value::from(mission.mission_id)),
                        ("source", Value::from(mission.source.as_str())),
                        ("cargo_type", Value::from(mission.cargo_type)),
                        ("cargo_amount", Value::from(mission.cargo_amount)),
                    ]),
                );
                self.notify(truck_id, OutboundCommand::Run, Map::new());
                ActionResult::Proceed
            }
            Err(QueueError::Empty) if ctx.battery_level < self.battery.full_level => {
                self.start_charging(truck_id, ctx);
                ActionResult::Redirect(TruckState::Charging)
            }
            Err(e) => {
                if !matches!(e, QueueError::Empty) {
                    error!(truck_id = %truck_id, error = %e, "Mission assignment failed");
                }
                self.notify(
                    truck_id,
                    OutboundCommand::NoMission,
                    payload([("wait_time", Value::from(self.timing.no_mission_wait_secs))]),
                );
                ActionResult::Redirect(TruckState::Idle)
            }
        }
    }

    fn start_charging(&self, truck_id: &str, ctx: &mut TruckContext) {
        ctx.is_charging = true;
        info!(truck_id = %truck_id, battery_level = ctx.battery_level, "Sending truck to charge");
        self.notify(
            truck_id,
            OutboundCommand::StartCharging,
            payload([("battery_level", Value::from(ctx.battery_level))]),
        );
    }

    async fn arrive_checkpoint(&self, truck_id: &str, ctx: &mut TruckContext) -> ActionResult {
        let facility = &self.facility;
        match gate_action(ctx.position, ctx.direction) {
            GateAction::Open(gate_id) => match self.retry_busy(move || facility.open_gate(gate_id)).await {
                Ok(outcome) => {
                    if outcome == OperationOutcome::Forced {
                        warn!(truck_id = %truck_id, gate_id, "Gate open not acknowledged; assuming open");
                    }
                    self.notify(truck_id, OutboundCommand::GateOpened, payload([("gate_id", Value::from(gate_id))]));
                    ActionResult::Proceed
                }
                Err(e) => {
                    // Held in WAITING until the re-check or a repeated ARRIVED gets the gate
                    warn!(truck_id = %truck_id, gate_id, error = %e, "Gate open failed; truck held");
                    self.notify(truck_id, OutboundCommand::Ack, payload([("status", Value::from("GATE_BUSY"))]));
                    self.arm_gate_recheck(truck_id, ctx.position);
                    ActionResult::Proceed
                }
            },
            GateAction::Close(gate_id) => {
                match self.retry_busy(move || facility.close_gate(gate_id)).await {
                    Ok(_) => {
                        self.notify(truck_id, OutboundCommand::GateClosed, payload([("gate_id", Value::from(gate_id))]))
                    }
                    Err(e) => warn!(truck_id = %truck_id, gate_id, error = %e, "Gate close failed"),
                }
                self.notify(truck_id, OutboundCommand::Run, Map::new());
                ActionResult::Redirect(TruckState::Moving)
            }
            GateAction::Pass => {
                self.notify(truck_id, OutboundCommand::Run, Map::new());
                ActionResult::Redirect(TruckState::Moving)
            }
        }
    }

    async fn arrive_load_bay(&self, truck_id: &str, slot: &TruckSlot, ctx: &mut TruckContext) -> ActionResult {
        let bay = ctx.position;
        let route = match bay.route() {
            Some(route) if ctx.mission_phase == MissionPhase::ToLoading && ctx.mission_source == Some(bay) => route,
            _ => {
                info!(
                    truck_id = %truck_id,
                    position = %bay,
                    source = ?ctx.mission_source,
                    "Load bay is not this truck's source; passing"
                );
                self.notify(truck_id, OutboundCommand::Run, Map::new());
                return ActionResult::Redirect(TruckState::Moving);
            }
        };

        ctx.mission_phase = MissionPhase::AtLoading;
        self.notify(truck_id, OutboundCommand::Stop, Map::new());
        self.notify(
            truck_id,
            OutboundCommand::StartLoading,
            payload([("position", Value::from(bay.as_str()))]),
        );

        // Publish the ticket now so a fast DISPENSER_LOADED can find this truck
        let ticket = slot.with(|live| {
            let ticket = live.issue_ticket(DISPENSER, route);
            ctx.loading = live.loading.clone();
            ctx.loading_seq = live.loading_seq;
            ticket
        });

        let facility = &self.facility;
        match self.retry_busy(move || facility.prepare_dispenser(route)).await {
            Ok(outcome) => debug!(truck_id = %truck_id, ticket, ?outcome, "Dispenser prepared"),
            Err(e) => warn!(truck_id = %truck_id, ticket, error = %e, "Dispenser not prepared"),
        }

        self.arm_loading_timer(truck_id, ticket);
        ActionResult::Proceed
    }

    fn depart_load_bay(&self, truck_id: &str, ctx: &mut TruckContext) {
        ctx.mission_phase = MissionPhase::ToUnloading;
        ctx.direction = Some(Direction::Outbound);
        ctx.target_position = Some(ctx.position.next_stop(ctx.position));
        self.notify(truck_id, OutboundCommand::Run, Map::new());
    }

    async fn close_dispenser(&self, truck_id: &str) {
        let facility = &self.facility;
        if let Err(e) = self.retry_busy(move || facility.close_dispenser()).await {
            warn!(truck_id = %truck_id, error = %e, "Dispenser close failed");
        }
    }

    /// Force-complete `ticket` if DISPENSER_LOADED never arrives
    fn arm_loading_timer(&self, truck_id: &str, ticket: u64) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        let truck_id = truck_id.to_string();
        let delay = self.timing.loading_safety_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = TruckEvent::DispenserLoaded {
                dispenser_id: DISPENSER.to_string(),
                position: None,
                ticket: Some(ticket),
                forced: true,
            };
            let outcome = engine.handle(&truck_id, event).await;
            debug!(truck_id = %truck_id, ticket, ?outcome, "Loading safety timer fired");
        });
    }

    /// Re-run the gate policy for a truck still held at `checkpoint`
    fn arm_gate_recheck(&self, truck_id: &str, checkpoint: Position) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        let truck_id = truck_id.to_string();
        let delay = self.timing.gate_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let held = engine
                .contexts
                .get(&truck_id)
                .is_some_and(|c| c.state == TruckState::Waiting && c.position == checkpoint);
            if !held {
                debug!(truck_id = %truck_id, position = %checkpoint, "Gate re-check skipped; truck moved on");
                return;
            }
            let event = TruckEvent::Arrived {
                position: checkpoint,
                gate_id: None,
            };
            let outcome = engine.handle(&truck_id, event).await;
            debug!(truck_id = %truck_id, position = %checkpoint, ?outcome, "Gate re-check fired");
        });
    }

    /// Retry an infrastructure call while another truck holds the resource
    async fn retry_busy<F, Fut>(&self, mut operation: F) -> Result<OperationOutcome, FacilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<OperationOutcome, FacilityError>>,
    {
        let attempts = self.timing.busy_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(FacilityError::Busy(resource_id)) if attempt < attempts => {
                    debug!(resource_id = %resource_id, attempt, "Resource busy; retrying");
                    attempt += 1;
                    tokio::time::sleep(self.timing.busy_retry_backoff()).await;
                }
                result => return result,
            }
        }
    }

    /// Send a command to a truck; only STOP reaches a truck in EMERGENCY
    fn notify(&self, truck_id: &str, command: OutboundCommand, payload: Map<String, Value>) {
        if command != OutboundCommand::Stop && self.contexts.state(truck_id) == TruckState::Emergency {
            debug!(truck_id = %truck_id, command = %command, "Suppressed command to halted truck");
            return;
        }
        if let Err(e) = self.dispatcher.send(truck_id, command, payload) {
            warn!(truck_id = %truck_id, command = %command, error = %e, "Command not delivered");
        }
    }
}

//! Transition table
//!
//! Keyed by (state, event). Wildcard entries ([`StateKey::Any`]) apply in
//! every state that has no entry of its own for the event. Within a key the
//! first transition whose guard admits the event wins.

use fleetloop_core::{BatteryConfig, MissionPhase, Position};
use std::collections::HashMap;

use crate::context::{TruckContext, TruckState};
use crate::fsm::event::{EventKind, TruckEvent};

/// Inputs a guard may inspect
pub struct Facts<'a> {
    /// Context before the transition
    pub context: &'a TruckContext,
    /// Event being processed
    pub event: &'a TruckEvent,
    /// Battery thresholds
    pub battery: &'a BatteryConfig,
    /// Belt full sensor
    pub belt_full: bool,
}

/// Guard predicate
pub type Guard = fn(&Facts<'_>) -> bool;

/// Table key state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Matches every state
    Any,
    /// Matches one state
    State(TruckState),
}

/// Procedure run when a transition is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Bind the oldest waiting mission, or fall back to charge / NO_MISSION
    AssignMission,
    /// Send the truck to charge
    StartCharging,
    /// Apply the checkpoint gate policy
    ArriveCheckpoint,
    /// Stop at the mission's load bay and start the dispenser handoff
    ArriveLoadBay,
    /// Stop at the belt for unloading
    ArriveBelt,
    /// Close the mission and look for the next one
    CompleteMission,
    /// Stop at standby
    ParkAtStandby,
    /// Keep driving
    PassThrough,
    /// Gate is open, drive on
    ResumeAfterGate,
    /// Truck confirmed loading
    BeginLoading,
    /// Cargo arrived before the truck confirmed loading
    MarkCargoReady,
    /// Close the dispenser and send the truck on
    FinishDispensing,
    /// Truck finished loading without a pending dispenser handoff
    DepartLoadBay,
    /// Start the belt
    BeginUnloading,
    /// Stop the belt and send the truck home
    DepartBelt,
    /// Charging finished; look for work
    FinishCharging,
    /// Halt the truck and the belt
    EnterEmergency,
    /// Cancel any bound mission and clear bookkeeping
    Reset,
    /// Refuse with an ACK carrying this status
    Refuse(&'static str),
}

/// One table entry
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    /// Next state
    pub to: TruckState,
    /// Optional guard
    pub guard: Option<Guard>,
    /// Action procedure
    pub action: Action,
}

impl Transition {
    /// Whether the guard admits these facts
    pub fn admits(&self, facts: &Facts<'_>) -> bool {
        self.guard.map_or(true, |guard| guard(facts))
    }
}

/// The truck transition table
pub struct TransitionTable {
    entries: HashMap<(StateKey, EventKind), Vec<Transition>>,
}

fn can_take_mission(f: &Facts<'_>) -> bool {
    let ctx = f.context;
    !ctx.is_charging
        && (ctx.battery_level > f.battery.low_threshold
            || (f.battery.allow_low_battery_at_standby && ctx.position == Position::Standby))
}

fn battery_low(f: &Facts<'_>) -> bool {
    !f.context.is_charging && f.context.battery_level <= f.battery.low_threshold
}

fn battery_full(f: &Facts<'_>) -> bool {
    f.context.battery_level >= f.battery.full_level
}

fn arrived_at_checkpoint(f: &Facts<'_>) -> bool {
    f.event.arrived_at().is_some_and(|p| p.is_checkpoint())
}

fn arrived_at_load_bay(f: &Facts<'_>) -> bool {
    f.event.arrived_at().is_some_and(|p| p.is_load_bay())
}

fn arrived_at_belt_with_cargo(f: &Facts<'_>) -> bool {
    f.event.arrived_at() == Some(Position::Belt) && f.context.mission_phase == MissionPhase::ToUnloading
}

fn arrived_home_returning(f: &Facts<'_>) -> bool {
    f.event.arrived_at() == Some(Position::Standby)
        && f.context.mission_phase == MissionPhase::Returning
        && f.context.mission_id.is_some()
}

fn arrived_home_unbound(f: &Facts<'_>) -> bool {
    f.event.arrived_at() == Some(Position::Standby) && f.context.mission_id.is_none()
}

fn at_checkpoint(f: &Facts<'_>) -> bool {
    f.context.position.is_checkpoint()
}

fn at_load_bay(f: &Facts<'_>) -> bool {
    f.context.position.is_load_bay()
}

fn loading_ticket_matches(f: &Facts<'_>) -> bool {
    let TruckEvent::DispenserLoaded { ticket, .. } = f.event else {
        return false;
    };
    match (&f.context.loading, ticket) {
        (Some(active), Some(ticket)) => active.ticket == *ticket,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn first_cargo_signal(f: &Facts<'_>) -> bool {
    loading_ticket_matches(f) && loading_pending(f)
}

fn loading_settled(f: &Facts<'_>) -> bool {
    f.context.loading.as_ref().map_or(true, |t| t.cargo_ready)
}

fn loading_pending(f: &Facts<'_>) -> bool {
    !loading_settled(f)
}

fn belt_free_at_belt(f: &Facts<'_>) -> bool {
    f.context.position == Position::Belt && !f.belt_full
}

fn belt_full_at_belt(f: &Facts<'_>) -> bool {
    f.context.position == Position::Belt && f.belt_full
}

impl TransitionTable {
    /// Empty table
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The dispatcher's truck table
    pub fn standard() -> Self {
        use Action as A;
        use EventKind as E;
        use TruckState as S;

        let mut table = Self::empty();

        table.add(S::Idle, E::AssignMission, S::Assigned, Some(can_take_mission), A::AssignMission);
        table.add(S::Idle, E::AssignMission, S::Charging, Some(battery_low), A::StartCharging);
        table.add(S::Idle, E::StartCharging, S::Charging, Some(battery_low), A::StartCharging);

        for from in [S::Assigned, S::Moving] {
            table.add(from, E::Arrived, S::Waiting, Some(arrived_at_checkpoint), A::ArriveCheckpoint);
            table.add(from, E::Arrived, S::Waiting, Some(arrived_at_load_bay), A::ArriveLoadBay);
            table.add(from, E::Arrived, S::Waiting, Some(arrived_at_belt_with_cargo), A::ArriveBelt);
            table.add(from, E::Arrived, S::Idle, Some(arrived_home_returning), A::CompleteMission);
            table.add(from, E::Arrived, S::Idle, Some(arrived_home_unbound), A::ParkAtStandby);
            table.add(from, E::Arrived, S::Moving, None, A::PassThrough);
        }

        // A truck held at a gate may re-report its arrival to retry the policy
        table.add(S::Waiting, E::Arrived, S::Waiting, Some(arrived_at_checkpoint), A::ArriveCheckpoint);
        table.add(S::Waiting, E::AckGateOpened, S::Moving, Some(at_checkpoint), A::ResumeAfterGate);

        table.add(S::Waiting, E::StartLoading, S::Loading, Some(at_load_bay), A::BeginLoading);
        table.add(S::Waiting, E::DispenserLoaded, S::Waiting, Some(first_cargo_signal), A::MarkCargoReady);
        table.add(S::Loading, E::DispenserLoaded, S::Moving, Some(loading_ticket_matches), A::FinishDispensing);
        table.add(S::Loading, E::FinishLoading, S::Moving, Some(loading_settled), A::DepartLoadBay);
        table.add(
            S::Loading,
            E::FinishLoading,
            S::Loading,
            Some(loading_pending),
            A::Refuse("LOADING_IN_PROGRESS"),
        );

        table.add(S::Waiting, E::StartUnloading, S::Unloading, Some(belt_free_at_belt), A::BeginUnloading);
        table.add(S::Waiting, E::StartUnloading, S::Waiting, Some(belt_full_at_belt), A::Refuse("BELT_FULL"));
        table.add(S::Unloading, E::FinishUnloading, S::Moving, None, A::DepartBelt);

        table.add(S::Charging, E::FinishCharging, S::Idle, Some(battery_full), A::FinishCharging);

        table.add_any(E::EmergencyTriggered, S::Emergency, A::EnterEmergency);
        table.add_any(E::Reset, S::Idle, A::Reset);

        table
    }

    /// Append a state-specific entry
    pub fn add(&mut self, from: TruckState, event: EventKind, to: TruckState, guard: Option<Guard>, action: Action) {
        self.entries
            .entry((StateKey::State(from), event))
            .or_default()
            .push(Transition { to, guard, action });
    }

    /// Append a wildcard entry
    pub fn add_any(&mut self, event: EventKind, to: TruckState, action: Action) {
        self.entries
            .entry((StateKey::Any, event))
            .or_default()
            .push(Transition { to, guard: None, action });
    }

    /// Candidate transitions for (state, event), state-specific first
    pub fn lookup(&self, state: TruckState, event: EventKind) -> Option<&[Transition]> {
        self.entries
            .get(&(StateKey::State(state), event))
            .or_else(|| self.entries.get(&(StateKey::Any, event)))
            .map(Vec::as_slice)
    }

    /// Whether any entry exists for (state, event)
    pub fn is_handled(&self, state: TruckState, event: EventKind) -> bool {
        self.lookup(state, event).is_some()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

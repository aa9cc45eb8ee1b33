//! Truck context store
//!
//! One [`TruckContext`] per truck, created lazily on first reference and kept
//! for the life of the process. Each truck also owns a turn lock: transition
//! logic for a truck runs only while holding it, so no two transitions for
//! the same truck interleave. Telemetry and the emergency path write the
//! context directly without taking the turn.

use fleetloop_core::{now_ms, Direction, MissionPhase, Position, Route};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Truck-level FSM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TruckState {
    /// Parked, no mission
    Idle,
    /// Mission bound, leaving standby
    Assigned,
    /// Driving between nodes
    Moving,
    /// Stopped at a node awaiting a trigger
    Waiting,
    /// Cargo transfer at a load bay
    Loading,
    /// Cargo discharge at the belt
    Unloading,
    /// Charging at standby
    Charging,
    /// Halted; only RESET leaves this state
    Emergency,
}

impl TruckState {
    /// Every state
    pub const ALL: [TruckState; 8] = [
        TruckState::Idle,
        TruckState::Assigned,
        TruckState::Moving,
        TruckState::Waiting,
        TruckState::Loading,
        TruckState::Unloading,
        TruckState::Charging,
        TruckState::Emergency,
    ];

    /// Wire / log token
    pub fn as_str(&self) -> &'static str {
        match self {
            TruckState::Idle => "IDLE",
            TruckState::Assigned => "ASSIGNED",
            TruckState::Moving => "MOVING",
            TruckState::Waiting => "WAITING",
            TruckState::Loading => "LOADING",
            TruckState::Unloading => "UNLOADING",
            TruckState::Charging => "CHARGING",
            TruckState::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for TruckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispenser handoff at a load bay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingTicket {
    /// Sequence number; stale safety timers carry an older one
    pub ticket: u64,
    /// Dispenser serving the bay
    pub dispenser_id: String,
    /// Route the dispenser was aligned to
    pub route: Route,
    /// DISPENSER_LOADED arrived before the truck confirmed START_LOADING
    pub cargo_ready: bool,
}

/// Per-truck working memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruckContext {
    /// Truck identifier
    pub truck_id: String,
    /// FSM state
    pub state: TruckState,
    /// Last known node
    pub position: Position,
    /// Bound mission
    pub mission_id: Option<String>,
    /// Load bay of the bound mission
    pub mission_source: Option<Position>,
    /// Progress through the bound mission
    pub mission_phase: MissionPhase,
    /// Traversal sense
    pub direction: Option<Direction>,
    /// Next node the truck is expected to reach
    pub target_position: Option<Position>,
    /// Battery percent, always within 0..=100
    pub battery_level: u8,
    /// Charging flag
    pub is_charging: bool,
    /// Unix epoch milliseconds of the last change
    pub last_update_time: u64,
    /// Active dispenser handoff
    pub loading: Option<LoadingTicket>,
    /// Last issued loading ticket number
    pub loading_seq: u64,
    /// Emergency stops recorded since start-up
    pub halts: u64,
}

impl TruckContext {
    /// Fresh context: IDLE at standby with a full battery
    pub fn new(truck_id: impl Into<String>) -> Self {
        Self {
            truck_id: truck_id.into(),
            state: TruckState::Idle,
            position: Position::Standby,
            mission_id: None,
            mission_source: None,
            mission_phase: MissionPhase::None,
            direction: None,
            target_position: None,
            battery_level: 100,
            is_charging: false,
            last_update_time: now_ms(),
            loading: None,
            loading_seq: 0,
            halts: 0,
        }
    }

    /// Drop every mission-related field
    pub fn clear_mission(&mut self) {
        self.mission_id = None;
        self.mission_source = None;
        self.mission_phase = MissionPhase::None;
        self.direction = None;
        self.target_position = None;
        self.loading = None;
    }

    /// Issue the next loading ticket for `route`
    pub fn issue_ticket(&mut self, dispenser_id: &str, route: Route) -> u64 {
        self.loading_seq += 1;
        self.loading = Some(LoadingTicket {
            ticket: self.loading_seq,
            dispenser_id: dispenser_id.to_string(),
            route,
            cargo_ready: false,
        });
        self.loading_seq
    }
}

/// Clamp a raw telemetry reading into 0..=100
pub fn clamp_battery(level: i64) -> u8 {
    level.clamp(0, 100) as u8
}

/// A truck's context plus its turn lock
pub struct TruckSlot {
    turn: tokio::sync::Mutex<()>,
    context: Mutex<TruckContext>,
}

impl TruckSlot {
    fn new(truck_id: &str) -> Self {
        Self {
            turn: tokio::sync::Mutex::new(()),
            context: Mutex::new(TruckContext::new(truck_id)),
        }
    }

    /// Wait for exclusive transition rights for this truck
    pub async fn begin_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// Copy of the current context
    pub fn snapshot(&self) -> TruckContext {
        self.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Mutate the context in place
    pub fn with<R>(&self, f: impl FnOnce(&mut TruckContext) -> R) -> R {
        let mut context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut context)
    }
}

/// All truck contexts
#[derive(Default)]
pub struct ContextStore {
    slots: RwLock<HashMap<String, Arc<TruckSlot>>>,
}

impl ContextStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `truck_id`, created on first reference
    pub fn slot(&self, truck_id: &str) -> Arc<TruckSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(truck_id)
        {
            return slot.clone();
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(truck_id.to_string())
            .or_insert_with(|| Arc::new(TruckSlot::new(truck_id)))
            .clone()
    }

    /// Whether a context exists for `truck_id`
    pub fn contains(&self, truck_id: &str) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(truck_id)
    }

    /// Copy of a truck's context
    pub fn get(&self, truck_id: &str) -> Option<TruckContext> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(truck_id).map(|slot| slot.snapshot())
    }

    /// Current state of a truck (IDLE for unknown trucks)
    pub fn state(&self, truck_id: &str) -> TruckState {
        self.get(truck_id).map(|c| c.state).unwrap_or(TruckState::Idle)
    }

    /// Copies of every context, ordered by truck id
    pub fn all(&self) -> Vec<TruckContext> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut contexts: Vec<TruckContext> = slots.values().map(|s| s.snapshot()).collect();
        contexts.sort_by(|a, b| a.truck_id.cmp(&b.truck_id));
        contexts
    }

    /// Mutate a truck's context in place, creating it if needed
    pub fn modify<R>(&self, truck_id: &str, f: impl FnOnce(&mut TruckContext) -> R) -> R {
        self.slot(truck_id).with(|context| {
            let result = f(context);
            context.last_update_time = now_ms();
            result
        })
    }

    /// Store a battery reading clamped to 0..=100; returns the stored level
    pub fn update_battery(&self, truck_id: &str, level: i64) -> u8 {
        let clamped = clamp_battery(level);
        self.modify(truck_id, |context| context.battery_level = clamped);
        clamped
    }

    /// Store a reported position
    pub fn update_position(&self, truck_id: &str, position: Position) {
        self.modify(truck_id, |context| context.position = position);
    }

    /// Truck holding a loading ticket, optionally for a specific route
    pub fn find_loading_truck(&self, route: Option<Route>) -> Option<String> {
        self.all()
            .into_iter()
            .filter_map(|c| c.loading.map(|t| (c.truck_id, t)))
            .filter(|(_, ticket)| route.map_or(true, |r| ticket.route == r))
            .min_by_key(|(_, ticket)| ticket.ticket)
            .map(|(truck_id, _)| truck_id)
    }
}

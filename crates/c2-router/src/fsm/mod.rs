//! Truck finite-state machine
//!
//! [`table`] holds the (state, event) transition data, [`gate_policy`] the
//! checkpoint gate rules and [`engine`] the procedures that run them.

pub mod engine;
pub mod event;
pub mod gate_policy;
pub mod table;

pub use engine::{FsmEngine, TransitionOutcome};
pub use event::{EventKind, TruckEvent};
pub use gate_policy::{gate_action, GateAction};
pub use table::{Action, Facts, Guard, StateKey, Transition, TransitionTable};

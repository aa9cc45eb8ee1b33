//! Mission Queue & Lifecycle
//!
//! Holds waiting, assigned and closed missions and hands the oldest waiting
//! mission to a requesting truck. The in-memory queue is authoritative for
//! dispatch decisions; every mutation is written through to the
//! [`FleetStore`](fleetloop_core::FleetStore) as a side effect.

#![warn(missing_docs)]

pub mod queue;

pub use queue::{MissionQueue, QueueError, RestoreReport};

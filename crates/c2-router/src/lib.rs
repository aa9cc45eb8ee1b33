//! C2 Router - truck FSM and dispatch core for fleetloop
//!
//! This crate turns truck and plant-device messages into truck state
//! transitions and outbound commands. It handles:
//! - Wire codec and command vocabulary
//! - Per-truck context with a turn lock serializing transition logic
//! - The (state, event) transition table and its actions
//! - Message routing, telemetry and duplicate-signal suppression
//! - Session registry and the TCP server trucks and devices connect to
//!
//! # Architecture
//!
//! Messages flow through the following pipeline:
//! 1. A line arrives on a connection and is decoded by [`codec`]
//! 2. [`MessageRouter`] drops duplicates, applies telemetry and builds a [`TruckEvent`]
//! 3. [`FsmEngine`] looks the transition up, drives gates, belt and dispenser,
//!    and updates the mission queue
//! 4. Outbound commands leave through the [`CommandDispatcher`]
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetloop_c2_router::FleetApp;
//! use fleetloop_core::{FleetConfig, SqliteStore};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::open("data/fleetloop.db")?);
//! let app = FleetApp::from_config(FleetConfig::default(), store);
//! app.restore_missions()?;
//! app.server().run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod app;
pub mod codec;
pub mod command_types;
pub mod context;
pub mod device_link;
pub mod dispatcher;
pub mod fsm;
pub mod idempotency;
pub mod router;
pub mod server;

pub use app::FleetApp;
pub use codec::{CodecError, Message};
pub use command_types::{InboundCommand, OutboundCommand};
pub use context::{ContextStore, LoadingTicket, TruckContext, TruckSlot, TruckState};
pub use device_link::DispatchLink;
pub use dispatcher::{CommandDispatcher, DispatchError, Outbox};
pub use fsm::{EventKind, FsmEngine, TransitionOutcome, TransitionTable, TruckEvent};
pub use idempotency::{DedupError, DedupWindow};
pub use router::{is_emergency, MessageRouter, RouteOutcome};
pub use server::{FleetServer, ServerError};

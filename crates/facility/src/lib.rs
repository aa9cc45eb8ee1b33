//! Facility - gate, belt and dispenser control for fleetloop
//!
//! Each controller models one physical resource with its own small state
//! machine and a request / await-acknowledgment protocol:
//! - **Gate**: CLOSED, OPENING, OPENED, CLOSING
//! - **Belt**: STOPPED / RUNNING with a full sensor that preempts RUN
//! - **Dispenser**: CLOSED / OPENED aligned to ROUTE_A or ROUTE_B
//!
//! Operations block the caller until the device acknowledges or the retry
//! budget runs out, in which case the resource is force-advanced to the
//! expected post-condition. Every state change is appended to the store's
//! facility audit log.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fleetloop_core::{SqliteStore, TimingConfig};
//! use fleetloop_facility::{FacilityManager, SimulatedLink, GATE_A};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::open_in_memory()?);
//! let (link, _signals) = SimulatedLink::new(Duration::from_millis(200), Duration::from_secs(3));
//! let facility = FacilityManager::new(Arc::new(link), store, &TimingConfig::default());
//! facility.open_gate(GATE_A).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod belt;
pub mod dispenser;
pub mod gate;
pub mod link;
pub mod manager;
pub mod operation;

use thiserror::Error;

pub use belt::{BeltController, BeltState};
pub use dispenser::{DispenserController, DispenserState};
pub use gate::{GateController, GateState};
pub use link::{
    AckHub, DeviceAck, DeviceAction, DeviceCommand, DeviceLink, DeviceStatus, ResourceKind,
    SimulatedLink,
};
pub use manager::{FacilityManager, ResourceSnapshot};
pub use operation::{OperationOutcome, RetryPolicy};

/// Inbound gate
pub const GATE_A: &str = "GATE_A";
/// Outbound gate
pub const GATE_B: &str = "GATE_B";
/// Unloading belt
pub const BELT: &str = "BELT";
/// Loading dispenser
pub const DISPENSER: &str = "DISPENSER";

/// Facility errors
#[derive(Debug, Error)]
pub enum FacilityError {
    /// Another operation on the resource is in flight
    #[error("Resource busy: {0}")]
    Busy(String),

    /// No such resource
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// Belt full sensor is tripped
    #[error("Belt full: {0}")]
    BeltFull(String),

    /// An emergency stop overtook the operation before it was acknowledged
    #[error("Operation interrupted by emergency stop: {0}")]
    Interrupted(String),
}

//! Request / acknowledge cycle shared by every controller
//!
//! One operation may be in flight per resource. A second request while the
//! first is pending fails with [`FacilityError::Busy`] and is never queued.
//! An operation that exhausts its retries is force-advanced by the caller.

use fleetloop_core::{now_ms, FacilityRecord, FleetStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::link::{AckHub, DeviceCommand, DeviceLink, DeviceStatus, ResourceKind};
use crate::FacilityError;

/// Per-attempt timeout and retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait for the acknowledgment this long per attempt
    pub timeout: Duration,
    /// Attempts before giving up
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Build a policy; at least one attempt is always made
    pub fn new(timeout: Duration, attempts: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

/// How an operation concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// The device acknowledged
    Confirmed,
    /// Resource was already in the requested state; nothing was sent
    AlreadyInState,
    /// Retries exhausted; state was set to the expected post-condition
    Forced,
}

/// In-progress flag for one resource
#[derive(Debug, Default)]
pub(crate) struct InFlight(AtomicBool);

impl InFlight {
    pub(crate) fn try_begin(&self, resource_id: &str) -> Result<InFlightGuard<'_>, FacilityError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FacilityError::Busy(resource_id.to_string()))?;
        Ok(InFlightGuard(&self.0))
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the in-progress flag when the operation ends, however it ends
pub(crate) struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Send `command` until one of `accepts` comes back or the policy is exhausted
///
/// Returns the acknowledged status, or `None` when every attempt timed out.
pub(crate) async fn execute(
    link: &dyn DeviceLink,
    hub: &AckHub,
    command: &DeviceCommand,
    accepts: &[DeviceStatus],
    policy: &RetryPolicy,
) -> Option<DeviceStatus> {
    for attempt in 1..=policy.attempts {
        let ack = hub.expect(&command.resource_id, accepts);

        if !link.send_command(command) {
            warn!(command = %command, attempt, "Device link refused command");
        } else {
            match tokio::time::timeout(policy.timeout, ack).await {
                Ok(Ok(status)) => {
                    debug!(command = %command, attempt, ?status, "Device acknowledged");
                    return Some(status);
                }
                Ok(Err(_)) => {
                    warn!(command = %command, attempt, "Acknowledgment channel dropped");
                }
                Err(_) => {
                    warn!(
                        command = %command,
                        attempt,
                        timeout_ms = policy.timeout.as_millis() as u64,
                        "Device acknowledgment timed out"
                    );
                }
            }
        }

        if attempt < policy.attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }
    None
}

/// Link, hub, audit sink and retry policy bundled for one controller
#[derive(Clone)]
pub(crate) struct DevicePort {
    pub(crate) link: Arc<dyn DeviceLink>,
    pub(crate) hub: Arc<AckHub>,
    pub(crate) store: Arc<dyn FleetStore>,
    pub(crate) policy: RetryPolicy,
}

impl DevicePort {
    pub(crate) async fn execute(&self, command: &DeviceCommand, accepts: &[DeviceStatus]) -> Option<DeviceStatus> {
        execute(self.link.as_ref(), &self.hub, command, accepts, &self.policy).await
    }

    pub(crate) fn audit(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        state: &str,
        operation: &str,
        detail: Option<String>,
    ) {
        audit(self.store.as_ref(), kind, resource_id, state, operation, detail);
    }
}

/// Append a facility state change to the audit trail; failures are logged only
pub(crate) fn audit(
    store: &dyn FleetStore,
    kind: ResourceKind,
    resource_id: &str,
    state: &str,
    operation: &str,
    detail: Option<String>,
) {
    let record = FacilityRecord {
        resource_kind: kind.as_str().to_string(),
        resource_id: resource_id.to_string(),
        state: state.to_string(),
        operation: operation.to_string(),
        detail,
        timestamp: now_ms(),
    };
    if let Err(e) = store.append_facility(&record) {
        warn!(resource_id = %resource_id, error = %e, "Facility audit write failed");
    }
}

//! Device link and acknowledgment plumbing
//!
//! Commands to gates, the belt and the dispenser are fire-and-forget at the
//! transport level. Controllers register the acknowledgment they expect with
//! the [`AckHub`] before sending, then wait on it with a deadline.

use fleetloop_core::Route;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{BELT, DISPENSER};

/// Kind of physical resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    /// Barrier at a checkpoint
    Gate,
    /// Unloading conveyor
    Belt,
    /// Loading mechanism
    Dispenser,
}

impl ResourceKind {
    /// Audit token
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Gate => "GATE",
            ResourceKind::Belt => "BELT",
            ResourceKind::Dispenser => "DISPENSER",
        }
    }
}

/// Action requested from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAction {
    /// Open a gate or the dispenser
    Open,
    /// Close a gate or the dispenser
    Close,
    /// Start the belt
    Run,
    /// Stop the belt
    Stop,
    /// Align the dispenser to a route
    SetRoute(Route),
}

impl DeviceAction {
    /// Wire command token
    pub fn as_cmd(&self) -> &'static str {
        match self {
            DeviceAction::Open => "OPEN",
            DeviceAction::Close => "CLOSE",
            DeviceAction::Run => "RUN",
            DeviceAction::Stop => "STOP",
            DeviceAction::SetRoute(_) => "SET_ROUTE",
        }
    }
}

/// Command addressed to one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Target resource (GATE_A, BELT, ...)
    pub resource_id: String,
    /// Requested action
    pub action: DeviceAction,
}

impl DeviceCommand {
    /// Build a command
    pub fn new(resource_id: impl Into<String>, action: DeviceAction) -> Self {
        Self {
            resource_id: resource_id.into(),
            action,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            DeviceAction::SetRoute(route) => write!(f, "{} SET_ROUTE {}", self.resource_id, route),
            action => write!(f, "{} {}", self.resource_id, action.as_cmd()),
        }
    }
}

/// Status reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Gate or dispenser is open
    Opened,
    /// Gate or dispenser is closed
    Closed,
    /// Belt is running
    Running,
    /// Belt is stopped
    Stopped,
    /// Belt full sensor tripped
    Full,
    /// Belt full sensor cleared
    Cleared,
    /// Dispenser aligned to a route
    RouteSet(Route),
    /// Dispenser finished transferring cargo
    Loaded(Route),
}

impl DeviceStatus {
    /// Map a device's wire acknowledgment to a status
    pub fn from_wire(cmd: &str, route: Option<Route>) -> Option<Self> {
        match cmd {
            "GATE_OPENED" | "DISPENSER_OPENED" => Some(DeviceStatus::Opened),
            "GATE_CLOSED" | "DISPENSER_CLOSED" => Some(DeviceStatus::Closed),
            "BELT_RUNNING" => Some(DeviceStatus::Running),
            "BELT_STOPPED" => Some(DeviceStatus::Stopped),
            "BELT_FULL" => Some(DeviceStatus::Full),
            "BELT_CLEARED" => Some(DeviceStatus::Cleared),
            "DISPENSER_ROUTE_SET" => route.map(DeviceStatus::RouteSet),
            _ => None,
        }
    }

    /// Whether `cmd` belongs to the device acknowledgment vocabulary
    pub fn is_wire_ack(cmd: &str) -> bool {
        matches!(
            cmd,
            "GATE_OPENED"
                | "GATE_CLOSED"
                | "BELT_RUNNING"
                | "BELT_STOPPED"
                | "BELT_FULL"
                | "BELT_CLEARED"
                | "DISPENSER_OPENED"
                | "DISPENSER_CLOSED"
                | "DISPENSER_ROUTE_SET"
        )
    }
}

/// Status report from one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAck {
    /// Reporting resource
    pub resource_id: String,
    /// Reported status
    pub status: DeviceStatus,
}

impl DeviceAck {
    /// Build an acknowledgment
    pub fn new(resource_id: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            resource_id: resource_id.into(),
            status,
        }
    }
}

/// Outbound path to the physical devices
pub trait DeviceLink: Send + Sync {
    /// Push a command; `false` if the transport refused it
    fn send_command(&self, command: &DeviceCommand) -> bool;
}

struct Waiter {
    accepts: Vec<DeviceStatus>,
    tx: oneshot::Sender<DeviceStatus>,
}

/// Pending acknowledgment waiters keyed by resource id
#[derive(Default)]
pub struct AckHub {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl AckHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next status from `resource_id` that is one of `accepts`
    pub fn expect(&self, resource_id: &str, accepts: &[DeviceStatus]) -> oneshot::Receiver<DeviceStatus> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.entry(resource_id.to_string()).or_default().push(Waiter {
            accepts: accepts.to_vec(),
            tx,
        });
        rx
    }

    /// Resolve every waiter the acknowledgment satisfies; returns how many were woken
    pub fn deliver(&self, ack: &DeviceAck) -> usize {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pending) = waiters.get_mut(&ack.resource_id) else {
            return 0;
        };

        let mut woken = 0;
        let mut kept = Vec::with_capacity(pending.len());
        for waiter in pending.drain(..) {
            if waiter.tx.is_closed() {
                continue;
            }
            if waiter.accepts.contains(&ack.status) {
                if waiter.tx.send(ack.status).is_ok() {
                    woken += 1;
                }
            } else {
                kept.push(waiter);
            }
        }
        *pending = kept;
        if pending.is_empty() {
            waiters.remove(&ack.resource_id);
        }
        woken
    }

    /// Number of live waiters for a resource
    pub fn pending(&self, resource_id: &str) -> usize {
        let waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters
            .get(resource_id)
            .map(|w| w.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// In-process stand-in for the plant hardware
///
/// Every accepted command is answered on the signal channel after the
/// configured delay. Opening the dispenser additionally produces a
/// [`DeviceStatus::Loaded`] signal once the simulated transfer finishes.
pub struct SimulatedLink {
    signals: mpsc::UnboundedSender<DeviceAck>,
    ack_delay: Duration,
    load_delay: Duration,
    route: Mutex<Route>,
    belt_full: AtomicBool,
    silent: AtomicBool,
    history: Mutex<Vec<DeviceCommand>>,
}

impl SimulatedLink {
    /// Create the link and the receiver its signals arrive on
    pub fn new(ack_delay: Duration, load_delay: Duration) -> (Self, mpsc::UnboundedReceiver<DeviceAck>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let link = Self {
            signals,
            ack_delay,
            load_delay,
            route: Mutex::new(Route::RouteA),
            belt_full: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        };
        (link, rx)
    }

    /// Stop answering commands (hardware that never acknowledges)
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Trip or clear the belt full sensor and report it
    pub fn set_belt_full(&self, full: bool) {
        self.belt_full.store(full, Ordering::SeqCst);
        let status = if full { DeviceStatus::Full } else { DeviceStatus::Cleared };
        let _ = self.signals.send(DeviceAck::new(BELT, status));
    }

    /// Every command received so far
    pub fn history(&self) -> Vec<DeviceCommand> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Commands received for one resource
    pub fn commands_for(&self, resource_id: &str) -> Vec<DeviceAction> {
        self.history()
            .into_iter()
            .filter(|c| c.resource_id == resource_id)
            .map(|c| c.action)
            .collect()
    }

    fn reply_for(&self, command: &DeviceCommand) -> DeviceStatus {
        match command.action {
            DeviceAction::Open => DeviceStatus::Opened,
            DeviceAction::Close => DeviceStatus::Closed,
            DeviceAction::Run if self.belt_full.load(Ordering::SeqCst) => DeviceStatus::Full,
            DeviceAction::Run => DeviceStatus::Running,
            DeviceAction::Stop => DeviceStatus::Stopped,
            DeviceAction::SetRoute(route) => DeviceStatus::RouteSet(route),
        }
    }

    fn emit_after(&self, delay: Duration, ack: DeviceAck) {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if signals.send(ack).is_err() {
                debug!("Simulated signal dropped: receiver closed");
            }
        });
    }
}

impl DeviceLink for SimulatedLink {
    fn send_command(&self, command: &DeviceCommand) -> bool {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(command = %command, "Simulated link used outside a runtime");
            return false;
        }

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        debug!(command = %command, "Simulated device command");

        if self.silent.load(Ordering::SeqCst) {
            return true;
        }

        if let DeviceAction::SetRoute(route) = command.action {
            *self.route.lock().unwrap_or_else(PoisonError::into_inner) = route;
        }

        let status = self.reply_for(command);
        self.emit_after(self.ack_delay, DeviceAck::new(command.resource_id.clone(), status));

        if command.resource_id == DISPENSER && command.action == DeviceAction::Open {
            let route = *self.route.lock().unwrap_or_else(PoisonError::into_inner);
            self.emit_after(
                self.ack_delay + self.load_delay,
                DeviceAck::new(DISPENSER, DeviceStatus::Loaded(route)),
            );
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GATE_A;

    #[tokio::test]
    async fn test_hub_resolves_matching_waiter_only() {
        let hub = AckHub::new();
        let opened = hub.expect(GATE_A, &[DeviceStatus::Opened]);
        let closed = hub.expect(GATE_A, &[DeviceStatus::Closed]);

        assert_eq!(hub.deliver(&DeviceAck::new(GATE_A, DeviceStatus::Opened)), 1);
        assert_eq!(opened.await.unwrap(), DeviceStatus::Opened);
        assert_eq!(hub.pending(GATE_A), 1);
        drop(closed);
        assert_eq!(hub.pending(GATE_A), 0);
    }

    #[test]
    fn test_hub_ignores_unknown_resource() {
        let hub = AckHub::new();
        assert_eq!(hub.deliver(&DeviceAck::new("GATE_Z", DeviceStatus::Opened)), 0);
    }

    #[test]
    fn test_wire_ack_vocabulary() {
        assert_eq!(DeviceStatus::from_wire("GATE_OPENED", None), Some(DeviceStatus::Opened));
        assert_eq!(
            DeviceStatus::from_wire("DISPENSER_ROUTE_SET", Some(Route::RouteB)),
            Some(DeviceStatus::RouteSet(Route::RouteB))
        );
        assert_eq!(DeviceStatus::from_wire("DISPENSER_ROUTE_SET", None), None);
        assert!(DeviceStatus::is_wire_ack("BELT_FULL"));
        assert!(!DeviceStatus::is_wire_ack("ARRIVED"));
    }

    #[tokio::test]
    async fn test_simulated_dispenser_reports_loaded() {
        let (link, mut rx) = SimulatedLink::new(Duration::from_millis(1), Duration::from_millis(5));
        assert!(link.send_command(&DeviceCommand::new(DISPENSER, DeviceAction::SetRoute(Route::RouteB))));
        assert!(link.send_command(&DeviceCommand::new(DISPENSER, DeviceAction::Open)));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().status);
        }
        assert!(seen.contains(&DeviceStatus::RouteSet(Route::RouteB)));
        assert!(seen.contains(&DeviceStatus::Opened));
        assert_eq!(seen.last(), Some(&DeviceStatus::Loaded(Route::RouteB)));
    }

    #[tokio::test]
    async fn test_simulated_belt_reports_full() {
        let (link, mut rx) = SimulatedLink::new(Duration::from_millis(1), Duration::from_secs(60));
        link.set_belt_full(true);
        assert_eq!(rx.recv().await.unwrap().status, DeviceStatus::Full);

        link.send_command(&DeviceCommand::new(BELT, DeviceAction::Run));
        assert_eq!(rx.recv().await.unwrap().status, DeviceStatus::Full);
        assert_eq!(link.commands_for(BELT), vec![DeviceAction::Run]);
    }
}

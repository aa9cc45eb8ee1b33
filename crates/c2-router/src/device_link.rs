//! Network device link
//!
//! Gates, the belt and the dispenser connect to the same TCP server as the
//! trucks and say `HELLO` under their resource id. Commands reach them
//! through the [`CommandDispatcher`]; their acknowledgments come back
//! through the message router.

use fleetloop_facility::{DeviceAction, DeviceCommand, DeviceLink};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::command_types::OutboundCommand;
use crate::dispatcher::CommandDispatcher;

/// [`DeviceLink`] over dispatcher sessions
pub struct DispatchLink {
    dispatcher: Arc<CommandDispatcher>,
}

impl DispatchLink {
    /// Wrap a dispatcher
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl DeviceLink for DispatchLink {
    fn send_command(&self, command: &DeviceCommand) -> bool {
        let mut payload = Map::new();
        let cmd = match command.action {
            DeviceAction::Open => OutboundCommand::Open,
            DeviceAction::Close => OutboundCommand::Close,
            DeviceAction::Run => OutboundCommand::Run,
            DeviceAction::Stop => OutboundCommand::Stop,
            DeviceAction::SetRoute(route) => {
                payload.insert("route".to_string(), Value::from(route.as_str()));
                OutboundCommand::SetRoute
            }
        };

        match self.dispatcher.send(&command.resource_id, cmd, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(command = %command, error = %e, "Device command not delivered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetloop_core::Route;
    use tokio::sync::mpsc;

    #[test]
    fn test_set_route_carries_route() {
        let dispatcher = Arc::new(CommandDispatcher::new("SERVER"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register("DISPENSER", tx);

        let link = DispatchLink::new(dispatcher);
        assert!(link.send_command(&DeviceCommand::new("DISPENSER", DeviceAction::SetRoute(Route::RouteB))));

        let message = rx.try_recv().unwrap();
        assert_eq!(message.cmd, "SET_ROUTE");
        assert_eq!(message.payload_str("route"), Some("ROUTE_B"));
    }

    #[test]
    fn test_offline_device_refuses() {
        let link = DispatchLink::new(Arc::new(CommandDispatcher::new("SERVER")));
        assert!(!link.send_command(&DeviceCommand::new("GATE_A", DeviceAction::Open)));
    }
}

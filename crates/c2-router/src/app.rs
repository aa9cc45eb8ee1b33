//! Application context
//!
//! Every component is built once here and shared by handle. There are no
//! process-wide singletons; tests build a fresh [`FleetApp`] per case.

use fleetloop_core::{FacilityMode, FleetConfig, FleetStore};
use fleetloop_facility::{DeviceAck, DeviceLink, DeviceStatus, FacilityManager, SimulatedLink, DISPENSER};
use fleetloop_mission::{MissionQueue, QueueError, RestoreReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::Message;
use crate::context::ContextStore;
use crate::device_link::DispatchLink;
use crate::dispatcher::CommandDispatcher;
use crate::fsm::FsmEngine;
use crate::router::MessageRouter;
use crate::server::FleetServer;

/// The assembled dispatcher
pub struct FleetApp {
    config: FleetConfig,
    contexts: Arc<ContextStore>,
    queue: Arc<MissionQueue>,
    facility: Arc<FacilityManager>,
    dispatcher: Arc<CommandDispatcher>,
    engine: Arc<FsmEngine>,
    router: Arc<MessageRouter>,
}

impl FleetApp {
    /// Assemble the components over an existing dispatcher and device link
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn FleetStore>,
        dispatcher: Arc<CommandDispatcher>,
        link: Arc<dyn DeviceLink>,
    ) -> Self {
        let contexts = Arc::new(ContextStore::new());
        let queue = Arc::new(MissionQueue::new(store.clone()));
        let facility = Arc::new(FacilityManager::new(link, store.clone(), &config.timing));
        let engine = FsmEngine::new(
            contexts.clone(),
            queue.clone(),
            facility.clone(),
            dispatcher.clone(),
            store.clone(),
            &config,
        );
        let router = Arc::new(MessageRouter::new(engine.clone(), store, &config));

        Self {
            config,
            contexts,
            queue,
            facility,
            dispatcher,
            engine,
            router,
        }
    }

    /// Assemble with the device link the configuration names
    ///
    /// In simulated mode the simulator's signal pump is spawned, so this must
    /// run inside a tokio runtime.
    pub fn from_config(config: FleetConfig, store: Arc<dyn FleetStore>) -> Self {
        let dispatcher = Arc::new(CommandDispatcher::new(config.server.server_id.clone()));
        match config.facility.mode {
            FacilityMode::Simulated => {
                let (link, signals) = SimulatedLink::new(
                    Duration::from_millis(config.facility.sim_ack_delay_ms),
                    Duration::from_millis(config.facility.sim_load_delay_ms),
                );
                let app = Self::new(config, store, dispatcher, Arc::new(link));
                app.spawn_device_pump(signals);
                app
            }
            FacilityMode::Network => {
                let link = Arc::new(DispatchLink::new(dispatcher.clone()));
                Self::new(config, store, dispatcher, link)
            }
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &FleetConfig {
        &self.config
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

    /// Session registry
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// FSM engine
    pub fn engine(&self) -> &Arc<FsmEngine> {
        &self.engine
    }

    /// Message router
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Reload persisted missions after a restart
    pub fn restore_missions(&self) -> Result<RestoreReport, QueueError> {
        let report = self.queue.restore()?;
        info!(requeued = report.requeued.len(), canceled = report.canceled.len(), "Missions restored");
        Ok(report)
    }

    /// Enqueue the configured seed missions when nothing is waiting
    pub fn seed_missions(&self) -> Result<usize, QueueError> {
        if self.queue.has_waiting() {
            return Ok(0);
        }
        for seed in &self.config.seed_missions {
            self.queue.create(seed.cargo_type.clone(), seed.cargo_amount, seed.source)?;
        }
        Ok(self.config.seed_missions.len())
    }

    /// Feed simulator signals back into the system
    ///
    /// Acknowledgments go to the facility manager; a finished cargo transfer
    /// is routed as DISPENSER_LOADED so it passes the same dedup as a real
    /// dispenser report.
    pub fn spawn_device_pump(&self, mut signals: mpsc::UnboundedReceiver<DeviceAck>) -> JoinHandle<()> {
        let facility = self.facility.clone();
        let router = self.router.clone();
        let server_id = self.dispatcher.server_id().to_string();

        tokio::spawn(async move {
            while let Some(ack) = signals.recv().await {
                match ack.status {
                    DeviceStatus::Loaded(route) => {
                        let message = Message::new(ack.resource_id.as_str(), server_id.as_str(), "DISPENSER_LOADED")
                            .with("dispenser_id", DISPENSER)
                            .with("route", route.as_str());
                        let router = router.clone();
                        // Routing may wait on a truck's turn; keep acks flowing meanwhile
                        tokio::spawn(async move {
                            let outcome = router.route(message).await;
                            debug!(?outcome, "Simulated DISPENSER_LOADED routed");
                        });
                    }
                    _ => {
                        facility.deliver(&ack);
                    }
                }
            }
        })
    }

    /// TCP front end over this app's router and dispatcher
    pub fn server(&self) -> Arc<FleetServer> {
        Arc::new(FleetServer::new(
            self.router.clone(),
            self.dispatcher.clone(),
            self.config.server.listen_addr.clone(),
        ))
    }
}

//! The engine: one value owning every shared structure.
//!
//! ```text
//! raw line ─▶ matcher ─▶ pending replies ─▶ retransmit ack ─▶ coordinator ─▶ handler
//!                           (consumed)         (consumed)          │
//!                                                                  ▼
//!                                              adapter.on_incoming_telegram
//! ```

use std::sync::Arc;
use std::time::Duration;

use agvlink_commands::{ExplainedBool, MovementCommand, PositionOutcome, RetransmissionQueue};
use agvlink_core::{
    DynTransport, EngineConfig, EngineEvent, Error, EventBus, PendingReplyRegistry, Protocol,
    ProtocolMatcher, Request, RequestKind, Response, Result, TelegramSender, VehicleConfig,
};
use async_trait::async_trait;

use crate::actions::{ActionRegistry, LocationAction};
use crate::adapter::{AdapterContext, VehicleAdapter};
use crate::coordinator::RequestResponseCoordinator;
use crate::directory::AdapterDirectory;
use crate::factory::AdapterFactory;
use crate::handlers::{MoveTelegramHandler, PositionReportHandler};
use crate::router::DispatchRouter;

const EVENT_SOURCE: &str = "engine";

/// Emergency stop collaborator.
#[async_trait]
pub trait VehicleStopper: Send + Sync {
    async fn stop_vehicle(&self, vehicle: &str, reason: &str) -> Result<()>;
}

/// Stopper that only logs; used until a real one is installed.
#[derive(Debug, Default)]
pub struct LoggingStopper;

#[async_trait]
impl VehicleStopper for LoggingStopper {
    async fn stop_vehicle(&self, vehicle: &str, reason: &str) -> Result<()> {
        tracing::error!(vehicle = %vehicle, reason = %reason, "Vehicle must stop");
        Ok(())
    }
}

/// What became of an inbound telegram.
#[derive(Debug, Clone)]
pub enum IncomingOutcome {
    /// Handed to a caller waiting for this reply.
    ReplyDelivered,
    /// Consumed as the acknowledgement of a retransmitted response.
    Acknowledged,
    /// Dispatched to a handler.
    Dispatched {
        response: Response,
        /// Result of applying the vehicle state, when the handler asked for it.
        position: Option<PositionOutcome>,
    },
}

/// Telegram dispatch engine.
pub struct Engine {
    config: EngineConfig,
    matcher: Arc<dyn ProtocolMatcher>,
    events: EventBus,
    replies: PendingReplyRegistry,
    router: Arc<DispatchRouter>,
    retransmit: RetransmissionQueue,
    coordinator: Arc<RequestResponseCoordinator>,
    actions: Arc<ActionRegistry>,
    directory: AdapterDirectory,
    factory: AdapterFactory,
    stopper: Arc<dyn VehicleStopper>,
}

impl Engine {
    /// Build an engine from configuration, with the built-in handlers bound.
    pub fn new(config: EngineConfig) -> Self {
        let matcher = config.matcher.build();
        let events = EventBus::new();
        let replies = PendingReplyRegistry::new();
        let router = Arc::new(DispatchRouter::new());
        router.bind_command(
            config.position_command.clone(),
            Arc::new(PositionReportHandler::new()),
        );
        router.bind_kind(
            RequestKind::Move,
            Arc::new(MoveTelegramHandler::new(config.move_command.clone())),
        );

        let retransmit =
            RetransmissionQueue::new(config.retransmit.clone()).with_event_bus(events.clone());
        let coordinator = Arc::new(RequestResponseCoordinator::new(
            router.clone(),
            retransmit.clone(),
            config.request_timeout(),
        ));
        let actions = Arc::new(ActionRegistry::new());
        let factory = AdapterFactory::new(
            &config,
            AdapterContext {
                matcher: matcher.clone(),
                coordinator: coordinator.clone(),
                actions: actions.clone(),
                replies: replies.clone(),
                events: events.clone(),
            },
        );

        Self {
            config,
            matcher,
            events,
            replies,
            router,
            retransmit,
            coordinator,
            actions,
            directory: AdapterDirectory::new(),
            factory,
            stopper: Arc::new(LoggingStopper),
        }
    }

    /// Install the emergency stop collaborator.
    pub fn with_stopper(mut self, stopper: Arc<dyn VehicleStopper>) -> Self {
        self.stopper = stopper;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn matcher(&self) -> &Arc<dyn ProtocolMatcher> {
        &self.matcher
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn replies(&self) -> &PendingReplyRegistry {
        &self.replies
    }

    /// Handler table, for binding application handlers.
    pub fn router(&self) -> &Arc<DispatchRouter> {
        &self.router
    }

    pub fn retransmit(&self) -> &RetransmissionQueue {
        &self.retransmit
    }

    pub fn coordinator(&self) -> &Arc<RequestResponseCoordinator> {
        &self.coordinator
    }

    pub fn directory(&self) -> &AdapterDirectory {
        &self.directory
    }

    pub fn register_action(&self, action: Arc<dyn LocationAction>) {
        self.actions.register(action);
    }

    /// Create and register the adapter for `vehicle` on `transport`.
    pub fn add_vehicle(
        &self,
        vehicle: &VehicleConfig,
        transport: DynTransport,
    ) -> Result<Arc<VehicleAdapter>> {
        let adapter = self.factory.create(vehicle, transport)?;
        self.directory.register(adapter.clone())?;
        Ok(adapter)
    }

    /// Start the retransmission ticker and enable every adapter.
    ///
    /// A vehicle that cannot be reached is left to its reconnect schedule.
    pub async fn start(&self) {
        self.retransmit.start().await;
        let adapters = self.directory.adapters();
        let results = futures::future::join_all(adapters.iter().map(|a| a.enable())).await;
        for (adapter, result) in adapters.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(vehicle = %adapter.name(), error = %e, "Vehicle not reachable at start");
            }
        }
        tracing::info!(vehicles = adapters.len(), "Engine started");
    }

    /// Disable every adapter and stop background tasks.
    pub async fn shutdown(&self) {
        for adapter in self.directory.adapters() {
            if let Err(e) = adapter.disable().await {
                tracing::warn!(vehicle = %adapter.name(), error = %e, "Error while disabling adapter");
            }
        }
        self.retransmit.stop().await;
        tracing::info!("Engine stopped");
    }

    /// Process one raw telegram received from a vehicle or station.
    pub async fn on_incoming_telegram(&self, raw: &str) -> Result<IncomingOutcome> {
        let protocol = self.matcher.decode(raw).map_err(|e| {
            tracing::warn!(error = %e, raw = %raw, "Dropping undecodable telegram");
            Error::from(e)
        })?;

        if self.replies.publish(protocol.clone()) {
            return Ok(IncomingOutcome::ReplyDelivered);
        }
        if self.retransmit.acknowledge_reply(&protocol).is_some() {
            return Ok(IncomingOutcome::Acknowledged);
        }

        let adapter = self.directory.get(&protocol.device_id);
        let request = Request::telegram(raw, protocol)
            .with_adapter_ref(adapter.as_ref().map(|a| a.sender_ref()));
        let initial = Response::for_request(&request);
        let response = self.coordinator.dispatch(request, initial).await;

        if !(response.is_ok() && response.needs_adapter_operation) {
            return Ok(IncomingOutcome::Dispatched {
                response,
                position: None,
            });
        }

        let adapter = adapter.ok_or_else(|| Error::VehicleNotFound(response.device_id.clone()))?;
        let state = response
            .vehicle_state
            .as_ref()
            .filter(|s| !s.position.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "response for {} carries no vehicle position",
                    response.device_id
                ))
            })?;

        match adapter.on_incoming_telegram(state) {
            Ok(outcome) => Ok(IncomingOutcome::Dispatched {
                response,
                position: Some(outcome),
            }),
            Err(e) if e.is_sequence_fault() => {
                self.stop_vehicle(adapter.name(), &e.to_string()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_vehicle(&self, vehicle: &str, reason: &str) {
        if let Err(e) = self.stopper.stop_vehicle(vehicle, reason).await {
            tracing::error!(vehicle = %vehicle, error = %e, "Stopping vehicle failed");
        }
        self.events.publish(
            EVENT_SOURCE,
            EngineEvent::VehicleStopped {
                vehicle: vehicle.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Hand a movement step to `vehicle`.
    pub fn send_command(&self, vehicle: &str, cmd: MovementCommand) -> Result<()> {
        self.directory.require(vehicle)?.enqueue(cmd);
        Ok(())
    }

    /// Whether `vehicle` may take `operations`.
    pub fn can_process<S: AsRef<str>>(&self, vehicle: &str, operations: &[S]) -> Result<ExplainedBool> {
        Ok(self.directory.require(vehicle)?.can_process(operations))
    }

    /// Dispatch a move request for `vehicle` with a JSON step list.
    pub async fn dispatch_move(&self, vehicle: &str, payload: impl Into<String>) -> Result<Response> {
        self.dispatch_synthetic(RequestKind::Move, vehicle, payload.into())
            .await
    }

    /// Dispatch a station action request for `vehicle`.
    pub async fn dispatch_action(
        &self,
        vehicle: &str,
        payload: impl Into<String>,
    ) -> Result<Response> {
        self.dispatch_synthetic(RequestKind::Action, vehicle, payload.into())
            .await
    }

    async fn dispatch_synthetic(
        &self,
        kind: RequestKind,
        vehicle: &str,
        payload: String,
    ) -> Result<Response> {
        let adapter = self.directory.require(vehicle)?;
        let request =
            Request::synthetic(kind, vehicle, payload).with_adapter_ref(Some(adapter.sender_ref()));
        let initial = Response::for_request(&request);
        Ok(self.coordinator.dispatch(request, initial).await)
    }

    /// Send `response` to `device` and wait for the reply with the same code.
    pub async fn send_and_wait(
        &self,
        device: &str,
        response: &Response,
        timeout: Duration,
    ) -> Result<Protocol> {
        let adapter = self.directory.require(device)?;
        self.replies
            .request(adapter.as_ref(), response, timeout)
            .await
    }
}

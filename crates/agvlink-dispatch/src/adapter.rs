//! Per-vehicle communication adapter.
//!
//! The adapter owns everything the engine knows about one vehicle: its command
//! queues, its process model and its link. It is the [`TelegramSender`] every
//! response for the vehicle goes through.

use std::sync::{Arc, Weak};
use std::time::Duration;

use agvlink_commands::{
    can_process, CommandQueueSequencer, ExplainedBool, LoadState, MovementCommand, PositionOutcome,
};
use agvlink_core::{
    DynTransport, EngineEvent, Error, EventBus, OperatingState, PendingReplyRegistry,
    ProtocolMatcher, ReconnectConfig, Request, RequestKind, Response, Result, TelegramSender,
    VehicleStateReport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::actions::{run_supervised, ActionContext, ActionOutcome, ActionRegistry};
use crate::coordinator::RequestResponseCoordinator;
use crate::factory::VehicleProperties;
use crate::supervisor::ConnectionSupervisor;

const EVENT_SOURCE: &str = "adapter";

/// Adapter behaviour settings.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Period of the move requester.
    pub move_flush_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub disconnect_on_idle: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            move_flush_interval: Duration::from_millis(agvlink_core::config::defaults::MOVE_FLUSH_INTERVAL_MS),
            reconnect: ReconnectConfig::default(),
            disconnect_on_idle: false,
        }
    }
}

/// Snapshot of what the adapter knows about its vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub position: Option<String>,
    pub operating_state: OperatingState,
    pub load_state: LoadState,
    pub idle: bool,
    pub connected: bool,
    /// Movement is held back until the running station action finishes.
    pub single_step: bool,
    pub enabled: bool,
}

impl Default for ProcessModel {
    fn default() -> Self {
        Self {
            position: None,
            operating_state: OperatingState::Unknown,
            load_state: LoadState::Unknown,
            idle: true,
            connected: false,
            single_step: false,
            enabled: false,
        }
    }
}

/// Shared collaborators every adapter needs.
#[derive(Clone)]
pub struct AdapterContext {
    pub matcher: Arc<dyn ProtocolMatcher>,
    pub coordinator: Arc<RequestResponseCoordinator>,
    pub actions: Arc<ActionRegistry>,
    pub replies: PendingReplyRegistry,
    pub events: EventBus,
}

/// Communication adapter for one vehicle.
pub struct VehicleAdapter {
    properties: VehicleProperties,
    settings: AdapterSettings,
    sequencer: CommandQueueSequencer,
    model: Mutex<ProcessModel>,
    transport: DynTransport,
    supervisor: ConnectionSupervisor,
    ctx: AdapterContext,
    move_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<VehicleAdapter>,
}

impl VehicleAdapter {
    /// Create a new adapter. It starts disabled and disconnected.
    pub fn new(
        properties: VehicleProperties,
        settings: AdapterSettings,
        transport: DynTransport,
        ctx: AdapterContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            sequencer: CommandQueueSequencer::new(properties.name.clone()),
            supervisor: ConnectionSupervisor::new(
                properties.name.clone(),
                settings.reconnect.clone(),
                ctx.events.clone(),
            ),
            properties,
            settings,
            model: Mutex::new(ProcessModel::default()),
            transport,
            ctx,
            move_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn properties(&self) -> &VehicleProperties {
        &self.properties
    }

    pub fn sequencer(&self) -> &CommandQueueSequencer {
        &self.sequencer
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Weak sender handle for requests and retry entries.
    pub fn sender_ref(&self) -> Weak<dyn TelegramSender> {
        self.weak_self.clone()
    }

    /// Current process model.
    pub fn model(&self) -> ProcessModel {
        let mut model = self.model.lock().clone();
        model.idle = self.sequencer.is_idle();
        model
    }

    pub fn is_enabled(&self) -> bool {
        self.model.lock().enabled
    }

    pub fn is_connected(&self) -> bool {
        self.model.lock().connected && self.transport.is_connected()
    }

    pub fn set_load_state(&self, load_state: LoadState) {
        self.model.lock().load_state = load_state;
    }

    fn publish(&self, event: EngineEvent) {
        self.ctx.events.publish(EVENT_SOURCE, event);
    }

    // ----- lifecycle -------------------------------------------------------

    /// Enable the adapter, connect and start the move requester.
    pub async fn enable(&self) -> Result<()> {
        {
            let mut model = self.model.lock();
            if model.enabled {
                return Ok(());
            }
            model.enabled = true;
        }
        tracing::info!(vehicle = %self.name(), "Adapter enabled");
        self.start_move_requester();
        self.connect().await
    }

    /// Disable the adapter and drop the link.
    pub async fn disable(&self) -> Result<()> {
        self.model.lock().enabled = false;
        self.supervisor.cancel();
        tracing::info!(vehicle = %self.name(), "Adapter disabled");
        self.disconnect().await
    }

    /// Open the link to the configured address.
    pub async fn connect(&self) -> Result<()> {
        match self
            .transport
            .connect(&self.properties.host, self.properties.port)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    vehicle = %self.name(),
                    address = %self.properties.address(),
                    "Vehicle connected"
                );
                self.on_connect();
                Ok(())
            }
            Err(e) => {
                tracing::error!(vehicle = %self.name(), error = %e, "Connecting vehicle failed");
                self.on_failed_connection_attempt();
                Err(e)
            }
        }
    }

    /// Close the link and drop every outstanding command.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_move_requester();
        self.sequencer.clear();
        self.model.lock().connected = false;
        self.transport.disconnect().await?;
        tracing::info!(vehicle = %self.name(), "Vehicle disconnected");
        Ok(())
    }

    pub fn on_connect(&self) {
        if !self.is_enabled() {
            return;
        }
        self.model.lock().connected = true;
        self.supervisor.on_connected();
        self.start_move_requester();
        self.publish(EngineEvent::LinkConnected {
            vehicle: self.name().to_string(),
        });
    }

    pub fn on_failed_connection_attempt(&self) {
        if !self.is_enabled() {
            return;
        }
        self.model.lock().connected = false;
        self.schedule_reconnect();
    }

    /// The link dropped underneath the adapter.
    pub fn on_disconnect(&self) {
        tracing::debug!(vehicle = %self.name(), "Vehicle link lost");
        {
            let mut model = self.model.lock();
            model.connected = false;
            model.operating_state = OperatingState::Unknown;
        }
        self.sequencer.set_idle(true);
        self.publish(EngineEvent::LinkDisconnected {
            vehicle: self.name().to_string(),
        });
        if self.is_enabled() {
            self.schedule_reconnect();
        }
    }

    /// The vehicle went idle.
    pub async fn on_idle(&self) -> Result<()> {
        self.sequencer.set_idle(true);
        // A step enqueued meanwhile keeps the link up.
        if self.is_enabled() && self.settings.disconnect_on_idle && self.sequencer.is_drained() {
            tracing::debug!(vehicle = %self.name(), "Disconnecting idle vehicle");
            self.disconnect().await?;
        }
        Ok(())
    }

    /// Run the idle hook once every step has been executed.
    fn notify_if_idle(&self) {
        if !self.sequencer.is_drained() {
            return;
        }
        self.sequencer.set_idle(true);
        let Some(adapter) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = adapter.on_idle().await {
                tracing::warn!(vehicle = %adapter.name(), error = %e, "Idle handling failed");
            }
        });
    }

    fn schedule_reconnect(&self) {
        let weak = self.weak_self.clone();
        self.supervisor.schedule(move || async move {
            if let Some(adapter) = weak.upgrade() {
                if adapter.is_enabled() {
                    let _ = adapter.connect().await;
                }
            }
        });
    }

    // ----- orchestrator side -----------------------------------------------

    /// Hand a movement step to the vehicle.
    ///
    /// A vehicle dropped for being idle is reconnected.
    pub fn enqueue(&self, cmd: MovementCommand) {
        self.sequencer.enqueue(cmd);
        if !self.settings.disconnect_on_idle
            || !self.is_enabled()
            || self.is_connected()
            || self.supervisor.is_scheduled()
        {
            return;
        }
        if let Some(adapter) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                let _ = adapter.connect().await;
            });
        }
    }

    /// Whether the vehicle may take `operations`.
    pub fn can_process<S: AsRef<str>>(&self, operations: &[S]) -> ExplainedBool {
        if !self.is_enabled() {
            return ExplainedBool::rejected("communication adapter is not enabled");
        }
        if !self.is_connected() {
            return ExplainedBool::rejected("vehicle is not connected");
        }
        can_process(self.model.lock().load_state, operations)
    }

    // ----- vehicle side ----------------------------------------------------

    /// Apply a state report coming from the vehicle.
    pub fn on_incoming_telegram(&self, report: &VehicleStateReport) -> Result<PositionOutcome> {
        let position = report.position.trim();
        if position.is_empty() {
            return Err(Error::InvalidState(format!(
                "vehicle {} reported an empty position",
                self.name()
            )));
        }

        let outcome = self.sequencer.on_position_report(position).map_err(|e| {
            tracing::error!(vehicle = %self.name(), expected = %e.expected, reported = %e.reported, "Position report out of sequence");
            self.publish(EngineEvent::SequenceMismatch {
                vehicle: e.vehicle.clone(),
                expected: e.expected.clone(),
                reported: e.reported.clone(),
            });
            Error::from(e)
        })?;

        {
            let mut model = self.model.lock();
            model.position = Some(position.to_string());
            model.operating_state = report.operating_state;
        }

        match &outcome {
            PositionOutcome::Advanced(cmd) => {
                tracing::info!(vehicle = %self.name(), destination = %cmd.destination_point, "Movement step executed");
                self.publish(EngineEvent::CommandExecuted {
                    vehicle: self.name().to_string(),
                    command_id: cmd.id.clone(),
                    destination: cmd.destination_point.clone(),
                });
            }
            PositionOutcome::ActionRequired(cmd) => self.execute_location_action(cmd.clone())?,
            PositionOutcome::Confirmed(_) | PositionOutcome::Untracked => {}
        }
        if matches!(outcome, PositionOutcome::Advanced(_)) {
            self.notify_if_idle();
        }
        Ok(outcome)
    }

    fn execute_location_action(&self, cmd: MovementCommand) -> Result<()> {
        let operation = cmd.operation.clone();
        let action = match self.ctx.actions.get(&operation) {
            Ok(action) => action,
            Err(e) => {
                self.fail_action(&operation, &e.to_string());
                return Err(e);
            }
        };
        if !self.is_enabled() {
            tracing::error!(vehicle = %self.name(), operation = %operation, "Adapter not enabled, station action skipped");
            self.sequencer.abort_action();
            return Ok(());
        }
        let Some(adapter) = self.weak_self.upgrade() else {
            self.sequencer.abort_action();
            return Ok(());
        };

        {
            let mut model = self.model.lock();
            model.operating_state = OperatingState::Executing;
            model.single_step = true;
        }
        self.publish(EngineEvent::ActionStarted {
            vehicle: self.name().to_string(),
            operation: operation.clone(),
        });

        let sender: Arc<dyn TelegramSender> = adapter.clone();
        let ctx = ActionContext::new(cmd, sender, self.ctx.replies.clone());
        tokio::spawn(async move {
            match run_supervised(action, ctx).await {
                ActionOutcome::Completed => adapter.execute_next_move_cmd(&operation),
                ActionOutcome::Failed(error) => adapter.fail_action(&operation, &error),
            }
        });
        Ok(())
    }

    /// The station action finished: release the vehicle for the next order.
    pub fn execute_next_move_cmd(&self, operation: &str) {
        {
            let mut model = self.model.lock();
            model.operating_state = OperatingState::Idle;
            model.single_step = false;
            model.load_state = model.load_state.after_operation(operation);
        }
        if let Some(cmd) = self.sequencer.advance() {
            self.publish(EngineEvent::CommandExecuted {
                vehicle: self.name().to_string(),
                command_id: cmd.id.clone(),
                destination: cmd.destination_point.clone(),
            });
        }
        self.publish(EngineEvent::ActionCompleted {
            vehicle: self.name().to_string(),
            operation: operation.to_string(),
        });
        self.notify_if_idle();
    }

    fn fail_action(&self, operation: &str, error: &str) {
        self.sequencer.abort_action();
        {
            let mut model = self.model.lock();
            model.operating_state = OperatingState::Error;
            model.single_step = false;
        }
        self.publish(EngineEvent::ActionFailed {
            vehicle: self.name().to_string(),
            operation: operation.to_string(),
            error: error.to_string(),
        });
        self.notify_if_idle();
    }

    // ----- move requester --------------------------------------------------

    /// Send every unsent movement step as one move request.
    ///
    /// Nothing is sent while a station action holds the vehicle or the link
    /// is down. Steps of a rejected move request are put back for the next
    /// flush.
    pub async fn flush_moves(&self) -> Option<Response> {
        {
            let model = self.model.lock();
            if model.single_step || !model.connected {
                return None;
            }
        }
        let commands = self.sequencer.take_unsent();
        if commands.is_empty() {
            return None;
        }

        let payload = match serde_json::to_string(&commands) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(vehicle = %self.name(), error = %e, "Cannot encode move request");
                self.sequencer.requeue_unsent(commands);
                return None;
            }
        };
        let request = Request::synthetic(RequestKind::Move, self.name(), payload)
            .with_adapter_ref(Some(self.sender_ref()));
        let initial = Response::for_request(&request);
        let response = self.ctx.coordinator.dispatch(request, initial).await;
        if !response.is_ok() {
            tracing::warn!(
                vehicle = %self.name(),
                status = response.status,
                error = %response.payload,
                steps = commands.len(),
                "Move request failed, steps kept for the next flush"
            );
            self.sequencer.requeue_unsent(commands);
        }
        Some(response)
    }

    fn start_move_requester(&self) {
        let mut task = self.move_task.lock();
        if task.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        let period = self.settings.move_flush_interval;
        *task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let Some(adapter) = weak.upgrade() else {
                    break;
                };
                adapter.flush_moves().await;
            }
        }));
    }

    fn stop_move_requester(&self) {
        if let Some(task) = self.move_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for VehicleAdapter {
    fn drop(&mut self) {
        self.stop_move_requester();
    }
}

#[async_trait]
impl TelegramSender for VehicleAdapter {
    fn name(&self) -> &str {
        &self.properties.name
    }

    async fn send_telegram(&self, response: &Response) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected(self.name().to_string()));
        }
        let line = self.ctx.matcher.encode(response);
        tracing::debug!(vehicle = %self.name(), code = %response.code, line = %line, "Sending telegram");
        self.transport.send(&line).await
    }
}

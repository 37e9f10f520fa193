//! Station actions run when a vehicle reaches the end of a drive order.

use std::sync::Arc;
use std::time::Duration;

use agvlink_commands::MovementCommand;
use agvlink_core::{Error, PendingReplyRegistry, Protocol, Response, Result, TelegramSender};
use async_trait::async_trait;
use dashmap::DashMap;

/// What an action gets to work with.
#[derive(Clone)]
pub struct ActionContext {
    pub vehicle: String,
    pub operation: String,
    /// Final movement step that triggered the action.
    pub command: MovementCommand,
    sender: Arc<dyn TelegramSender>,
    replies: PendingReplyRegistry,
}

impl ActionContext {
    pub fn new(
        command: MovementCommand,
        sender: Arc<dyn TelegramSender>,
        replies: PendingReplyRegistry,
    ) -> Self {
        Self {
            vehicle: sender.name().to_string(),
            operation: command.operation.clone(),
            command,
            sender,
            replies,
        }
    }

    /// Write a telegram to the vehicle.
    pub async fn send(&self, response: &Response) -> Result<()> {
        self.sender.send_telegram(response).await
    }

    /// Write a telegram and wait for the reply with the same code.
    pub async fn send_and_wait(&self, response: &Response, timeout: Duration) -> Result<Protocol> {
        self.replies
            .request(self.sender.as_ref(), response, timeout)
            .await
    }
}

/// A named station action.
#[async_trait]
pub trait LocationAction: Send + Sync {
    /// Operation label this action serves.
    fn name(&self) -> &str;

    async fn execute(&self, ctx: ActionContext) -> anyhow::Result<()>;
}

/// Action table, keyed by lowercased operation label.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, Arc<dyn LocationAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action; a previous action with the same name is replaced.
    pub fn register(&self, action: Arc<dyn LocationAction>) {
        let key = action.name().to_ascii_lowercase();
        tracing::debug!(action = %action.name(), "Station action registered");
        self.actions.insert(key, action);
    }

    /// Look up an action by operation label, ignoring case.
    pub fn get(&self, operation: &str) -> Result<Arc<dyn LocationAction>> {
        self.actions
            .get(&operation.to_ascii_lowercase())
            .map(|a| a.value().clone())
            .ok_or_else(|| Error::UnknownAction(operation.to_string()))
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.actions.contains_key(&operation.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.value().name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// How a supervised action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    Failed(String),
}

/// Run `action` in its own task so a panic is reported as a failure.
pub async fn run_supervised(action: Arc<dyn LocationAction>, ctx: ActionContext) -> ActionOutcome {
    let vehicle = ctx.vehicle.clone();
    let operation = ctx.operation.clone();
    tracing::info!(vehicle = %vehicle, operation = %operation, "Station action started");

    let outcome = match tokio::spawn(async move { action.execute(ctx).await }).await {
        Ok(Ok(())) => ActionOutcome::Completed,
        Ok(Err(e)) => ActionOutcome::Failed(format!("{:#}", e)),
        Err(join_err) => ActionOutcome::Failed(format!("action panicked: {}", join_err)),
    };

    match &outcome {
        ActionOutcome::Completed => {
            tracing::info!(vehicle = %vehicle, operation = %operation, "Station action completed")
        }
        ActionOutcome::Failed(error) => {
            tracing::error!(vehicle = %vehicle, operation = %operation, error = %error, "Station action failed")
        }
    }
    outcome
}

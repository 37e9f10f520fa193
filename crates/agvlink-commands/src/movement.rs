//! Movement commands handed over by the orchestrator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation label meaning "no station action".
pub const NO_OPERATION: &str = "NOP";

/// One step of a drive order.
///
/// Two commands with the same points and operation are still different
/// commands; equality includes the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementCommand {
    pub id: String,
    /// Point the vehicle drives from.
    pub source_point: String,
    /// Point the vehicle drives to.
    pub destination_point: String,
    /// Station action to run at the destination.
    #[serde(default)]
    pub operation: String,
    /// Last step of the drive order.
    #[serde(default)]
    pub final_movement: bool,
}

impl MovementCommand {
    /// Create a new movement step without an operation.
    pub fn new(source_point: impl Into<String>, destination_point: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_point: source_point.into(),
            destination_point: destination_point.into(),
            operation: String::new(),
            final_movement: false,
        }
    }

    /// Set the operation label.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Mark as the final step of the order.
    pub fn as_final(mut self) -> Self {
        self.final_movement = true;
        self
    }

    /// Whether the step carries a real operation.
    pub fn has_operation(&self) -> bool {
        let op = self.operation.trim();
        !op.is_empty() && !op.eq_ignore_ascii_case(NO_OPERATION)
    }

    /// A station action must run when the vehicle reaches this step.
    pub fn needs_action(&self) -> bool {
        self.final_movement && self.has_operation()
    }
}

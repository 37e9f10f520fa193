//! Engine events.
//!
//! Anything the orchestrator needs to observe about a vehicle is published
//! as an [`EngineEvent`].

use serde::{Deserialize, Serialize};

/// Observable engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A movement step was confirmed by the vehicle; the order advanced.
    CommandExecuted {
        vehicle: String,
        command_id: String,
        destination: String,
    },
    /// A position report contradicted the command queue.
    SequenceMismatch {
        vehicle: String,
        expected: String,
        reported: String,
    },
    /// The stop collaborator was asked to halt the vehicle.
    VehicleStopped { vehicle: String, reason: String },
    /// A station action started on the vehicle.
    ActionStarted { vehicle: String, operation: String },
    /// A station action finished successfully.
    ActionCompleted { vehicle: String, operation: String },
    /// A station action failed.
    ActionFailed {
        vehicle: String,
        operation: String,
        error: String,
    },
    /// A response could not be delivered.
    DeliveryExhausted {
        device_id: String,
        code: String,
        attempts: u32,
    },
    /// The vehicle link is up.
    LinkConnected { vehicle: String },
    /// The vehicle link went down.
    LinkDisconnected { vehicle: String },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        vehicle: String,
        delay_ms: u64,
        attempt: u32,
    },
}

impl EngineEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::CommandExecuted { .. } => "CommandExecuted",
            EngineEvent::SequenceMismatch { .. } => "SequenceMismatch",
            EngineEvent::VehicleStopped { .. } => "VehicleStopped",
            EngineEvent::ActionStarted { .. } => "ActionStarted",
            EngineEvent::ActionCompleted { .. } => "ActionCompleted",
            EngineEvent::ActionFailed { .. } => "ActionFailed",
            EngineEvent::DeliveryExhausted { .. } => "DeliveryExhausted",
            EngineEvent::LinkConnected { .. } => "LinkConnected",
            EngineEvent::LinkDisconnected { .. } => "LinkDisconnected",
            EngineEvent::ReconnectScheduled { .. } => "ReconnectScheduled",
        }
    }

    /// Vehicle or device the event concerns.
    pub fn subject(&self) -> &str {
        match self {
            EngineEvent::CommandExecuted { vehicle, .. }
            | EngineEvent::SequenceMismatch { vehicle, .. }
            | EngineEvent::VehicleStopped { vehicle, .. }
            | EngineEvent::ActionStarted { vehicle, .. }
            | EngineEvent::ActionCompleted { vehicle, .. }
            | EngineEvent::ActionFailed { vehicle, .. }
            | EngineEvent::LinkConnected { vehicle }
            | EngineEvent::LinkDisconnected { vehicle }
            | EngineEvent::ReconnectScheduled { vehicle, .. } => vehicle,
            EngineEvent::DeliveryExhausted { device_id, .. } => device_id,
        }
    }

    /// Faults the orchestrator must react to.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            EngineEvent::SequenceMismatch { .. }
                | EngineEvent::ActionFailed { .. }
                | EngineEvent::DeliveryExhausted { .. }
        )
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    /// Component that published the event.
    pub source: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

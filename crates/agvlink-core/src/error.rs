//! Error types for the telegram engine.
//!
//! Every failure that can cross a component boundary is expressed here so that
//! callers match on an explicit kind instead of catching a generic fault.

use std::time::Duration;

use crate::message::status;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// A raw telegram could not be turned into a protocol record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Nothing but whitespace was received.
    #[error("Telegram is empty")]
    Empty,

    /// The telegram is not wrapped in the configured frame markers.
    #[error("Telegram is not framed by `{prefix}`..`{suffix}`")]
    Unframed { prefix: String, suffix: String },

    /// Fewer fields than the wire format requires.
    #[error("Malformed telegram: expected at least {expected} fields, found {found}")]
    MissingFields { expected: usize, found: usize },

    /// A mandatory field is present but blank.
    #[error("Telegram field `{0}` is empty")]
    EmptyField(&'static str),

    /// The status field is not an integer.
    #[error("Invalid status code: {0}")]
    InvalidStatus(String),

    /// JSON telegram could not be parsed.
    #[error("Invalid JSON telegram: {0}")]
    Json(String),
}

/// A position report contradicts the head of the vehicle's command queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Vehicle {vehicle} reported position {reported}, but the next commanded step starts at {expected}")]
pub struct SequenceMismatchError {
    /// Vehicle name.
    pub vehicle: String,
    /// Source point of the queue head.
    pub expected: String,
    /// Position the vehicle reported.
    pub reported: String,
}

/// A response could not be delivered within the configured attempts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Delivery to {device_id} (code {code}) exhausted after {attempts} attempts")]
pub struct DeliveryExhaustedError {
    pub device_id: String,
    pub code: String,
    pub attempts: u32,
}

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("No handler bound for {0}")]
    NoHandler(String),

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error(transparent)]
    SequenceMismatch(#[from] SequenceMismatchError),

    #[error(transparent)]
    DeliveryExhausted(#[from] DeliveryExhaustedError),

    #[error("Request {0} is already being dispatched")]
    AlreadyDispatching(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Vehicle not found: {0}")]
    VehicleNotFound(String),

    #[error("Vehicle {0} is not connected")]
    NotConnected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown station action: {0}")]
    UnknownAction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Status code reported in a fabricated error response.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NoHandler(_) | Error::VehicleNotFound(_) | Error::UnknownAction(_) => {
                status::NOT_FOUND
            }
            Error::AlreadyDispatching(_) => status::CONFLICT,
            Error::Decode(_) => status::BAD_REQUEST,
            _ => status::INTERNAL_ERROR,
        }
    }

    /// Whether this error must trigger an emergency stop of the vehicle.
    pub fn is_sequence_fault(&self) -> bool {
        matches!(self, Error::SequenceMismatch(_))
    }
}

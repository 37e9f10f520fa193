//! Core types for the AGV telegram engine.
//!
//! Provides:
//! - Protocol records and pluggable telegram matchers
//! - Request and response envelopes
//! - Pending reply correlation
//! - Engine events and the broadcast event bus
//! - Configuration loading

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod message;
pub mod pending;
pub mod protocol;
pub mod transport;

pub use config::{
    ChannelType, EngineConfig, MatcherConfig, ReconnectConfig, RetransmitConfig, VehicleConfig,
};
pub use error::{DecodeError, DeliveryExhaustedError, Error, Result, SequenceMismatchError};
pub use event::{EngineEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver};
pub use message::{
    status, OperatingState, Request, RequestId, RequestKind, Response, VehicleStateReport,
};
pub use pending::{PendingReplyRegistry, ReplyWaiter};
pub use protocol::{DelimitedMatcher, JsonMatcher, Protocol, ProtocolMatcher};
pub use transport::{DynTransport, LinkTransport, TelegramSender};

/// Commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{env_vars, EngineConfig, VehicleConfig};

    // Error handling
    pub use crate::error::{Error, Result};

    // Wire
    pub use crate::message::{Request, RequestKind, Response};
    pub use crate::protocol::{Protocol, ProtocolMatcher};
    pub use crate::transport::{LinkTransport, TelegramSender};

    // Events
    pub use crate::event::EngineEvent;
    pub use crate::eventbus::EventBus;
}

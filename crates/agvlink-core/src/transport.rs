//! Transport seams.
//!
//! The engine never touches sockets. It talks to a vehicle through a
//! [`TelegramSender`] (one per vehicle adapter) and an adapter talks to its
//! link through a [`LinkTransport`].
//!
//! ```text
//! Coordinator ──Response──▶ TelegramSender ──line──▶ LinkTransport ──▶ vehicle
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Response;

/// Something that can deliver a response to a vehicle.
#[async_trait]
pub trait TelegramSender: Send + Sync {
    /// Name of the vehicle this sender belongs to.
    fn name(&self) -> &str;

    /// Encode and write a response to the vehicle.
    async fn send_telegram(&self, response: &Response) -> Result<()>;
}

/// Line-oriented link to a single vehicle.
///
/// Implementations only move bytes; framing beyond "one telegram per line"
/// is the matcher's business.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Open the link to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<()>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is currently open.
    fn is_connected(&self) -> bool;

    /// Write one telegram.
    async fn send(&self, line: &str) -> Result<()>;
}

/// Shared transport handle.
pub type DynTransport = Arc<dyn LinkTransport>;

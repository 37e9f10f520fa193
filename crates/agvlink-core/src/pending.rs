//! Correlation of inbound replies to outstanding queries.
//!
//! A caller that sends a query to a vehicle first [`register`]s the query's
//! correlation code, then writes the query, then awaits the reply on the
//! returned [`ReplyWaiter`]. Because registration happens before the query
//! leaves, a reply can never arrive "too early": it is queued on the code's
//! channel until a waiter consumes it.
//!
//! Telegrams whose code is not registered are not retained; [`publish`]
//! returns `false` and the engine routes them to a handler instead.
//!
//! [`register`]: PendingReplyRegistry::register
//! [`publish`]: PendingReplyRegistry::publish

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::message::Response;
use crate::protocol::Protocol;
use crate::transport::TelegramSender;

struct Slot {
    tx: mpsc::UnboundedSender<Protocol>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Protocol>>>,
    waiters: usize,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            waiters: 0,
        }
    }
}

/// Process-wide table of correlation code → queued replies.
#[derive(Clone, Default)]
pub struct PendingReplyRegistry {
    slots: Arc<DashMap<String, Slot>>,
}

impl PendingReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in replies carrying `code`.
    ///
    /// Several waiters may register the same code; each reply wakes exactly
    /// one of them, in the order they started waiting.
    pub fn register(&self, code: impl Into<String>) -> ReplyWaiter {
        let code = code.into();
        let rx = {
            let mut slot = self.slots.entry(code.clone()).or_insert_with(Slot::new);
            slot.waiters += 1;
            slot.rx.clone()
        };
        tracing::trace!(code = %code, "Reply waiter registered");
        ReplyWaiter {
            code,
            rx,
            slots: self.slots.clone(),
        }
    }

    /// Hand `protocol` to the waiter registered for its code.
    ///
    /// Returns `false` when nobody is waiting for that code.
    pub fn publish(&self, protocol: Protocol) -> bool {
        match self.slots.get(&protocol.code) {
            Some(slot) => {
                let code = protocol.code.clone();
                let delivered = slot.tx.send(protocol).is_ok();
                tracing::debug!(code = %code, delivered, "Reply published to waiter");
                delivered
            }
            None => false,
        }
    }

    /// Register `code` and wait for the first reply.
    ///
    /// Only safe when the reply cannot be produced before this call; otherwise
    /// call [`register`](Self::register) before sending the query.
    pub async fn wait_for(&self, code: impl Into<String>, timeout: Duration) -> Result<Protocol> {
        self.register(code).recv(timeout).await
    }

    /// Send `response` through `sender` and wait for the reply carrying its code.
    ///
    /// The waiter is registered before the telegram is written.
    pub async fn request(
        &self,
        sender: &dyn TelegramSender,
        response: &Response,
        timeout: Duration,
    ) -> Result<Protocol> {
        let waiter = self.register(response.code.clone());
        sender.send_telegram(response).await?;
        waiter.recv(timeout).await
    }

    /// Whether any waiter is registered for `code`.
    pub fn is_registered(&self, code: &str) -> bool {
        self.slots.contains_key(code)
    }

    /// Number of codes with at least one waiter.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Registration handle for one correlation code.
///
/// Dropping the last handle for a code removes the registration together with
/// any reply nobody consumed.
pub struct ReplyWaiter {
    code: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Protocol>>>,
    slots: Arc<DashMap<String, Slot>>,
}

impl ReplyWaiter {
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Wait up to `timeout` for the next reply.
    pub async fn recv(&self, timeout: Duration) -> Result<Protocol> {
        let next = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(timeout, next).await {
            Ok(Some(protocol)) => Ok(protocol),
            Ok(None) => Err(Error::InvalidState(format!(
                "reply channel for code {} closed",
                self.code
            ))),
            Err(_) => {
                tracing::warn!(code = %self.code, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for reply");
                Err(Error::Timeout(timeout))
            }
        }
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        let removed = self.slots.remove_if_mut(&self.code, |_, slot| {
            slot.waiters = slot.waiters.saturating_sub(1);
            slot.waiters == 0
        });
        if removed.is_some() {
            tracing::trace!(code = %self.code, "Reply registration removed");
        }
    }
}

//! Request routing.
//!
//! Telegrams are routed by (device id, command key), falling back to a binding
//! for the command on any device. Synthetic requests are routed by kind.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use agvlink_core::{Error, Request, RequestKind, Response, Result};
use async_trait::async_trait;
use dashmap::DashMap;

/// Device id matching every device.
pub const ANY_DEVICE: &str = "*";

/// Request handler.
///
/// Receives the request and a blank OK response bound to it, and returns the
/// response to send back.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request, response: Response) -> Result<Response>;
}

/// Handler built from an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn handle(&self, request: Request, response: Response) -> Result<Response> {
        (self.0)(request, response).await
    }
}

/// Routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Telegram {
        device_id: String,
        command_key: String,
    },
    Kind(RequestKind),
}

impl RouteKey {
    pub fn telegram(device_id: impl Into<String>, command_key: impl Into<String>) -> Self {
        RouteKey::Telegram {
            device_id: device_id.into(),
            command_key: command_key.into(),
        }
    }

    /// Binding for `command_key` on any device.
    pub fn command(command_key: impl Into<String>) -> Self {
        Self::telegram(ANY_DEVICE, command_key)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Telegram {
                device_id,
                command_key,
            } => write!(f, "{}/{}", device_id, command_key),
            RouteKey::Kind(kind) => write!(f, "{}", kind),
        }
    }
}

/// Handler table.
#[derive(Default)]
pub struct DispatchRouter {
    routes: DashMap<RouteKey, Arc<dyn Handler>>,
}

impl DispatchRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `key`, replacing any previous binding.
    pub fn bind(&self, key: RouteKey, handler: Arc<dyn Handler>) {
        tracing::debug!(route = %key, "Handler bound");
        self.routes.insert(key, handler);
    }

    pub fn bind_telegram(
        &self,
        device_id: impl Into<String>,
        command_key: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        self.bind(RouteKey::telegram(device_id, command_key), handler);
    }

    pub fn bind_command(&self, command_key: impl Into<String>, handler: Arc<dyn Handler>) {
        self.bind(RouteKey::command(command_key), handler);
    }

    pub fn bind_kind(&self, kind: RequestKind, handler: Arc<dyn Handler>) {
        self.bind(RouteKey::Kind(kind), handler);
    }

    pub fn unbind(&self, key: &RouteKey) -> bool {
        self.routes.remove(key).is_some()
    }

    /// Resolve the handler owning `request`.
    pub fn route(&self, request: &Request) -> Result<Arc<dyn Handler>> {
        let found = match (&request.protocol, request.kind) {
            (Some(protocol), _) => self
                .routes
                .get(&RouteKey::telegram(
                    protocol.device_id.as_str(),
                    protocol.command_key.as_str(),
                ))
                .or_else(|| {
                    self.routes
                        .get(&RouteKey::command(protocol.command_key.as_str()))
                }),
            (None, kind) => self.routes.get(&RouteKey::Kind(kind)),
        };

        match found {
            Some(handler) => Ok(handler.value().clone()),
            None => {
                let label = format!("{}/{}", request.device_id(), request.command_key());
                tracing::warn!(route = %label, request_id = %request.id, "No handler bound");
                Err(Error::NoHandler(label))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

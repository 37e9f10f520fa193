//! Bounded dispatch of requests to handlers.
//!
//! Every handler runs in its own task while the caller waits at most the
//! configured timeout. A handler that overruns keeps running; its late result
//! is discarded and the request id stays blocked until the task ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agvlink_commands::RetransmissionQueue;
use agvlink_core::{status, Error, Request, RequestId, Response};
use dashmap::DashMap;

use crate::router::DispatchRouter;

/// Removes a request id from the in-flight table when dropped.
struct InFlightGuard {
    table: Arc<DashMap<RequestId, Instant>>,
    id: RequestId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Runs requests through the router with a timeout and applies the
/// post-dispatch effects.
pub struct RequestResponseCoordinator {
    router: Arc<DispatchRouter>,
    retransmit: RetransmissionQueue,
    timeout: Duration,
    in_flight: Arc<DashMap<RequestId, Instant>>,
}

impl RequestResponseCoordinator {
    /// Create a new coordinator.
    pub fn new(router: Arc<DispatchRouter>, retransmit: RetransmissionQueue, timeout: Duration) -> Self {
        Self {
            router,
            retransmit,
            timeout,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn router(&self) -> &Arc<DispatchRouter> {
        &self.router
    }

    pub fn retransmit(&self) -> &RetransmissionQueue {
        &self.retransmit
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a handler for `id` is still running.
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Dispatch `request`, starting from `initial`.
    ///
    /// Never fails: routing errors, timeouts, handler errors and panics all
    /// come back as error responses.
    pub async fn dispatch(&self, request: Request, initial: Response) -> Response {
        let guard = match self.in_flight.entry(request.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                let err = Error::AlreadyDispatching(request.id.clone());
                tracing::warn!(request_id = %request.id, "{}", err);
                return Response::error(&request, err.status_code(), err.to_string());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                InFlightGuard {
                    table: self.in_flight.clone(),
                    id: request.id.clone(),
                }
            }
        };

        let handler = match self.router.route(&request) {
            Ok(handler) => handler,
            Err(err) => {
                drop(guard);
                return Response::error(&request, err.status_code(), err.to_string());
            }
        };

        let task_request = request.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            handler.handle(task_request, initial).await
        });

        let response = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(err))) => {
                tracing::error!(
                    request_id = %request.id,
                    device = %request.device_id(),
                    command = %request.command_key(),
                    error = %err,
                    "Handler failed"
                );
                return Response::error(&request, status::INTERNAL_ERROR, err.to_string());
            }
            Ok(Err(join_err)) => {
                let err = Error::Handler(format!("handler panicked: {}", join_err));
                tracing::error!(request_id = %request.id, command = %request.command_key(), "{}", err);
                return Response::error(&request, status::INTERNAL_ERROR, err.to_string());
            }
            Err(_) => {
                let err = Error::Timeout(self.timeout);
                tracing::warn!(
                    request_id = %request.id,
                    device = %request.device_id(),
                    command = %request.command_key(),
                    "Dispatch timed out; handler left running"
                );
                return Response::error(&request, status::INTERNAL_ERROR, err.to_string());
            }
        };

        if response.is_ok() && response.is_response_to(&request) && response.needs_send {
            self.deliver(&request, &response).await;
        }
        response
    }

    async fn deliver(&self, request: &Request, response: &Response) {
        let (Some(adapter), Some(adapter_ref)) = (request.adapter(), request.adapter_ref()) else {
            tracing::warn!(
                request_id = %request.id,
                device = %response.device_id,
                "Response needs sending but the request has no live adapter"
            );
            return;
        };

        self.retransmit
            .add_answering(response.clone(), request.protocol.clone(), adapter_ref);
        if let Err(e) = adapter.send_telegram(response).await {
            tracing::warn!(
                device = %response.device_id,
                code = %response.code,
                error = %e,
                "Initial send failed, left to retransmission"
            );
        }
    }
}

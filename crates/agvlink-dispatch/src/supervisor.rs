//! Reconnect scheduling for a vehicle link.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agvlink_core::{EngineEvent, EventBus, ReconnectConfig};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

type Scheduled = Arc<Mutex<Option<(u64, JoinHandle<()>)>>>;

/// Owns the pending reconnect of one vehicle.
///
/// At most one reconnect is scheduled at a time; scheduling again replaces it,
/// and a successful connect cancels it.
pub struct ConnectionSupervisor {
    vehicle: String,
    config: ReconnectConfig,
    attempts: AtomicU32,
    generation: AtomicU64,
    scheduled: Scheduled,
    events: EventBus,
}

impl ConnectionSupervisor {
    /// Create a new supervisor.
    pub fn new(vehicle: impl Into<String>, config: ReconnectConfig, events: EventBus) -> Self {
        Self {
            vehicle: vehicle.into(),
            config,
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            scheduled: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Consecutive reconnects scheduled since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.lock().is_some()
    }

    /// Run `reconnect` after the backoff delay of the next attempt.
    ///
    /// Returns the delay, or `None` when reconnecting is disabled.
    pub fn schedule<F, Fut>(&self, reconnect: F) -> Option<Duration>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.config.enabled {
            return None;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.config.delay_for_attempt(attempt);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // The slot stays locked until the new handle is stored, so the task
        // always finds its own generation.
        let mut slot = self.scheduled.lock();
        let own_slot = self.scheduled.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = own_slot.lock();
                match slot.as_ref() {
                    Some((current, _)) if *current == generation => {
                        slot.take();
                    }
                    _ => return,
                }
            }
            reconnect().await;
        });
        if let Some((_, previous)) = slot.replace((generation, handle)) {
            previous.abort();
        }
        drop(slot);

        tracing::info!(
            vehicle = %self.vehicle,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.events.publish(
            "supervisor",
            EngineEvent::ReconnectScheduled {
                vehicle: self.vehicle.clone(),
                delay_ms: delay.as_millis() as u64,
                attempt,
            },
        );
        Some(delay)
    }

    /// Cancel a pending reconnect. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.scheduled.lock().take() {
            Some((_, handle)) => {
                handle.abort();
                tracing::debug!(vehicle = %self.vehicle, "Scheduled reconnect cancelled");
                true
            }
            None => false,
        }
    }

    /// The link is up: cancel any pending reconnect and reset the backoff.
    pub fn on_connected(&self) {
        self.cancel();
        self.attempts.store(0, Ordering::Relaxed);
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.cancel();
    }
}

//! Broadcast event bus.
//!
//! All components publish to one bus; the orchestrator and the CLI subscribe.

use tokio::sync::broadcast;

use crate::event::{EngineEvent, EventMetadata};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Event bus backed by a broadcast channel.
///
/// Slow subscribers may miss events; publishing never blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(EngineEvent, EventMetadata)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event from `source`.
    ///
    /// Returns `true` if at least one subscriber received it.
    pub fn publish(&self, source: &str, event: EngineEvent) -> bool {
        tracing::trace!(source, event = event.type_name(), "Publishing engine event");
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(EngineEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once the bus is closed. Lagging is tolerated: missed
    /// events are skipped.
    pub async fn recv(&mut self) -> Option<(EngineEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(EngineEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some((event, _)) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(
            "test",
            EngineEvent::LinkConnected {
                vehicle: "agv-1".to_string()
            }
        ));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "LinkConnected");
        assert_eq!(event.subject(), "agv-1");
        assert_eq!(meta.source, "test");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.publish(
            "test",
            EngineEvent::LinkDisconnected {
                vehicle: "agv-1".to_string()
            }
        ));
    }

    #[test]
    fn test_drain() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.publish(
                "test",
                EngineEvent::ReconnectScheduled {
                    vehicle: "agv-1".to_string(),
                    delay_ms: 100,
                    attempt: i,
                },
            );
        }
        assert_eq!(rx.drain().len(), 3);
        assert!(rx.try_recv().is_none());
    }
}

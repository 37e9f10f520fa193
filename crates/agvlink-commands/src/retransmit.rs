//! Guaranteed delivery of responses to vehicles.
//!
//! Responses that must reach a vehicle are parked here after the first send
//! and re-sent at a fixed interval until the vehicle acknowledges them or the
//! attempts run out.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use agvlink_core::config::RetransmitConfig;
use agvlink_core::{
    DeliveryExhaustedError, EngineEvent, EventBus, Protocol, Response, TelegramSender,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Entry key: device id and correlation code.
pub type RetryKey = (String, String);

/// A response awaiting acknowledgement.
#[derive(Clone)]
pub struct RetryEntry {
    pub response: Response,
    /// Retries performed so far; the initial send is not counted.
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Instant,
    pub queued_at: DateTime<Utc>,
    /// Inbound telegram the response answers, if any.
    pub origin: Option<Protocol>,
    sender: Weak<dyn TelegramSender>,
}

impl RetryEntry {
    fn new(
        response: Response,
        origin: Option<Protocol>,
        sender: Weak<dyn TelegramSender>,
        config: &RetransmitConfig,
    ) -> Self {
        Self {
            response,
            origin,
            attempts: 0,
            max_attempts: config.max_attempts,
            next_retry_at: Instant::now() + config.interval(),
            queued_at: Utc::now(),
            sender,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_retry_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether `reply` confirms delivery of this entry.
    ///
    /// A failure status is a rejection, and a repeat of the telegram the
    /// response answered means the vehicle never saw the response.
    pub fn is_acknowledged_by(&self, reply: &Protocol) -> bool {
        if !reply.is_success() {
            return false;
        }
        match &self.origin {
            Some(origin) => {
                !(origin.command_key == reply.command_key
                    && origin.payload == reply.payload
                    && origin.status == reply.status)
            }
            None => true,
        }
    }

    fn key(&self) -> RetryKey {
        (self.response.device_id.clone(), self.response.code.clone())
    }
}

impl std::fmt::Debug for RetryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEntry")
            .field("device_id", &self.response.device_id)
            .field("code", &self.response.code)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

/// Retry queue shared by every vehicle.
#[derive(Clone)]
pub struct RetransmissionQueue {
    entries: Arc<DashMap<RetryKey, RetryEntry>>,
    config: RetransmitConfig,
    events: Option<EventBus>,
    running: Arc<RwLock<bool>>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl RetransmissionQueue {
    /// Create a new retransmission queue.
    pub fn new(config: RetransmitConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
            events: None,
            running: Arc::new(RwLock::new(false)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Publish exhausted deliveries on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &RetransmitConfig {
        &self.config
    }

    /// Park `response` for retransmission through `sender`.
    ///
    /// An entry with the same device and code is replaced.
    pub fn add(&self, response: Response, sender: Weak<dyn TelegramSender>) {
        self.add_answering(response, None, sender);
    }

    /// Like [`add`](Self::add), remembering the inbound telegram `response`
    /// answers so a repeat of it is not taken for the acknowledgement.
    pub fn add_answering(
        &self,
        response: Response,
        origin: Option<Protocol>,
        sender: Weak<dyn TelegramSender>,
    ) {
        let entry = RetryEntry::new(response, origin, sender, &self.config);
        let key = entry.key();
        tracing::debug!(device = %key.0, code = %key.1, "Response queued for retransmission");
        if self.entries.insert(key.clone(), entry).is_some() {
            tracing::debug!(device = %key.0, code = %key.1, "Replaced pending retransmission");
        }
    }

    /// Mark the response for (`device_id`, `code`) as delivered.
    ///
    /// Returns the removed entry; a second call for the same key returns `None`.
    pub fn acknowledge(&self, device_id: &str, code: &str) -> Option<RetryEntry> {
        let removed = self
            .entries
            .remove(&(device_id.to_string(), code.to_string()))
            .map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            tracing::debug!(
                device = %device_id,
                code = %code,
                attempts = entry.attempts,
                "Retransmission acknowledged"
            );
        }
        removed
    }

    /// Treat `reply` as the acknowledgement of the entry with its device and
    /// code, if it confirms delivery.
    ///
    /// Rejections and repeats of the answered telegram leave the entry in
    /// place and return `None`.
    pub fn acknowledge_reply(&self, reply: &Protocol) -> Option<RetryEntry> {
        let key = (reply.device_id.clone(), reply.code.clone());
        let removed = self
            .entries
            .remove_if(&key, |_, entry| entry.is_acknowledged_by(reply))
            .map(|(_, entry)| entry);
        match &removed {
            Some(entry) => tracing::debug!(
                device = %reply.device_id,
                code = %reply.code,
                attempts = entry.attempts,
                "Retransmission acknowledged"
            ),
            None if self.entries.contains_key(&key) => tracing::debug!(
                device = %reply.device_id,
                code = %reply.code,
                status = reply.status,
                "Telegram does not acknowledge pending retransmission"
            ),
            None => {}
        }
        removed
    }

    pub fn contains(&self, device_id: &str, code: &str) -> bool {
        self.entries
            .contains_key(&(device_id.to_string(), code.to_string()))
    }

    /// Retries performed for a pending entry.
    pub fn attempts(&self, device_id: &str, code: &str) -> Option<u32> {
        self.entries
            .get(&(device_id.to_string(), code.to_string()))
            .map(|e| e.attempts)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one retry pass now.
    pub async fn tick(&self) -> Vec<DeliveryExhaustedError> {
        self.tick_at(Instant::now()).await
    }

    /// Run one retry pass as if the clock read `now`.
    ///
    /// Due entries are re-sent; entries out of attempts, or whose sender is
    /// gone, are dropped and returned.
    pub async fn tick_at(&self, now: Instant) -> Vec<DeliveryExhaustedError> {
        let interval = self.config.interval();
        let mut exhausted = Vec::new();
        let mut resend = Vec::new();

        self.entries.retain(|key, entry| {
            if !entry.is_due(now) {
                return true;
            }
            let sender = entry.sender.upgrade();
            if entry.is_exhausted() || sender.is_none() {
                exhausted.push(DeliveryExhaustedError {
                    device_id: key.0.clone(),
                    code: key.1.clone(),
                    attempts: entry.attempts,
                });
                return false;
            }
            entry.attempts += 1;
            entry.next_retry_at = now + interval;
            if let Some(sender) = sender {
                resend.push((sender, entry.response.clone(), entry.attempts));
            }
            true
        });

        for (sender, response, attempt) in resend {
            tracing::debug!(
                device = %response.device_id,
                code = %response.code,
                attempt,
                "Retransmitting response"
            );
            if let Err(e) = sender.send_telegram(&response).await {
                tracing::warn!(
                    device = %response.device_id,
                    code = %response.code,
                    attempt,
                    error = %e,
                    "Retransmission failed"
                );
            }
        }

        for err in &exhausted {
            tracing::error!(
                device = %err.device_id,
                code = %err.code,
                attempts = err.attempts,
                "{}",
                err
            );
            if let Some(bus) = &self.events {
                bus.publish(
                    "retransmit",
                    EngineEvent::DeliveryExhausted {
                        device_id: err.device_id.clone(),
                        code: err.code.clone(),
                        attempts: err.attempts,
                    },
                );
            }
        }
        exhausted
    }

    /// Start the background ticker.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let queue = self.clone();
        let running_flag = self.running.clone();
        let period = self.config.interval().min(Duration::from_millis(250));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                if !*running_flag.read().await {
                    break;
                }
                interval.tick().await;
                queue.tick().await;
            }
        });

        *self.task_handle.write().await = Some(handle);
    }

    /// Stop the background ticker.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        let handle = self.task_handle.write().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agvlink_core::{Protocol, Request};
    use parking_lot::Mutex;

    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TelegramSender for RecordingSender {
        fn name(&self) -> &str {
            "agv-1"
        }

        async fn send_telegram(&self, response: &Response) -> agvlink_core::Result<()> {
            self.sent.lock().push(response.code.clone());
            Ok(())
        }
    }

    fn make_response(code: &str) -> Response {
        let request = Request::telegram("raw", Protocol::new("agv-1", "rptpos", code));
        Response::for_request(&request).send("ack")
    }

    fn make_sender() -> Arc<dyn TelegramSender> {
        Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn config(max_attempts: u32) -> RetransmitConfig {
        RetransmitConfig {
            max_attempts,
            interval_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_acknowledge_succeeds_once() {
        let queue = RetransmissionQueue::new(config(3));
        let sender = make_sender();
        queue.add(make_response("1"), Arc::downgrade(&sender));

        assert!(queue.acknowledge("agv-1", "1").is_some());
        assert!(queue.acknowledge("agv-1", "1").is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_replaces_same_key() {
        let queue = RetransmissionQueue::new(config(3));
        let sender = make_sender();
        queue.add(make_response("1"), Arc::downgrade(&sender));
        queue.add(make_response("1"), Arc::downgrade(&sender));
        queue.add(make_response("2"), Arc::downgrade(&sender));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_not_due_entries_are_kept() {
        let queue = RetransmissionQueue::new(config(3));
        let sender = make_sender();
        queue.add(make_response("1"), Arc::downgrade(&sender));

        assert!(queue.tick_at(Instant::now()).await.is_empty());
        assert_eq!(queue.attempts("agv-1", "1"), Some(0));
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let queue = RetransmissionQueue::new(config(2)).with_event_bus(bus);
        let sender = make_sender();
        queue.add(make_response("9"), Arc::downgrade(&sender));

        let mut now = Instant::now();
        for attempt in 1..=2 {
            now += Duration::from_millis(150);
            assert!(queue.tick_at(now).await.is_empty());
            assert_eq!(queue.attempts("agv-1", "9"), Some(attempt));
        }

        now += Duration::from_millis(150);
        let exhausted = queue.tick_at(now).await;
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].attempts, 2);
        assert!(queue.is_empty());

        let events = rx.drain();
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::DeliveryExhausted { code, .. }] if code == "9"
        ));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_reported() {
        let queue = RetransmissionQueue::new(config(3));
        let sender = make_sender();
        queue.add(make_response("1"), Arc::downgrade(&sender));
        drop(sender);

        let exhausted = queue
            .tick_at(Instant::now() + Duration::from_millis(150))
            .await;
        assert_eq!(exhausted.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let queue = RetransmissionQueue::new(config(3));
        queue.start().await;
        assert!(queue.is_running().await);
        queue.stop().await;
        assert!(!queue.is_running().await);
    }

    #[tokio::test]
    async fn test_reply_must_confirm_delivery() {
        let queue = RetransmissionQueue::new(config(3));
        let sender = make_sender();
        let origin = Protocol::new("agv-1", "rptpos", "4").with_payload("A");
        let request = Request::telegram("agv-1,rptpos,4,0,A", origin.clone());
        let response = Response::for_request(&request).send("A");
        queue.add_answering(response, Some(origin.clone()), Arc::downgrade(&sender));

        // The vehicle repeats its report: our response never arrived.
        assert!(queue.acknowledge_reply(&origin).is_none());
        // A rejection is not a delivery either.
        let nak = Protocol::new("agv-1", "rptpos", "4").with_status(500);
        assert!(queue.acknowledge_reply(&nak).is_none());
        assert!(queue.contains("agv-1", "4"));

        let ack = Protocol::new("agv-1", "rptpos", "4");
        assert!(queue.acknowledge_reply(&ack).is_some());
        assert!(queue.acknowledge_reply(&ack).is_none());
        assert!(queue.is_empty());
    }
}

//! Recording fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agvlink_core::{
    EngineConfig, EngineEvent, Error, EventBusReceiver, LinkTransport, Response, Result,
    TelegramSender, VehicleConfig,
};
use agvlink_dispatch::VehicleStopper;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Link that records every written line.
#[derive(Default)]
pub struct RecordingTransport {
    connected: AtomicBool,
    failing_connects: AtomicU32,
    connects: AtomicU32,
    lines: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Simulate the peer closing the link.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[async_trait]
impl LinkTransport for RecordingTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Transport(format!("connection refused by {}:{}", host, port)));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, line: &str) -> Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

/// Sender that records responses without any link.
pub struct RecordingSender {
    name: String,
    sent: Mutex<Vec<Response>>,
}

impl RecordingSender {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Response> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl TelegramSender for RecordingSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_telegram(&self, response: &Response) -> Result<()> {
        self.sent.lock().push(response.clone());
        Ok(())
    }
}

/// Stopper that records stop requests.
#[derive(Default)]
pub struct RecordingStopper {
    stops: Mutex<Vec<(String, String)>>,
}

impl RecordingStopper {
    pub fn stops(&self) -> Vec<(String, String)> {
        self.stops.lock().clone()
    }
}

#[async_trait]
impl VehicleStopper for RecordingStopper {
    async fn stop_vehicle(&self, vehicle: &str, reason: &str) -> Result<()> {
        self.stops.lock().push((vehicle.to_string(), reason.to_string()));
        Ok(())
    }
}

/// Helper to create a test vehicle configuration.
pub fn make_vehicle(name: &str) -> VehicleConfig {
    VehicleConfig {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 6000,
        device_address: None,
    }
}

/// Engine configuration with timers suited to tests.
pub fn make_config() -> EngineConfig {
    let mut config = EngineConfig {
        request_timeout_ms: 200,
        move_flush_interval_ms: 60_000,
        ..Default::default()
    };
    config.retransmit.interval_ms = 60_000;
    config.reconnect.delay_ms = 10;
    config.reconnect.max_delay_ms = 20;
    config
}

/// Wait until an event matching `pred` arrives.
pub async fn wait_for_event<F>(rx: &mut EventBusReceiver, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Some((event, _)) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("event not received in time")
}

/// Poll `cond` until it holds.
pub async fn wait_until<F>(cond: F)
where
    F: Fn() -> bool,
{
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("condition not reached in time")
}

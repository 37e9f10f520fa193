//! Socket links to vehicles.
//!
//! Every link forwards what it reads as [`LinkEvent`]s on its vehicle's
//! channel; a per-vehicle worker feeds lines into the engine and reports closed
//! links back to the owning adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agvlink_core::{ChannelType, DynTransport, Error, LinkTransport, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest datagram accepted on a UDP link.
const MAX_DATAGRAM: usize = 8192;

/// Longest telegram line accepted on a TCP link, newline included.
const MAX_LINE: usize = 8192;

/// Something a link observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One non-empty telegram line.
    Line { vehicle: String, line: String },
    /// The peer closed the link or reading failed.
    Closed { vehicle: String },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Build the link for `vehicle` according to the configured channel.
pub fn open_link(channel: ChannelType, vehicle: &str, events: LinkEventSender) -> DynTransport {
    match channel {
        ChannelType::Tcp => Arc::new(TcpLineTransport::new(vehicle, events)),
        ChannelType::Udp => Arc::new(UdpLineTransport::new(vehicle, events)),
    }
}

/// State shared by both link flavours.
struct LinkState {
    vehicle: String,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: LinkEventSender,
}

impl LinkState {
    fn new(vehicle: &str, events: LinkEventSender) -> Self {
        Self {
            vehicle: vehicle.to_string(),
            connected: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            events,
        }
    }

    fn set_reader(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Forward one raw line, skipping blank ones.
fn forward_line(vehicle: &str, raw: &str, events: &LinkEventSender) -> bool {
    let line = raw.trim();
    if line.is_empty() {
        tracing::debug!(vehicle = %vehicle, "Ignoring empty telegram");
        return true;
    }
    events
        .send(LinkEvent::Line {
            vehicle: vehicle.to_string(),
            line: line.to_string(),
        })
        .is_ok()
}

/// Read one newline terminated line of at most `max` bytes into `buf`.
///
/// Returns `Ok(false)` at end of stream. An overlong line is discarded up to
/// its newline and comes back as an empty `buf`.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(max as u64).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') || n < max {
        return Ok(true);
    }
    let mut dropped = n;
    let mut rest = Vec::new();
    loop {
        rest.clear();
        let n = (&mut *reader).take(max as u64).read_until(b'\n', &mut rest).await?;
        dropped += n;
        if n == 0 || rest.last() == Some(&b'\n') {
            break;
        }
    }
    tracing::warn!(bytes = dropped, max, "Dropping overlong telegram line");
    buf.clear();
    Ok(true)
}

fn link_closed(vehicle: String, connected: &AtomicBool, events: &LinkEventSender) {
    // A link already marked down was closed on purpose.
    if connected.swap(false, Ordering::SeqCst) {
        let _ = events.send(LinkEvent::Closed { vehicle });
    }
}

/// Newline framed TCP link.
pub struct TcpLineTransport {
    state: LinkState,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl TcpLineTransport {
    pub fn new(vehicle: &str, events: LinkEventSender) -> Self {
        Self {
            state: LinkState::new(vehicle, events),
            writer: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl LinkTransport for TcpLineTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Transport(format!("connect {}:{}: {}", host, port, e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.state.connected.store(true, Ordering::SeqCst);

        let vehicle = self.state.vehicle.clone();
        let connected = self.state.connected.clone();
        let events = self.state.events.clone();
        self.state.set_reader(tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut buf = Vec::with_capacity(256);
            loop {
                match read_line_capped(&mut reader, &mut buf, MAX_LINE).await {
                    Ok(true) => {
                        let line = String::from_utf8_lossy(&buf);
                        if !forward_line(&vehicle, &line, &events) {
                            break;
                        }
                    }
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(vehicle = %vehicle, error = %e, "Reading from vehicle failed");
                        break;
                    }
                }
            }
            link_closed(vehicle, &connected, &events);
        }));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.stop_reader();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.state.vehicle.clone()))?;
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        writer
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// UDP link; each datagram may carry several newline separated telegrams.
pub struct UdpLineTransport {
    state: LinkState,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpLineTransport {
    pub fn new(vehicle: &str, events: LinkEventSender) -> Self {
        Self {
            state: LinkState::new(vehicle, events),
            socket: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LinkTransport for UdpLineTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        socket
            .connect((host, port))
            .await
            .map_err(|e| Error::Transport(format!("connect {}:{}: {}", host, port, e)))?;
        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());
        self.state.connected.store(true, Ordering::SeqCst);

        let vehicle = self.state.vehicle.clone();
        let connected = self.state.connected.clone();
        let events = self.state.events.clone();
        self.state.set_reader(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        if !text.lines().all(|line| forward_line(&vehicle, line, &events)) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(vehicle = %vehicle, error = %e, "Receiving from vehicle failed");
                        break;
                    }
                }
            }
            link_closed(vehicle, &connected, &events);
        }));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.stop_reader();
        self.socket.lock().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, line: &str) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| Error::NotConnected(self.state.vehicle.clone()))?;
        socket
            .send(line.as_bytes())
            .await
            .map(|_| ())
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

//! Request and response envelopes.
//!
//! A [`Request`] wraps either a decoded telegram or a synthetic order coming
//! from the orchestrator. Handlers turn it into a [`Response`], which may have
//! to be written back to the vehicle and may carry a vehicle state snapshot.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Protocol;
use crate::transport::TelegramSender;

/// Response status codes.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL_ERROR: u16 = 500;
}

/// Unique request identifier.
pub type RequestId = String;

/// Origin of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Decoded telegram received from a vehicle or station.
    Telegram,
    /// Movement order issued by the orchestrator.
    Move,
    /// Station action issued by the orchestrator.
    Action,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Telegram => "telegram",
            RequestKind::Move => "move",
            RequestKind::Action => "action",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound unit of work for the dispatcher.
#[derive(Clone)]
pub struct Request {
    /// Unique id, used to correlate the response.
    pub id: RequestId,
    pub kind: RequestKind,
    /// Decoded telegram, absent for synthetic requests.
    pub protocol: Option<Protocol>,
    /// Original wire line.
    pub raw_content: Option<String>,
    /// Target vehicle for synthetic requests.
    pub target: Option<String>,
    /// Body of synthetic requests.
    pub payload: Option<String>,
    adapter: Option<Weak<dyn TelegramSender>>,
}

impl Request {
    /// Request built from a received telegram.
    pub fn telegram(raw: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: RequestKind::Telegram,
            protocol: Some(protocol),
            raw_content: Some(raw.into()),
            target: None,
            payload: None,
            adapter: None,
        }
    }

    /// Synthetic move or action request for a vehicle.
    pub fn synthetic(kind: RequestKind, target: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            protocol: None,
            raw_content: None,
            target: Some(target.into()),
            payload: Some(payload.into()),
            adapter: None,
        }
    }

    /// Attach the adapter that should receive the eventual response.
    ///
    /// Only a weak reference is kept; the request never keeps an adapter alive.
    pub fn with_adapter(mut self, adapter: &Arc<dyn TelegramSender>) -> Self {
        self.adapter = Some(Arc::downgrade(adapter));
        self
    }

    /// Attach an already downgraded adapter reference.
    pub fn with_adapter_ref(mut self, adapter: Option<Weak<dyn TelegramSender>>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Upgrade the adapter reference, if the adapter is still alive.
    pub fn adapter(&self) -> Option<Arc<dyn TelegramSender>> {
        self.adapter.as_ref().and_then(Weak::upgrade)
    }

    /// Weak adapter reference, for handing to long-lived structures.
    pub fn adapter_ref(&self) -> Option<Weak<dyn TelegramSender>> {
        self.adapter.clone()
    }

    /// Device the request concerns.
    pub fn device_id(&self) -> &str {
        match (&self.protocol, &self.target) {
            (Some(p), _) => &p.device_id,
            (None, Some(t)) => t,
            (None, None) => "",
        }
    }

    /// Routing label used in logs and error messages.
    pub fn command_key(&self) -> &str {
        match &self.protocol {
            Some(p) => &p.command_key,
            None => self.kind.as_str(),
        }
    }

    /// Correlation code of the underlying telegram, or the request id.
    pub fn code(&self) -> &str {
        match &self.protocol {
            Some(p) => &p.code,
            None => &self.id,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("protocol", &self.protocol)
            .field("raw_content", &self.raw_content)
            .field("target", &self.target)
            .field("payload", &self.payload)
            .field("has_adapter", &self.adapter.is_some())
            .finish()
    }
}

/// Operating state reported by a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingState {
    #[default]
    Unknown,
    Idle,
    Executing,
    Charging,
    Error,
    Unavailable,
}

impl FromStr for OperatingState {
    type Err = std::convert::Infallible;

    /// Lenient: anything unrecognised maps to `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "idle" => OperatingState::Idle,
            "executing" | "working" | "moving" => OperatingState::Executing,
            "charging" => OperatingState::Charging,
            "error" => OperatingState::Error,
            "unavailable" => OperatingState::Unavailable,
            _ => OperatingState::Unknown,
        })
    }
}

/// Vehicle state carried by a response that must update the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleStateReport {
    /// Point the vehicle currently stands on.
    pub position: String,
    #[serde(default)]
    pub operating_state: OperatingState,
}

impl VehicleStateReport {
    pub fn new(position: impl Into<String>, operating_state: OperatingState) -> Self {
        Self {
            position: position.into(),
            operating_state,
        }
    }
}

/// Result of dispatching a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Unique response id.
    pub id: String,
    /// Id of the request that produced this response.
    pub request_id: RequestId,
    pub device_id: String,
    pub command_key: String,
    /// Correlation code echoed back to the vehicle.
    pub code: String,
    pub status: u16,
    pub payload: String,
    /// Must be written back to the vehicle link.
    pub needs_send: bool,
    /// Must be applied to the vehicle's adapter.
    pub needs_adapter_operation: bool,
    pub vehicle_state: Option<VehicleStateReport>,
}

impl Response {
    /// Blank OK response bound to `request`.
    pub fn for_request(request: &Request) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            device_id: request.device_id().to_string(),
            command_key: request.command_key().to_string(),
            code: request.code().to_string(),
            status: status::OK,
            payload: String::new(),
            needs_send: false,
            needs_adapter_operation: false,
            vehicle_state: None,
        }
    }

    /// Error response bound to `request`.
    pub fn error(request: &Request, status: u16, message: impl Into<String>) -> Self {
        let mut response = Self::for_request(request);
        response.status = status;
        response.payload = message.into();
        response
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    /// Whether this response was produced for `request`.
    pub fn is_response_to(&self, request: &Request) -> bool {
        self.request_id == request.id
    }

    /// Replace the payload.
    pub fn write(&mut self, payload: impl Into<String>) {
        self.payload = payload.into();
    }

    /// Mark as failed with a message.
    pub fn fail(&mut self, status: u16, message: impl Into<String>) {
        self.status = status;
        self.payload = message.into();
    }

    /// Builder: set payload and mark for sending.
    pub fn send(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self.needs_send = true;
        self
    }

    /// Builder: attach a vehicle state to be applied to the adapter.
    pub fn with_vehicle_state(mut self, state: VehicleStateReport) -> Self {
        self.vehicle_state = Some(state);
        self.needs_adapter_operation = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_correlates_to_request() {
        let request = Request::telegram("agv-1,rptpos,7,0,A", Protocol::new("agv-1", "rptpos", "7"));
        let other = Request::telegram("agv-1,rptpos,8,0,A", Protocol::new("agv-1", "rptpos", "8"));
        let response = Response::for_request(&request);

        assert!(response.is_ok());
        assert!(response.is_response_to(&request));
        assert!(!response.is_response_to(&other));
        assert_eq!(response.device_id, "agv-1");
        assert_eq!(response.code, "7");
        assert!(!response.needs_send);
    }

    #[test]
    fn test_synthetic_request_fields() {
        let request = Request::synthetic(RequestKind::Move, "agv-2", "[]");
        assert!(request.protocol.is_none());
        assert_eq!(request.device_id(), "agv-2");
        assert_eq!(request.command_key(), "move");
        assert_eq!(request.code(), request.id);
        assert!(request.adapter().is_none());
    }

    #[test]
    fn test_response_builders() {
        let request = Request::synthetic(RequestKind::Action, "agv-1", "Load");
        let response = Response::for_request(&request)
            .send("ok")
            .with_vehicle_state(VehicleStateReport::new("A", OperatingState::Idle));
        assert!(response.needs_send);
        assert!(response.needs_adapter_operation);
        assert_eq!(response.payload, "ok");

        let error = Response::error(&request, status::INTERNAL_ERROR, "boom");
        assert!(!error.is_ok());
        assert_eq!(error.payload, "boom");
    }

    #[test]
    fn test_operating_state_parse() {
        assert_eq!("IDLE".parse::<OperatingState>().unwrap(), OperatingState::Idle);
        assert_eq!("moving".parse::<OperatingState>().unwrap(), OperatingState::Executing);
        assert_eq!("???".parse::<OperatingState>().unwrap(), OperatingState::Unknown);
    }
}

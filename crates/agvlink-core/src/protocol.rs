//! Protocol records and the pluggable telegram codec.
//!
//! A telegram is one line of wire traffic exchanged with a vehicle or a
//! station. The engine only cares about its decoded shape, [`Protocol`];
//! how the bytes look is decided by a [`ProtocolMatcher`] implementation.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::message::{status, Response};

/// Decoded form of a single telegram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Vehicle or station identifier.
    pub device_id: String,
    /// Command verb, e.g. `rptpos` or `setrout`.
    pub command_key: String,
    /// Correlation code linking a query to its reply.
    pub code: String,
    /// Status reported by the sender.
    #[serde(default)]
    pub status: i32,
    /// Command-specific body.
    #[serde(default)]
    pub payload: String,
}

impl Protocol {
    /// Create a protocol record with an empty payload and status 0.
    pub fn new(
        device_id: impl Into<String>,
        command_key: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            command_key: command_key.into(),
            code: code.into(),
            status: 0,
            payload: String::new(),
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    /// Whether the sender reported success (`0` or `200`).
    pub fn is_success(&self) -> bool {
        self.status == 0 || self.status == i32::from(status::OK)
    }
}

/// Telegram codec.
///
/// Implementations must be stateless: the engine calls them concurrently from
/// every vehicle link.
pub trait ProtocolMatcher: Send + Sync {
    /// Decode one raw telegram.
    fn decode(&self, raw: &str) -> Result<Protocol, DecodeError>;

    /// Render a response as an outbound telegram.
    fn encode(&self, response: &Response) -> String;
}

/// Separator-delimited line format.
///
/// `[prefix]device,command,code,status[,payload][suffix]`. Everything after
/// the fourth separator belongs to the payload, so payloads may contain the
/// separator themselves.
#[derive(Debug, Clone)]
pub struct DelimitedMatcher {
    separator: char,
    prefix: String,
    suffix: String,
}

impl DelimitedMatcher {
    const MIN_FIELDS: usize = 4;

    /// Unframed matcher with the given separator.
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            prefix: String::new(),
            suffix: String::new(),
        }
    }

    /// Require every telegram to be wrapped in `prefix`..`suffix`.
    pub fn with_frame(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.suffix = suffix.into();
        self
    }

    fn unframe<'a>(&self, raw: &'a str) -> Result<&'a str, DecodeError> {
        raw.strip_prefix(self.prefix.as_str())
            .and_then(|s| s.strip_suffix(self.suffix.as_str()))
            .ok_or_else(|| DecodeError::Unframed {
                prefix: self.prefix.clone(),
                suffix: self.suffix.clone(),
            })
    }
}

impl Default for DelimitedMatcher {
    fn default() -> Self {
        Self::new(',')
    }
}

impl ProtocolMatcher for DelimitedMatcher {
    fn decode(&self, raw: &str) -> Result<Protocol, DecodeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        let body = self.unframe(raw)?;

        let fields: Vec<&str> = body.splitn(Self::MIN_FIELDS + 1, self.separator).collect();
        if fields.len() < Self::MIN_FIELDS {
            return Err(DecodeError::MissingFields {
                expected: Self::MIN_FIELDS,
                found: fields.len(),
            });
        }

        let device_id = fields[0].trim();
        if device_id.is_empty() {
            return Err(DecodeError::EmptyField("device_id"));
        }
        let command_key = fields[1].trim();
        if command_key.is_empty() {
            return Err(DecodeError::EmptyField("command_key"));
        }
        let code = fields[2].trim();
        if code.is_empty() {
            return Err(DecodeError::EmptyField("code"));
        }
        let status = fields[3]
            .trim()
            .parse::<i32>()
            .map_err(|_| DecodeError::InvalidStatus(fields[3].to_string()))?;

        Ok(Protocol {
            device_id: device_id.to_string(),
            command_key: command_key.to_string(),
            code: code.to_string(),
            status,
            payload: fields.get(4).copied().unwrap_or_default().to_string(),
        })
    }

    fn encode(&self, response: &Response) -> String {
        let sep = self.separator;
        format!(
            "{}{}{sep}{}{sep}{}{sep}{}{sep}{}{}",
            self.prefix,
            response.device_id,
            response.command_key,
            response.code,
            response.status,
            response.payload,
            self.suffix,
        )
    }
}

/// One JSON object per line.
#[derive(Debug, Clone, Default)]
pub struct JsonMatcher;

impl ProtocolMatcher for JsonMatcher {
    fn decode(&self, raw: &str) -> Result<Protocol, DecodeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        let protocol: Protocol =
            serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
        if protocol.device_id.is_empty() {
            return Err(DecodeError::EmptyField("device_id"));
        }
        if protocol.command_key.is_empty() {
            return Err(DecodeError::EmptyField("command_key"));
        }
        if protocol.code.is_empty() {
            return Err(DecodeError::EmptyField("code"));
        }
        Ok(protocol)
    }

    fn encode(&self, response: &Response) -> String {
        serde_json::json!({
            "deviceId": response.device_id,
            "commandKey": response.command_key,
            "code": response.code,
            "status": response.status,
            "payload": response.payload,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimited_decode() {
        let matcher = DelimitedMatcher::default();
        let protocol = matcher.decode("agv-1,rptpos,0007,200,A").unwrap();

        assert_eq!(protocol.device_id, "agv-1");
        assert_eq!(protocol.command_key, "rptpos");
        assert_eq!(protocol.code, "0007");
        assert_eq!(protocol.status, 200);
        assert_eq!(protocol.payload, "A");
    }

    #[test]
    fn test_delimited_payload_keeps_separators() {
        let matcher = DelimitedMatcher::default();
        let protocol = matcher.decode("agv-1,setrout,12,0,A,B,C").unwrap();
        assert_eq!(protocol.payload, "A,B,C");
    }

    #[test]
    fn test_delimited_payload_optional() {
        let matcher = DelimitedMatcher::default();
        let protocol = matcher.decode("agv-1,ping,1,0").unwrap();
        assert!(protocol.payload.is_empty());
    }

    #[test]
    fn test_delimited_rejects_malformed() {
        let matcher = DelimitedMatcher::default();
        assert_eq!(matcher.decode("   "), Err(DecodeError::Empty));
        assert_eq!(
            matcher.decode("agv-1,rptpos"),
            Err(DecodeError::MissingFields {
                expected: 4,
                found: 2
            })
        );
        assert_eq!(
            matcher.decode(",rptpos,1,0"),
            Err(DecodeError::EmptyField("device_id"))
        );
        assert!(matches!(
            matcher.decode("agv-1,rptpos,1,ok"),
            Err(DecodeError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_framed_decode() {
        let matcher = DelimitedMatcher::new('|').with_frame("##", "##");
        let protocol = matcher.decode("##agv-2|rptpos|9|0|B##").unwrap();
        assert_eq!(protocol.device_id, "agv-2");
        assert_eq!(protocol.payload, "B");

        assert!(matches!(
            matcher.decode("agv-2|rptpos|9|0|B"),
            Err(DecodeError::Unframed { .. })
        ));
    }

    #[test]
    fn test_json_decode() {
        let matcher = JsonMatcher;
        let protocol = matcher
            .decode(r#"{"deviceId":"agv-1","commandKey":"rptpos","code":"3","payload":"A"}"#)
            .unwrap();
        assert_eq!(protocol.device_id, "agv-1");
        assert_eq!(protocol.status, 0);

        assert!(matches!(matcher.decode("{not json"), Err(DecodeError::Json(_))));
        assert_eq!(
            matcher.decode(r#"{"deviceId":"","commandKey":"x","code":"1"}"#),
            Err(DecodeError::EmptyField("device_id"))
        );
    }
}

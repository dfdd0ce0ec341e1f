//! Wire protocol for the WebSocket control channel.
//!
//! Every frame is one JSON-encoded [`Message`] envelope: a `type` tag, the
//! protocol `version`, a millisecond `timestamp` and an opaque `payload`
//! decoded per tag. Binary data (tunnel bytes, HTTP bodies) travels
//! base64-encoded inside the JSON, matching what the server expects.
//!
//! The codec is total on well-formed messages of a known type; anything
//! else fails with [`ProtocolError::MalformedPayload`]. Multi-valued HTTP
//! headers are preserved as a `name -> [values]` multimap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tunnel::{TunnelAuth, TunnelType};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// HTTP header multimap. Header names may repeat; value order is preserved.
pub type Headers = HashMap<String, Vec<String>>;

// ── Envelope ─────────────────────────────────────────────────────────

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    Register,
    Unregister,
    Data,
    Ping,
    Pong,
    Error,
    HttpRequest,
    HttpResponse,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Auth => "auth",
            MessageType::Register => "register",
            MessageType::Unregister => "unregister",
            MessageType::Data => "data",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::HttpRequest => "http_request",
            MessageType::HttpResponse => "http_response",
        };
        f.write_str(s)
    }
}

/// The envelope exchanged over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub version: String,
    /// Milliseconds since the Unix epoch. Non-decreasing across all
    /// messages created by this process.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Millisecond timestamp that never goes backwards, even if the wall clock
/// does.
fn next_timestamp() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    LAST.fetch_max(now, Ordering::SeqCst).max(now)
}

impl Message {
    /// Build a message with a typed payload.
    pub fn new<P: Serialize>(message_type: MessageType, payload: &P) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        Ok(Self {
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: next_timestamp(),
            payload: Some(payload),
        })
    }

    /// Build a payload-less message (`ping`, `pong`).
    #[must_use]
    pub fn without_payload(message_type: MessageType) -> Self {
        Self {
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: next_timestamp(),
            payload: None,
        }
    }

    /// Decode the payload into the type expected for this message's tag.
    pub fn parse_payload<P: DeserializeOwned>(&self) -> Result<P, ProtocolError> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| ProtocolError::MalformedPayload("missing payload".to_string()))?;
        serde_json::from_value(payload).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
    }

    /// Serialize to the text-frame wire form.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// Decode a text frame.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub tunnel_type: TunnelType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_addr: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<TunnelAuth>,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

/// Server reply to `register`, delivered on the same message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponsePayload {
    pub success: bool,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterPayload {
    pub tunnel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    pub tunnel_id: String,
    pub connection_id: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ── HTTP proxying payloads ───────────────────────────────────────────

/// An HTTP request forwarded by the server to this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub id: String,
    pub tunnel_id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    pub local_port: u16,
    #[serde(default)]
    pub remote_addr: String,
    /// Client-facing scheme (`http` or `https`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

impl HttpRequest {
    /// First value of a header, looked up case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

/// The client's reply, tagged with the originating request `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

// The server wraps HTTP payloads one level deep: `{"request": {...}}` and
// `{"response": {...}}`. The wrapper stays private to this module.
#[derive(Debug, Serialize, Deserialize)]
struct HttpRequestPayload {
    request: HttpRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpResponsePayload {
    response: HttpResponse,
}

/// Build an `http_response` message from a response.
pub fn http_response_message(response: HttpResponse) -> Result<Message, ProtocolError> {
    Message::new(MessageType::HttpResponse, &HttpResponsePayload { response })
}

/// Extract the request out of an `http_request` message.
pub fn parse_http_request(msg: &Message) -> Result<HttpRequest, ProtocolError> {
    msg.parse_payload::<HttpRequestPayload>().map(|p| p.request)
}

// ── Base64 byte fields ───────────────────────────────────────────────

/// Serde adapter for byte strings carried as base64 inside JSON.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ProtocolError {
    /// The input was not a well-formed message of a known type, or the
    /// payload did not match the shape its tag requires.
    MalformedPayload(String),
    Serialize(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MalformedPayload(e) => write!(f, "malformed payload: {e}"),
            ProtocolError::Serialize(e) => write!(f, "failed to serialize message: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

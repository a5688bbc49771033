//! WebSocket message protocol between browser clients and the relay.
//!
//! One JSON object per text frame, discriminated by `type`. Binary payloads
//! travel as standard base64 strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;

// ── Client → Server ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session with a device. UUIDs are retrieved from the device
    /// when any of the three is missing.
    Connect {
        mac_address: MacAddress,
        service_uuid: Option<String>,
        notify_char_uuid: Option<String>,
        write_char_uuid: Option<String>,
    },
    Disconnect,
    Write {
        characteristic_uuid: String,
        /// Base64-encoded bytes.
        data: String,
        #[serde(default = "default_with_response")]
        with_response: bool,
    },
    Subscribe {
        characteristic_uuid: String,
    },
    Unsubscribe {
        characteristic_uuid: String,
    },
}

fn default_with_response() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("Invalid message format: missing \"type\" field")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid message format: {0}")]
    InvalidMessage(serde_json::Error),
}

impl ClientMessage {
    /// Every `type` a client may send.
    pub const KINDS: [&'static str; 5] = ["connect", "disconnect", "write", "subscribe", "unsubscribe"];

    /// Decode one text frame, separating syntax errors, unknown kinds and
    /// schema violations so each can be reported precisely.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;
        if !Self::KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(ProtocolError::InvalidMessage)
    }
}

// ── Server → Client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        device_name: Option<String>,
        device_address: MacAddress,
        service_uuid: String,
        notify_char_uuid: String,
        write_char_uuid: String,
        proxy_used: String,
    },
    Disconnected {
        reason: String,
    },
    Notification {
        characteristic_uuid: String,
        /// Base64-encoded bytes.
        data: String,
    },
    Status {
        connected: bool,
        device_name: Option<String>,
        message: String,
    },
    Error {
        error: String,
        details: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    pub fn notification(characteristic_uuid: impl Into<String>, data: &[u8]) -> Self {
        Self::Notification {
            characteristic_uuid: characteristic_uuid.into(),
            data: encode_payload(data),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            details: None,
        }
    }
}

// ── Payload helpers ───────────────────────────────────────────────────────────

pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

//! Relay-level errors surfaced to clients and HTTP callers.

use blerelay_core::MacAddress;
use serde::Serialize;

use crate::transport::TransportError;

/// Who is at fault, as reported in `details.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or a precondition the client can fix.
    Client,
    /// A proxy, the network, or the device failed.
    Infrastructure,
    /// A bounded operation ran out of time. Retryable.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("No proxy has seen device {0}. Make sure the device is advertising and in range of a Bluetooth proxy.")]
    DeviceNotSeen(MacAddress),

    #[error("Proxy {0} is not connected")]
    ProxyNotConnected(String),

    #[error("No active connection - connect first")]
    NoSession,

    #[error("Device does not expose characteristic {0}")]
    ProfileUnsupported(String),

    #[error("No suitable GATT service found. Expected a service with both notify and write characteristics.")]
    NoSuitableService,

    #[error("{0} timed out - device may be out of range or busy")]
    Timeout(&'static str),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Write failed: {0}")]
    WriteFailed(TransportError),

    #[error("Invalid data: {0}")]
    InvalidPayload(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::DeviceNotSeen(_)
            | RelayError::NoSession
            | RelayError::ProfileUnsupported(_)
            | RelayError::NoSuitableService
            | RelayError::InvalidPayload(_) => ErrorKind::Client,
            RelayError::ProxyNotConnected(_)
            | RelayError::Transport(_)
            | RelayError::WriteFailed(_) => ErrorKind::Infrastructure,
            RelayError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

//! Proxy transport seam.
//!
//! The relay talks to Bluetooth proxies only through [`ProxyTransport`];
//! the daemon supplies the ESPHome implementation and tests supply a stub.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use blerelay_core::MacAddress;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection to proxy closed")]
    Closed,
    #[error("proxy rejected connection: {0}")]
    Rejected(String),
    #[error("device connection failed (error {code})")]
    Device { code: i32 },
    #[error("GATT error {code} on handle {handle}")]
    Gatt { handle: u32, code: i32 },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

// ── GATT model ────────────────────────────────────────────────────────────────

/// Characteristic property bits as reported by the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties(pub u32);

impl CharProperties {
    pub const READ: u32 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u32 = 0x04;
    pub const WRITE: u32 = 0x08;
    pub const NOTIFY: u32 = 0x10;
    pub const INDICATE: u32 = 0x20;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY) || self.contains(Self::INDICATE)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub handle: u32,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: String,
    pub handle: u32,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A value pushed by a device on a subscribed handle.
#[derive(Debug, Clone)]
pub struct GattNotification {
    pub address: MacAddress,
    pub handle: u32,
    pub data: Bytes,
}

// ── Advertisements ────────────────────────────────────────────────────────────

/// One advertisement as relayed by a proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    /// `None` when the proxy relayed a malformed or empty address.
    pub address: Option<MacAddress>,
    pub name: String,
    pub rssi: i32,
    pub data: Option<Vec<u8>>,
}

/// Per-transport advertisement feed.
pub type AdvertisementSink = Arc<dyn Fn(RawAdvertisement) + Send + Sync>;

/// Registry-level advertisement feed, tagged with the reporting proxy's name.
pub type AdvertisementHandler = Arc<dyn Fn(&str, RawAdvertisement) + Send + Sync>;

// ── Traits ────────────────────────────────────────────────────────────────────

/// A live, authenticated connection to one proxy.
///
/// Implementations must tolerate concurrent calls for different devices.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn subscribe_advertisements(&self, sink: AdvertisementSink) -> Result<(), TransportError>;

    async fn device_connect(&self, address: MacAddress) -> Result<(), TransportError>;

    async fn device_disconnect(&self, address: MacAddress) -> Result<(), TransportError>;

    async fn gatt_services(&self, address: MacAddress) -> Result<Vec<GattService>, TransportError>;

    async fn gatt_write(
        &self,
        address: MacAddress,
        handle: u32,
        data: &[u8],
        response: bool,
    ) -> Result<(), TransportError>;

    async fn gatt_notify(&self, address: MacAddress, handle: u32, enable: bool) -> Result<(), TransportError>;

    /// Every notification received on this transport, for all devices.
    fn notifications(&self) -> broadcast::Receiver<GattNotification>;

    /// Devices the proxy reports as no longer connected.
    fn device_disconnections(&self) -> broadcast::Receiver<MacAddress>;

    fn is_connected(&self) -> bool;

    /// Resolves once the connection to the proxy is gone.
    async fn closed(&self);

    /// Close the connection. Never fails; errors are logged.
    async fn disconnect(&self);
}

/// Opens transports. One per registry.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<Arc<dyn ProxyTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_without_response_counts_as_writable() {
        let props = CharProperties(CharProperties::WRITE_WITHOUT_RESPONSE | CharProperties::READ);
        assert!(props.can_write());
        assert!(!props.can_notify());
        assert!(CharProperties(CharProperties::INDICATE).can_notify());
    }
}

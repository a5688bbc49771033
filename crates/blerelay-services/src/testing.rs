//! In-memory transport for tests.
//!
//! `StubTransport` records every call, serves a fixed GATT table, and can
//! echo writes back as notifications. Enabled for unit tests and, through
//! the `test-util` feature, for the workspace integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use blerelay_core::MacAddress;

use crate::discovery::{DiscoveryError, DiscoveryEvent, DiscoverySource};
use crate::transport::{
    AdvertisementSink, CharProperties, GattCharacteristic, GattNotification, GattService, ProxyTransport,
    RawAdvertisement, TransportConnector, TransportError,
};

pub const SERVICE_UUID: &str = "8E60F02E-F699-4865-B83F-F40501752184";
pub const NOTIFY_UUID: &str = "DC272A22-3F2C-4E87-A2B7-5E1D7C6E0D4B";
pub const WRITE_UUID: &str = "9280F26C-A56F-43EA-B769-D5D732E1AC67";
pub const NOTIFY_HANDLE: u32 = 0x0b;
pub const WRITE_HANDLE: u32 = 0x0e;

/// Generic Access first (nothing usable), then the data service.
pub fn sample_services() -> Vec<GattService> {
    vec![
        GattService {
            uuid: "00001800-0000-1000-8000-00805F9B34FB".into(),
            handle: 0x01,
            characteristics: vec![GattCharacteristic {
                uuid: "00002A00-0000-1000-8000-00805F9B34FB".into(),
                handle: 0x03,
                properties: CharProperties(CharProperties::READ),
            }],
        },
        GattService {
            uuid: SERVICE_UUID.into(),
            handle: 0x0a,
            characteristics: vec![
                GattCharacteristic {
                    uuid: NOTIFY_UUID.into(),
                    handle: NOTIFY_HANDLE,
                    properties: CharProperties(CharProperties::NOTIFY),
                },
                GattCharacteristic {
                    uuid: WRITE_UUID.into(),
                    handle: WRITE_HANDLE,
                    properties: CharProperties(CharProperties::WRITE | CharProperties::WRITE_WITHOUT_RESPONSE),
                },
            ],
        },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub enum StubCall {
    SubscribeAdvertisements,
    DeviceConnect(MacAddress),
    DeviceDisconnect(MacAddress),
    Services(MacAddress),
    Write {
        address: MacAddress,
        handle: u32,
        data: Vec<u8>,
        response: bool,
    },
    Notify {
        address: MacAddress,
        handle: u32,
        enable: bool,
    },
    Disconnect,
}

struct StubState {
    connected: watch::Sender<bool>,
    calls: Mutex<Vec<StubCall>>,
    services: Mutex<Vec<GattService>>,
    sink: Mutex<Option<AdvertisementSink>>,
    echo_handle: Mutex<Option<u32>>,
    connect_delay: Mutex<Option<Duration>>,
    connect_error: Mutex<Option<i32>>,
    write_error: Mutex<Option<i32>>,
    notifications: broadcast::Sender<GattNotification>,
    disconnections: broadcast::Sender<MacAddress>,
}

#[derive(Clone)]
pub struct StubTransport {
    state: Arc<StubState>,
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StubTransport {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(64);
        let (disconnections, _) = broadcast::channel(16);
        Self {
            state: Arc::new(StubState {
                connected: watch::Sender::new(true),
                calls: Mutex::new(Vec::new()),
                services: Mutex::new(sample_services()),
                sink: Mutex::new(None),
                echo_handle: Mutex::new(None),
                connect_delay: Mutex::new(None),
                connect_error: Mutex::new(None),
                write_error: Mutex::new(None),
                notifications,
                disconnections,
            }),
        }
    }

    /// Writes are echoed back as notifications on `handle`.
    pub fn echo_writes_to(&self, handle: u32) -> &Self {
        *self.state.echo_handle.lock() = Some(handle);
        self
    }

    pub fn set_services(&self, services: Vec<GattService>) -> &Self {
        *self.state.services.lock() = services;
        self
    }

    pub fn delay_device_connect(&self, delay: Duration) -> &Self {
        *self.state.connect_delay.lock() = Some(delay);
        self
    }

    pub fn fail_device_connect(&self, code: i32) -> &Self {
        *self.state.connect_error.lock() = Some(code);
        self
    }

    pub fn fail_writes(&self, code: i32) -> &Self {
        *self.state.write_error.lock() = Some(code);
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.send_replace(connected);
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.state.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().clear();
    }

    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StubCall::Write { .. }))
            .count()
    }

    /// Deliver an advertisement through the subscribed sink, if any.
    pub fn advertise(&self, adv: RawAdvertisement) -> bool {
        let sink = self.state.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink(adv);
                true
            }
            None => false,
        }
    }

    pub fn push_notification(&self, address: MacAddress, handle: u32, data: &[u8]) {
        let _ = self.state.notifications.send(GattNotification {
            address,
            handle,
            data: Bytes::copy_from_slice(data),
        });
    }

    /// The proxy reports `address` as disconnected without being asked.
    pub fn drop_device(&self, address: MacAddress) {
        let _ = self.state.disconnections.send(address);
    }

    fn record(&self, call: StubCall) {
        self.state.calls.lock().push(call);
    }
}

#[async_trait]
impl ProxyTransport for StubTransport {
    async fn subscribe_advertisements(&self, sink: AdvertisementSink) -> Result<(), TransportError> {
        self.record(StubCall::SubscribeAdvertisements);
        *self.state.sink.lock() = Some(sink);
        Ok(())
    }

    async fn device_connect(&self, address: MacAddress) -> Result<(), TransportError> {
        self.record(StubCall::DeviceConnect(address));
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match *self.state.connect_error.lock() {
            Some(code) => Err(TransportError::Device { code }),
            None => Ok(()),
        }
    }

    async fn device_disconnect(&self, address: MacAddress) -> Result<(), TransportError> {
        self.record(StubCall::DeviceDisconnect(address));
        Ok(())
    }

    async fn gatt_services(&self, address: MacAddress) -> Result<Vec<GattService>, TransportError> {
        self.record(StubCall::Services(address));
        Ok(self.state.services.lock().clone())
    }

    async fn gatt_write(
        &self,
        address: MacAddress,
        handle: u32,
        data: &[u8],
        response: bool,
    ) -> Result<(), TransportError> {
        self.record(StubCall::Write {
            address,
            handle,
            data: data.to_vec(),
            response,
        });
        if let Some(code) = *self.state.write_error.lock() {
            return Err(TransportError::Gatt { handle, code });
        }
        let echo = *self.state.echo_handle.lock();
        if let Some(echo) = echo {
            self.push_notification(address, echo, data);
        }
        Ok(())
    }

    async fn gatt_notify(&self, address: MacAddress, handle: u32, enable: bool) -> Result<(), TransportError> {
        self.record(StubCall::Notify { address, handle, enable });
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<GattNotification> {
        self.state.notifications.subscribe()
    }

    fn device_disconnections(&self) -> broadcast::Receiver<MacAddress> {
        self.state.disconnections.subscribe()
    }

    fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.state.connected.subscribe();
        let _ = rx.wait_for(|connected| !*connected).await;
    }

    async fn disconnect(&self) {
        self.record(StubCall::Disconnect);
        self.set_connected(false);
    }
}

/// Hands out pre-registered stub transports by host.
#[derive(Clone, Default)]
pub struct StubConnector {
    transports: Arc<Mutex<HashMap<String, StubTransport>>>,
    connects: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl StubConnector {
    pub fn add(&self, host: &str, transport: StubTransport) {
        self.transports.lock().insert(host.to_string(), transport);
    }

    /// Hold every connect attempt open for `delay`.
    pub fn delay_connects(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for StubConnector {
    async fn connect(
        &self,
        host: &str,
        _port: u16,
        _password: &str,
    ) -> Result<Arc<dyn ProxyTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let transport = self.transports.lock().get(host).cloned();
        match transport {
            Some(t) => Ok(Arc::new(t)),
            None => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no stub for {host}"),
            ))),
        }
    }
}

/// Discovery source fed by hand through the returned sender.
pub struct ChannelDiscovery {
    events: Mutex<Option<mpsc::Receiver<DiscoveryEvent>>>,
    stopped: AtomicBool,
}

impl ChannelDiscovery {
    pub fn new() -> (Self, mpsc::Sender<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let source = Self {
            events: Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
        };
        (source, tx)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoverySource for ChannelDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        self.events
            .lock()
            .take()
            .ok_or_else(|| DiscoveryError::Backend("already started".into()))
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

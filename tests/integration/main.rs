//! blerelay integration test harness.
//!
//! Every test wires the real registry, tracker, router, session manager and
//! API against in-memory stub proxies. WebSocket and HTTP tests bind the API
//! on an ephemeral localhost port and talk to it over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use blerelay_api::ApiState;
use blerelay_core::MacAddress;
use blerelay_services::testing::{StubConnector, StubTransport};
use blerelay_services::{
    AdvertisementRouter, DeviceTracker, ProfileCache, ProxyEntry, ProxyRegistry, RawAdvertisement, SessionManager,
};

mod api;
mod sessions;
mod tracking;
mod websocket;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PROXY_A: &str = "proxy-a";
pub const PROXY_B: &str = "proxy-b";
pub const DEDUP_WINDOW: Duration = Duration::from_millis(100);
pub const OP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Relay {
    pub state: ApiState,
    pub router: Arc<AdvertisementRouter>,
    pub connector: StubConnector,
    pub proxy_a: StubTransport,
    pub proxy_b: StubTransport,
}

impl Relay {
    /// Two connected stub proxies, advertisements routed into the tracker.
    pub async fn start() -> Self {
        let proxy_a = StubTransport::new();
        let proxy_b = StubTransport::new();
        let connector = StubConnector::default();
        connector.add("10.0.0.1", proxy_a.clone());
        connector.add("10.0.0.2", proxy_b.clone());

        let registry = ProxyRegistry::new(Arc::new(connector.clone()), "", OP_TIMEOUT);
        registry.register(ProxyEntry::new(PROXY_A, "10.0.0.1", 6053));
        registry.register(ProxyEntry::new(PROXY_B, "10.0.0.2", 6053));

        let tracker = DeviceTracker::shared(Duration::from_secs(30));
        let router = Arc::new(AdvertisementRouter::new(tracker.clone(), DEDUP_WINDOW, 10, "sfp"));
        let live = registry.connect_pending(router.handler()).await;
        assert_eq!(live, 2, "both stub proxies should connect");

        let state = ApiState {
            registry,
            tracker,
            sessions: SessionManager::new(OP_TIMEOUT),
            profiles: ProfileCache::new(),
            op_timeout: OP_TIMEOUT,
            sse_interval: Duration::from_millis(100),
        };

        Self {
            state,
            router,
            connector,
            proxy_a,
            proxy_b,
        }
    }

    pub fn proxy(&self, name: &str) -> &StubTransport {
        match name {
            PROXY_A => &self.proxy_a,
            _ => &self.proxy_b,
        }
    }

    /// Deliver an advertisement as if heard by `proxy`.
    pub fn advertise(&self, proxy: &str, mac: MacAddress, name: &str, rssi: i32) {
        let delivered = self.proxy(proxy).advertise(RawAdvertisement {
            address: Some(mac),
            name: name.to_string(),
            rssi,
            data: None,
        });
        assert!(delivered, "{proxy} has no advertisement subscriber");
    }

    /// Bind the API on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = blerelay_api::router(self.state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }
}

pub fn mac(s: &str) -> MacAddress {
    s.parse().expect("valid MAC")
}

// ── WebSocket client ──────────────────────────────────────────────────────────

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    /// Connect and consume the initial ready status.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .context("websocket connect failed")?;
        let mut client = Self { stream };
        let ready = client.recv().await?;
        assert_eq!(ready["type"], "status");
        assert_eq!(ready["connected"], false);
        assert_eq!(ready["message"], "ESPHome BLE Proxy ready");
        Ok(client)
    }

    pub async fn send(&mut self, msg: Value) -> Result<()> {
        self.stream.send(Message::Text(msg.to_string().into())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next JSON event, skipping control frames.
    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .context("timed out waiting for server event")?
                .context("websocket closed")??;
            if let Message::Text(text) = frame {
                return Ok(serde_json::from_str(text.as_str())?);
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

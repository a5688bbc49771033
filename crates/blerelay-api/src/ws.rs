//! WebSocket endpoint: one [`ClientHandler`] per connection.
//!
//! The socket is split into a writer task draining a FIFO of outbound
//! messages and a read loop that dispatches client messages and forwards
//! session events (notifications, and the session ending on its own).
//! Whatever ends the loop, the client's session is torn down before the
//! handler goes away.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use blerelay_core::protocol::decode_payload;
use blerelay_core::{ClientMessage, MacAddress, ServerMessage};
use blerelay_services::{DeviceProfile, ErrorKind, RelayError, SessionEvent, SessionEventSink, SessionRequest};

use crate::handlers::{device_name, probe_device, ApiState};

const READY_MESSAGE: &str = "ESPHome BLE Proxy ready";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle_ws(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state))
}

/// Drive one client connection to completion.
pub async fn run_connection(socket: WebSocket, state: ApiState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();

    let mut handler = ClientHandler::new(state, out_tx, event_tx);
    let client_id = handler.client_id().to_string();
    tracing::info!(client = %client_id, "websocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode server message");
                    continue;
                }
            };
            match tokio::time::timeout(SEND_TIMEOUT, ws_sink.send(Message::Text(text.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "websocket send failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!("websocket send timed out");
                    break;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    handler.greet();

    loop {
        tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handler.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client = %client_id, error = %e, "websocket receive failed");
                    break;
                }
            },
            Some(event) = event_rx.recv() => handler.forward_event(event),
        }
        if handler.is_closed() || writer.is_finished() {
            break;
        }
    }

    handler.close().await;
    drop(handler);
    writer.abort();
    tracing::info!(client = %client_id, "websocket client disconnected");
}

// ── Client handler ────────────────────────────────────────────────────────────

/// Protocol state for one WebSocket client.
pub struct ClientHandler {
    client_id: String,
    state: ApiState,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    events: SessionEventSink,
    closed: bool,
}

/// Where a session should go and which characteristics it uses.
struct Target {
    proxy_name: String,
    service_uuid: String,
    notify_uuid: String,
    write_uuid: String,
    device_name: Option<String>,
}

impl Target {
    fn from_profile(state: &ApiState, profile: DeviceProfile) -> Self {
        let mac = profile.mac_address;
        Self {
            proxy_name: state.tracker.best_proxy(&mac).unwrap_or(profile.proxy_used),
            service_uuid: profile.service_uuid,
            notify_uuid: profile.notify_char_uuid,
            write_uuid: profile.write_char_uuid,
            device_name: device_name(state, &mac).or(profile.device_name),
        }
    }
}

impl ClientHandler {
    pub fn new(
        state: ApiState,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        events: SessionEventSink,
    ) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            state,
            outbound,
            events,
            closed: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The outbound side has gone away; the connection should end.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn greet(&mut self) {
        self.send_status(false, READY_MESSAGE.to_string());
    }

    /// Decode and dispatch one text frame. Bad frames become error events.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientMessage::decode(text) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => {
                tracing::debug!(client = %self.client_id, error = %e, "rejected client message");
                self.send_error(e.to_string(), ErrorKind::Client);
            }
        }
    }

    pub async fn dispatch(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Connect {
                mac_address,
                service_uuid,
                notify_char_uuid,
                write_char_uuid,
            } => {
                tracing::info!(client = %self.client_id, mac = %mac_address, "connect request");
                match self
                    .connect(mac_address, service_uuid, notify_char_uuid, write_char_uuid)
                    .await
                {
                    Ok(connected) => self.send(connected),
                    Err(e) => self.send_relay_error(e),
                }
            }
            ClientMessage::Disconnect => {
                self.state.sessions.disconnect(&self.client_id).await;
                self.send(ServerMessage::Disconnected {
                    reason: "User requested disconnect".to_string(),
                });
            }
            ClientMessage::Write {
                characteristic_uuid,
                data,
                with_response,
            } => match self.write(&characteristic_uuid, &data, with_response).await {
                Ok(len) => self.send_status(true, format!("Wrote {len} bytes to {characteristic_uuid}")),
                Err(e) => self.send_relay_error(e),
            },
            ClientMessage::Subscribe { characteristic_uuid } => {
                // Notifications are enabled at connect time.
                let connected = self.state.sessions.is_connected(&self.client_id);
                self.send_status(
                    connected,
                    format!("Subscribed to {characteristic_uuid} (active on connect)"),
                );
            }
            ClientMessage::Unsubscribe { characteristic_uuid } => {
                let connected = self.state.sessions.is_connected(&self.client_id);
                self.send_status(
                    connected,
                    format!("Unsubscribe from {characteristic_uuid} (disconnect to stop notifications)"),
                );
            }
        }
    }

    async fn connect(
        &self,
        mac: MacAddress,
        service_uuid: Option<String>,
        notify_uuid: Option<String>,
        write_uuid: Option<String>,
    ) -> Result<ServerMessage, RelayError> {
        let state = &self.state;

        if let (Some(service_uuid), Some(notify_uuid), Some(write_uuid)) = (service_uuid, notify_uuid, write_uuid) {
            let proxy_name = state.tracker.best_proxy(&mac).ok_or(RelayError::DeviceNotSeen(mac))?;
            let target = Target {
                proxy_name,
                service_uuid,
                notify_uuid,
                write_uuid,
                device_name: device_name(state, &mac),
            };
            return self.open(mac, target).await;
        }

        let Some(cached) = state.profiles.get(&mac) else {
            tracing::info!(mac = %mac, "UUIDs not provided, retrieving from device");
            let profile = probe_device(state, mac).await?;
            return self.open(mac, Target::from_profile(state, profile)).await;
        };

        tracing::debug!(mac = %mac, "using cached profile");
        match self.open(mac, Target::from_profile(state, cached)).await {
            Err(RelayError::ProfileUnsupported(uuid)) => {
                // The device no longer exposes what we remembered.
                tracing::info!(mac = %mac, missing = %uuid, "cached profile is stale, retrieving again");
                state.profiles.remove(&mac);
                let profile = probe_device(state, mac).await?;
                self.open(mac, Target::from_profile(state, profile)).await
            }
            other => other,
        }
    }

    async fn open(&self, mac: MacAddress, target: Target) -> Result<ServerMessage, RelayError> {
        let transport = self
            .state
            .registry
            .get_transport(&target.proxy_name)
            .ok_or_else(|| RelayError::ProxyNotConnected(target.proxy_name.clone()))?;

        let info = self
            .state
            .sessions
            .connect(SessionRequest {
                client_id: self.client_id.clone(),
                mac,
                proxy_name: target.proxy_name,
                transport,
                service_uuid: target.service_uuid,
                notify_uuid: target.notify_uuid,
                write_uuid: target.write_uuid,
                device_name: target.device_name,
                events: Some(self.events.clone()),
            })
            .await?;

        Ok(ServerMessage::Connected {
            device_name: info.device_name,
            device_address: info.mac_address,
            service_uuid: info.service_uuid,
            notify_char_uuid: info.notify_char_uuid,
            write_char_uuid: info.write_char_uuid,
            proxy_used: info.proxy_name,
        })
    }

    async fn write(&mut self, characteristic_uuid: &str, data: &str, with_response: bool) -> Result<usize, RelayError> {
        let bytes = decode_payload(data).map_err(|e| RelayError::InvalidPayload(e.to_string()))?;
        self.state
            .sessions
            .write(&self.client_id, characteristic_uuid, &bytes, with_response)
            .await?;
        Ok(bytes.len())
    }

    pub fn forward_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Notification(n) => self.send(ServerMessage::notification(n.characteristic_uuid, &n.data)),
            SessionEvent::Ended { reason } => {
                tracing::info!(client = %self.client_id, reason = %reason, "session ended");
                self.send(ServerMessage::Disconnected { reason });
            }
        }
    }

    /// Tear down any session this client still owns.
    pub async fn close(&mut self) {
        if self.state.sessions.disconnect(&self.client_id).await {
            tracing::info!(client = %self.client_id, "session released on client close");
        }
    }

    fn send(&mut self, msg: ServerMessage) {
        if self.outbound.send(msg).is_err() {
            self.closed = true;
        }
    }

    fn send_status(&mut self, connected: bool, message: String) {
        let device_name = self.state.sessions.get(&self.client_id).and_then(|s| s.device_name);
        self.send(ServerMessage::Status {
            connected,
            device_name,
            message,
        });
    }

    fn send_error(&mut self, error: String, kind: ErrorKind) {
        self.send(ServerMessage::Error {
            error,
            details: Some(json!({ "kind": kind })),
        });
    }

    fn send_relay_error(&mut self, e: RelayError) {
        match e.kind() {
            ErrorKind::Client => tracing::warn!(client = %self.client_id, error = %e, "request failed (client error)"),
            _ => tracing::error!(client = %self.client_id, error = %e, "request failed"),
        }
        let kind = e.kind();
        self.send_error(e.to_string(), kind);
    }
}

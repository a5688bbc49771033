//! Session manager — at most one live GATT session per client.
//!
//! A session pins a client to one device through one proxy transport. It
//! owns the resolved notify/write handles and a watcher task that filters
//! the transport-wide notification stream down to the session's
//! (address, handle) and ends the session when the device or the proxy
//! connection goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use blerelay_core::gatt::uuids_match;
use blerelay_core::MacAddress;

use crate::error::RelayError;
use crate::probe::bounded;
use crate::transport::{GattNotification, GattService, ProxyTransport};

pub const DEVICE_LOST_REASON: &str = "Device disconnected";
pub const PROXY_LOST_REASON: &str = "Proxy connection lost";

/// A notification re-keyed by characteristic UUID for the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub characteristic_uuid: String,
    pub data: Bytes,
}

/// What a session pushes to its client outside of request/response.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notification(Notification),
    /// The session ended without the client asking for it.
    Ended { reason: String },
}

pub type SessionEventSink = mpsc::UnboundedSender<SessionEvent>;

/// Everything needed to open a session.
pub struct SessionRequest {
    pub client_id: String,
    pub mac: MacAddress,
    pub proxy_name: String,
    pub transport: Arc<dyn ProxyTransport>,
    pub service_uuid: String,
    pub notify_uuid: String,
    pub write_uuid: String,
    pub device_name: Option<String>,
    /// Notifications are enabled only when a sink is supplied.
    pub events: Option<SessionEventSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Connecting,
    Connected,
    Disconnecting,
}

/// Point-in-time view of a session, safe to hand out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub mac_address: MacAddress,
    pub proxy_name: String,
    pub device_name: Option<String>,
    pub service_uuid: String,
    pub notify_char_uuid: String,
    pub write_char_uuid: String,
    pub notify_handle: u32,
    pub write_handle: u32,
    pub subscribed: bool,
}

struct Session {
    info: SessionInfo,
    generation: u64,
    transport: Arc<dyn ProxyTransport>,
    events: Option<SessionEventSink>,
    watcher: Option<JoinHandle<()>>,
}

/// Receivers taken before notifications are enabled, so nothing is missed.
struct Feeds {
    notifications: broadcast::Receiver<GattNotification>,
    disconnections: broadcast::Receiver<MacAddress>,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Session>>,
    states: Arc<DashMap<String, SessionState>>,
    generations: Arc<AtomicU64>,
    timeout: Duration,
}

/// Find the handles for the notify and write UUIDs anywhere in the table.
fn resolve_handles(services: &[GattService], notify_uuid: &str, write_uuid: &str) -> Result<(u32, u32), RelayError> {
    let mut notify = None;
    let mut write = None;
    for ch in services.iter().flat_map(|s| &s.characteristics) {
        if uuids_match(&ch.uuid, notify_uuid) {
            notify = Some(ch.handle);
        }
        if uuids_match(&ch.uuid, write_uuid) {
            write = Some(ch.handle);
        }
    }
    let notify = notify.ok_or_else(|| RelayError::ProfileUnsupported(notify_uuid.to_string()))?;
    let write = write.ok_or_else(|| RelayError::ProfileUnsupported(write_uuid.to_string()))?;
    Ok((notify, write))
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Open a session, replacing any the client already has.
    ///
    /// On failure no session is retained and the device is released.
    pub async fn connect(&self, req: SessionRequest) -> Result<SessionInfo, RelayError> {
        if self.sessions.contains_key(&req.client_id) {
            self.disconnect(&req.client_id).await;
        }

        tracing::info!(
            client = %req.client_id,
            mac = %req.mac,
            proxy = %req.proxy_name,
            "connecting to device"
        );
        self.states.insert(req.client_id.clone(), SessionState::Connecting);

        match self.establish(req).await {
            Ok((session, feeds)) => {
                let info = session.info.clone();
                self.states.insert(info.client_id.clone(), SessionState::Connected);
                self.sessions.insert(info.client_id.clone(), session);
                // Spawned after insertion so an immediate loss finds the session.
                if let Some(mut session) = self.sessions.get_mut(&info.client_id) {
                    let watcher = self.spawn_watcher(&session, feeds);
                    session.watcher = Some(watcher);
                }
                tracing::info!(
                    client = %info.client_id,
                    mac = %info.mac_address,
                    notify_handle = info.notify_handle,
                    write_handle = info.write_handle,
                    "session established"
                );
                Ok(info)
            }
            Err((client_id, e)) => {
                self.states.remove(&client_id);
                tracing::warn!(client = %client_id, error = %e, "session connect failed");
                Err(e)
            }
        }
    }

    async fn establish(&self, req: SessionRequest) -> Result<(Session, Feeds), (String, RelayError)> {
        let SessionRequest {
            client_id,
            mac,
            proxy_name,
            transport,
            service_uuid,
            notify_uuid,
            write_uuid,
            device_name,
            events,
        } = req;

        if let Err(e) = bounded(self.timeout, "Connection", transport.device_connect(mac)).await {
            return Err((client_id, e));
        }
        tracing::debug!(mac = %mac, "device connected");

        let feeds = Feeds {
            notifications: transport.notifications(),
            disconnections: transport.device_disconnections(),
        };
        let subscribe = events.is_some();
        let resolved = async {
            let services = bounded(self.timeout, "Service discovery", transport.gatt_services(mac)).await?;
            let (notify_handle, write_handle) = resolve_handles(&services, &notify_uuid, &write_uuid)?;
            if subscribe {
                bounded(self.timeout, "Notification subscribe", transport.gatt_notify(mac, notify_handle, true))
                    .await?;
            }
            Ok::<_, RelayError>((notify_handle, write_handle))
        }
        .await;

        let (notify_handle, write_handle) = match resolved {
            Ok(handles) => handles,
            Err(e) => {
                if let Err(de) = bounded(self.timeout, "Disconnect", transport.device_disconnect(mac)).await {
                    tracing::warn!(mac = %mac, error = %de, "error releasing device after failed connect");
                }
                return Err((client_id, e));
            }
        };

        let session = Session {
            info: SessionInfo {
                client_id,
                mac_address: mac,
                proxy_name,
                device_name,
                service_uuid,
                notify_char_uuid: notify_uuid,
                write_char_uuid: write_uuid,
                notify_handle,
                write_handle,
                subscribed: subscribe,
            },
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            transport,
            events,
            watcher: None,
        };
        Ok((session, feeds))
    }

    /// Forward the session's notifications and end it when the device or
    /// the proxy connection goes away.
    fn spawn_watcher(&self, session: &Session, feeds: Feeds) -> JoinHandle<()> {
        let manager = self.clone();
        let client_id = session.info.client_id.clone();
        let generation = session.generation;
        let address = session.info.mac_address;
        let handle = session.info.notify_handle;
        let characteristic_uuid = session.info.notify_char_uuid.clone();
        let events = session.events.clone();
        let transport = session.transport.clone();
        let Feeds {
            mut notifications,
            mut disconnections,
        } = feeds;

        tokio::spawn(async move {
            let mut closed = transport.closed();
            let reason = loop {
                tokio::select! {
                    _ = &mut closed => break PROXY_LOST_REASON,
                    lost = disconnections.recv() => match lost {
                        Ok(lost) if lost == address => break DEVICE_LOST_REASON,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(mac = %address, skipped, "disconnect listener lagged");
                        }
                        Err(RecvError::Closed) => break PROXY_LOST_REASON,
                    },
                    n = notifications.recv() => match n {
                        Ok(n) if n.address == address && n.handle == handle => {
                            let Some(events) = &events else { continue };
                            tracing::trace!(mac = %address, handle, len = n.data.len(), "notification");
                            let forwarded = Notification {
                                characteristic_uuid: characteristic_uuid.clone(),
                                data: n.data,
                            };
                            if events.send(SessionEvent::Notification(forwarded)).is_err() {
                                tracing::debug!(mac = %address, "client gone, notifications dropped");
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(mac = %address, skipped, "notification forwarder lagged");
                        }
                        Err(RecvError::Closed) => break PROXY_LOST_REASON,
                    },
                }
            };
            manager.end(&client_id, generation, reason);
        })
    }

    /// Drop a session the transport side has already lost. Only the
    /// session identified by `generation` is touched; no transport calls
    /// are made.
    fn end(&self, client_id: &str, generation: u64, reason: &str) {
        let Some((_, session)) = self.sessions.remove_if(client_id, |_, s| s.generation == generation) else {
            return;
        };
        self.states.insert(client_id.to_string(), SessionState::Disconnecting);
        tracing::warn!(
            client = client_id,
            mac = %session.info.mac_address,
            proxy = %session.info.proxy_name,
            reason,
            "session lost"
        );
        if let Some(events) = &session.events {
            let _ = events.send(SessionEvent::Ended {
                reason: reason.to_string(),
            });
        }
        self.states.remove(client_id);
    }

    /// Tear down the client's session. Teardown errors are logged; the
    /// session is removed regardless. Returns whether one existed.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            tracing::debug!(client = client_id, "no session to disconnect");
            return false;
        };
        self.states.insert(client_id.to_string(), SessionState::Disconnecting);

        let Session {
            info,
            transport,
            watcher,
            ..
        } = session;
        tracing::info!(client = client_id, mac = %info.mac_address, "disconnecting device");

        if info.subscribed {
            let disable = transport.gatt_notify(info.mac_address, info.notify_handle, false);
            if let Err(e) = bounded(self.timeout, "Notification unsubscribe", disable).await {
                tracing::warn!(mac = %info.mac_address, error = %e, "error unsubscribing from notifications");
            }
        }
        if let Some(task) = watcher {
            task.abort();
        }
        let release = transport.device_disconnect(info.mac_address);
        if let Err(e) = bounded(self.timeout, "Disconnect", release).await {
            tracing::warn!(mac = %info.mac_address, error = %e, "error disconnecting device");
        }

        self.states.remove(client_id);
        true
    }

    /// Write `data` to the session's write characteristic.
    pub async fn write(
        &self,
        client_id: &str,
        characteristic_uuid: &str,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), RelayError> {
        let (transport, mac, handle) = {
            let session = self.sessions.get(client_id).ok_or(RelayError::NoSession)?;
            if !uuids_match(characteristic_uuid, &session.info.write_char_uuid) {
                tracing::warn!(
                    requested = characteristic_uuid,
                    expected = %session.info.write_char_uuid,
                    "write to non-session characteristic, using session write handle"
                );
            }
            (session.transport.clone(), session.info.mac_address, session.info.write_handle)
        };

        tracing::debug!(mac = %mac, handle, len = data.len(), with_response, "writing");
        match tokio::time::timeout(self.timeout, transport.gatt_write(mac, handle, data, with_response)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(mac = %mac, handle, error = %e, "write failed");
                Err(RelayError::WriteFailed(e))
            }
            Err(_) => Err(RelayError::Timeout("Write")),
        }
    }

    /// Tear down every session. Used on shutdown.
    pub async fn disconnect_all(&self) {
        let clients: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        tracing::info!(count = clients.len(), "disconnecting all sessions");
        for client in clients {
            self.disconnect(&client).await;
        }
    }

    pub fn state(&self, client_id: &str) -> SessionState {
        self.states
            .get(client_id)
            .map(|s| *s.value())
            .unwrap_or(SessionState::Absent)
    }

    pub fn get(&self, client_id: &str) -> Option<SessionInfo> {
        self.sessions.get(client_id).map(|s| s.info.clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|s| s.info.clone()).collect();
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        sessions
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

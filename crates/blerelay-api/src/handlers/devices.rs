//! /devices, /devices/stream, /connect handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use blerelay_core::MacAddress;
use blerelay_services::{DeviceProfile, DiscoveredDevice};

use super::{error_response, probe_device, ApiState};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub mac_address: MacAddress,
    pub name: String,
    pub rssi: i32,
    pub best_proxy: String,
    pub last_seen_secs: u64,
}

impl From<DiscoveredDevice> for DeviceInfo {
    fn from(d: DiscoveredDevice) -> Self {
        Self {
            mac_address: d.mac,
            name: d.name,
            rssi: d.rssi,
            best_proxy: d.proxy,
            last_seen_secs: d.last_seen.elapsed().as_secs(),
        }
    }
}

fn fresh_devices(state: &ApiState) -> Vec<DeviceInfo> {
    state.tracker.list(false).into_iter().map(DeviceInfo::from).collect()
}

// ── /devices ─────────────────────────────────────────────────────────────────

pub async fn handle_devices(State(state): State<ApiState>) -> Json<Vec<DeviceInfo>> {
    Json(fresh_devices(&state))
}

// ── /devices/stream ──────────────────────────────────────────────────────────

/// Server-sent events: the fresh device list, once per interval.
pub async fn handle_device_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let ticker = tokio::time::interval(state.sse_interval);
    let events = stream::unfold((state, ticker), |(state, mut ticker)| async move {
        ticker.tick().await;
        let event = Event::default().json_data(fresh_devices(&state));
        Some((event, (state, ticker)))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ── /connect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub mac_address: String,
}

/// Retrieve the device's UUIDs through its best proxy, then disconnect.
pub async fn handle_connect(
    State(state): State<ApiState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<DeviceProfile>, (StatusCode, String)> {
    let mac: MacAddress = req
        .mac_address
        .parse()
        .map_err(|e: blerelay_core::MacParseError| (StatusCode::BAD_REQUEST, e.to_string()))?;

    match probe_device(&state, mac).await {
        Ok(profile) => Ok(Json(profile)),
        Err(e) => {
            tracing::warn!(mac = %mac, error = %e, "device probe failed");
            Err(error_response(e))
        }
    }
}

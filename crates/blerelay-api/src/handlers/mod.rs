//! HTTP API handlers — exposes relay state as JSON.

pub mod devices;
pub mod status;

use std::time::Duration;

use axum::http::StatusCode;

use blerelay_core::MacAddress;
use blerelay_services::{
    retrieve_profile, DeviceProfile, ErrorKind, ProfileCache, ProxyRegistry, RelayError, SessionManager,
    SharedTracker,
};

#[derive(Clone)]
pub struct ApiState {
    pub registry: ProxyRegistry,
    pub tracker: SharedTracker,
    pub sessions: SessionManager,
    pub profiles: ProfileCache,
    /// Bound for every device operation started from the API.
    pub op_timeout: Duration,
    /// Interval between `/devices/stream` events.
    pub sse_interval: Duration,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Map a relay error onto an HTTP status and message.
fn error_response(e: RelayError) -> (StatusCode, String) {
    let status = match (&e, e.kind()) {
        (RelayError::DeviceNotSeen(_), _) => StatusCode::NOT_FOUND,
        (_, ErrorKind::Client) => StatusCode::BAD_REQUEST,
        (_, ErrorKind::Infrastructure) => StatusCode::BAD_GATEWAY,
        (_, ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
    };
    (status, e.to_string())
}

/// One-shot UUID retrieval through the proxy that hears `mac` best.
/// A successful result is cached.
pub(crate) async fn probe_device(state: &ApiState, mac: MacAddress) -> Result<DeviceProfile, RelayError> {
    let proxy = state
        .tracker
        .best_proxy(&mac)
        .ok_or(RelayError::DeviceNotSeen(mac))?;
    let transport = state
        .registry
        .get_transport(&proxy)
        .ok_or_else(|| RelayError::ProxyNotConnected(proxy.clone()))?;
    let device_name = device_name(state, &mac);

    let profile = retrieve_profile(transport, mac, &proxy, device_name, state.op_timeout).await?;
    state.profiles.insert(profile.clone());
    Ok(profile)
}

/// Advertised name of `mac`, if the tracker knows a non-empty one.
pub(crate) fn device_name(state: &ApiState, mac: &MacAddress) -> Option<String> {
    state
        .tracker
        .get(mac)
        .map(|d| d.name)
        .filter(|n| !n.is_empty())
}

pub use devices::{handle_connect, handle_device_stream, handle_devices};
pub use status::{handle_proxies, handle_sessions, handle_status};

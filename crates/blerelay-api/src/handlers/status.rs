//! /status, /proxies, /sessions handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use blerelay_services::SessionInfo;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled: bool,
    pub proxies_discovered: usize,
    pub proxies_connected: usize,
    pub devices_discovered: usize,
    pub active_sessions: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        enabled: true,
        proxies_discovered: state.registry.len(),
        proxies_connected: state.registry.list_connected().len(),
        devices_discovered: state.tracker.fresh_count(),
        active_sessions: state.sessions.len(),
    })
}

// ── /proxies ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProxyInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub connected: bool,
    pub last_seen_secs: u64,
}

pub async fn handle_proxies(State(state): State<ApiState>) -> Json<Vec<ProxyInfo>> {
    let proxies = state
        .registry
        .list()
        .into_iter()
        .map(|p| ProxyInfo {
            last_seen_secs: p.last_seen.elapsed().as_secs(),
            name: p.name,
            address: p.host,
            port: p.port,
            connected: p.connected,
        })
        .collect();
    Json(proxies)
}

// ── /sessions ────────────────────────────────────────────────────────────────

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

//! blerelayd — bridges browser WebSocket clients to BLE devices through
//! ESPHome Bluetooth proxies.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use blerelay_api::ApiState;
use blerelay_core::config::RelayConfig;
use blerelay_services::{
    AdvertisementRouter, DeviceTracker, DiscoveryCoordinator, DiscoverySource, ProfileCache, ProxyRegistry,
    SessionManager,
};

mod esphome;
mod mdns;

use esphome::EspHomeConnector;
use mdns::MdnsDiscovery;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load config
    if let Err(e) = RelayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RelayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RelayConfig::default()
    });
    tracing::info!(
        path = %RelayConfig::file_path().display(),
        mdns = config.proxies.mdns,
        static_proxies = config.proxies.static_proxies.len(),
        name_filter = %config.discovery.name_filter,
        "blerelayd starting"
    );

    let op_timeout = config.proxies.op_timeout();

    // Shared state
    let registry = ProxyRegistry::new(
        Arc::new(EspHomeConnector),
        config.proxies.password.clone(),
        op_timeout,
    );
    let tracker = DeviceTracker::shared(config.discovery.device_expiry());
    let router = Arc::new(AdvertisementRouter::from_config(tracker.clone(), &config.discovery));
    let sessions = SessionManager::new(op_timeout);
    let profiles = ProfileCache::new();

    // Discovery
    let source: Option<Arc<dyn DiscoverySource>> = if config.proxies.mdns {
        Some(Arc::new(MdnsDiscovery::new(config.proxies.service_type.clone())))
    } else {
        None
    };
    let coordinator = DiscoveryCoordinator::new(
        registry.clone(),
        tracker.clone(),
        router,
        source,
        config.proxies.static_proxies.clone(),
        &config.discovery,
    );
    coordinator.start().await.context("failed to start discovery")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── API server ───────────────────────────────────────────────────────────
    let api_task = {
        let state = ApiState {
            registry: registry.clone(),
            tracker: tracker.clone(),
            sessions: sessions.clone(),
            profiles,
            op_timeout,
            sse_interval: Duration::from_secs(config.api.sse_interval_secs.max(1)),
        };
        let bind = config.network.bind.clone();
        let port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = blerelay_api::serve(state, &bind, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API server exited: {:?}", r),
    }

    sessions.disconnect_all().await;
    coordinator.stop().await;
    Ok(())
}

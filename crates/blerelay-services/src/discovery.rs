//! Discovery coordinator.
//!
//! Owns three background tasks: the discovery event pump (proxy
//! added/removed), the connect loop (opens transports to known proxies and
//! subscribes their advertisements) and the cleanup loop (stale devices and
//! dedup entries). All three stop on the coordinator's shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use blerelay_core::config::{DiscoveryConfig, StaticProxy};

use crate::advert::AdvertisementRouter;
use crate::device::SharedTracker;
use crate::proxy::{ProxyEntry, ProxyRegistry};
use crate::transport::AdvertisementHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ServiceAdded { name: String, address: String, port: u16 },
    ServiceRemoved { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery backend failed: {0}")]
    Backend(String),
    #[error("discovery already started")]
    AlreadyStarted,
}

/// A source of proxy announcements, e.g. mDNS.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Begin browsing. Events arrive on the returned channel until `stop`.
    async fn start(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;

    async fn stop(&self);
}

pub struct DiscoveryCoordinator {
    registry: ProxyRegistry,
    tracker: SharedTracker,
    router: Arc<AdvertisementRouter>,
    source: Option<Arc<dyn DiscoverySource>>,
    static_proxies: Vec<StaticProxy>,
    connect_interval: Duration,
    cleanup_interval: Duration,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        registry: ProxyRegistry,
        tracker: SharedTracker,
        router: Arc<AdvertisementRouter>,
        source: Option<Arc<dyn DiscoverySource>>,
        static_proxies: Vec<StaticProxy>,
        config: &DiscoveryConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            registry,
            tracker,
            router,
            source,
            static_proxies,
            connect_interval: config.connect_interval(),
            cleanup_interval: config.cleanup_interval(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register static proxies, start the discovery source and spawn the loops.
    ///
    /// A failing discovery source is logged; static proxies keep working.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        if !self.tasks.lock().is_empty() {
            return Err(DiscoveryError::AlreadyStarted);
        }

        for proxy in &self.static_proxies {
            self.registry
                .register(ProxyEntry::new(&proxy.name, &proxy.host, proxy.port));
        }
        if !self.static_proxies.is_empty() {
            tracing::info!(count = self.static_proxies.len(), "static proxies registered");
        }

        let mut tasks = Vec::new();

        if let Some(source) = &self.source {
            match source.start().await {
                Ok(events) => {
                    tasks.push(tokio::spawn(event_pump(
                        self.registry.clone(),
                        events,
                        self.shutdown.subscribe(),
                    )));
                }
                Err(e) => tracing::error!(error = %e, "proxy discovery unavailable"),
            }
        }

        tasks.push(tokio::spawn(connect_loop(
            self.registry.clone(),
            self.router.handler(),
            self.connect_interval,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(cleanup_loop(
            self.tracker.clone(),
            self.router.clone(),
            self.cleanup_interval,
            self.shutdown.subscribe(),
        )));

        *self.tasks.lock() = tasks;
        tracing::info!(
            connect_interval_secs = self.connect_interval.as_secs(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            "discovery started"
        );
        Ok(())
    }

    /// Stop the loops, the discovery source and every proxy transport.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "discovery task ended abnormally");
            }
        }
        if let Some(source) = &self.source {
            source.stop().await;
        }
        self.registry.disconnect_all().await;
        tracing::info!("discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }
}

// ── Loops ─────────────────────────────────────────────────────────────────────

async fn event_pump(
    registry: ProxyRegistry,
    mut events: mpsc::Receiver<DiscoveryEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("discovery event pump shutting down");
                return;
            }
            event = events.recv() => match event {
                Some(DiscoveryEvent::ServiceAdded { name, address, port }) => {
                    registry.register(ProxyEntry::new(name, address, port));
                }
                Some(DiscoveryEvent::ServiceRemoved { name }) => registry.remove(&name),
                None => {
                    tracing::info!("discovery source closed");
                    return;
                }
            }
        }
    }
}

async fn connect_loop(
    registry: ProxyRegistry,
    handler: AdvertisementHandler,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("connect loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                tokio::select! {
                    live = registry.connect_pending(handler.clone()) => {
                        tracing::debug!(live, known = registry.len(), "connect tick");
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("connect loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}

async fn cleanup_loop(
    tracker: SharedTracker,
    router: Arc<AdvertisementRouter>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; nothing is stale yet.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("cleanup loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                let evicted = tracker.evict_stale();
                let pruned = router.prune();
                tracing::debug!(evicted, pruned, devices = tracker.len(), "cleanup tick");
            }
        }
    }
}

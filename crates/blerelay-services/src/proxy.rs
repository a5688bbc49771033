//! Proxy registry — known proxies and their live transports.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;

use crate::transport::{AdvertisementHandler, AdvertisementSink, ProxyTransport, TransportConnector};

/// A proxy the relay knows about, discovered or configured.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Flips on transport connect success or failure.
    pub connected: bool,
    #[serde(skip)]
    pub last_seen: Instant,
}

impl ProxyEntry {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connected: false,
            last_seen: Instant::now(),
        }
    }
}

struct Inner {
    proxies: DashMap<String, ProxyEntry>,
    transports: DashMap<String, Arc<dyn ProxyTransport>>,
    connecting: DashSet<String>,
    connector: Arc<dyn TransportConnector>,
    password: String,
    timeout: Duration,
}

/// Shared between the discovery coordinator, sessions, and the API.
#[derive(Clone)]
pub struct ProxyRegistry {
    inner: Arc<Inner>,
}

/// Clears the in-flight marker however the attempt ends.
struct ConnectingGuard<'a> {
    set: &'a DashSet<String>,
    name: String,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.name);
    }
}

impl ProxyRegistry {
    pub fn new(connector: Arc<dyn TransportConnector>, password: impl Into<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                proxies: DashMap::new(),
                transports: DashMap::new(),
                connecting: DashSet::new(),
                connector,
                password: password.into(),
                timeout,
            }),
        }
    }

    /// Upsert by name. Address and port are refreshed; the connectivity flag is kept.
    pub fn register(&self, proxy: ProxyEntry) {
        match self.inner.proxies.get_mut(&proxy.name) {
            Some(mut existing) => {
                existing.host = proxy.host;
                existing.port = proxy.port;
                existing.last_seen = Instant::now();
            }
            None => {
                tracing::info!(name = %proxy.name, host = %proxy.host, port = proxy.port, "proxy registered");
                self.inner.proxies.insert(proxy.name.clone(), proxy);
            }
        }
    }

    /// Forget a proxy. Its transport, if any, is closed in the background.
    pub fn remove(&self, name: &str) {
        if self.inner.proxies.remove(name).is_some() {
            tracing::info!(name, "proxy removed");
        }
        if let Some((_, transport)) = self.inner.transports.remove(name) {
            let name = name.to_string();
            tokio::spawn(async move {
                transport.disconnect().await;
                tracing::debug!(name, "removed proxy transport closed");
            });
        }
    }

    /// Open a transport to `name` and subscribe its advertisement feed.
    ///
    /// Returns whether a live transport exists afterwards. Failures are
    /// logged and recorded in the connectivity flag only.
    pub async fn connect_transport(&self, name: &str, handler: AdvertisementHandler) -> bool {
        if self.inner.transports.contains_key(name) {
            return true;
        }
        if !self.inner.connecting.insert(name.to_string()) {
            tracing::debug!(name, "connect already in flight");
            return false;
        }
        let _guard = ConnectingGuard {
            set: &self.inner.connecting,
            name: name.to_string(),
        };
        // An attempt may have finished between the first check and the guard.
        if self.inner.transports.contains_key(name) {
            return true;
        }

        let Some((host, port)) = self.inner.proxies.get(name).map(|p| (p.host.clone(), p.port)) else {
            return false;
        };

        tracing::debug!(name, host = %host, port, "connecting to proxy");
        let connect = self.inner.connector.connect(&host, port, &self.inner.password);
        let transport = match tokio::time::timeout(self.inner.timeout, connect).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                tracing::warn!(name, error = %e, "proxy connect failed");
                self.set_connected(name, false);
                return false;
            }
            Err(_) => {
                tracing::warn!(name, timeout_secs = self.inner.timeout.as_secs(), "proxy connect timed out");
                self.set_connected(name, false);
                return false;
            }
        };

        let sink: AdvertisementSink = {
            let proxy = name.to_string();
            Arc::new(move |adv| handler(&proxy, adv))
        };
        match tokio::time::timeout(self.inner.timeout, transport.subscribe_advertisements(sink)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(name, error = %e, "advertisement subscription failed");
                transport.disconnect().await;
                self.set_connected(name, false);
                return false;
            }
            Err(_) => {
                tracing::warn!(name, "advertisement subscription timed out");
                transport.disconnect().await;
                self.set_connected(name, false);
                return false;
            }
        }

        // Removed while we were connecting.
        if !self.inner.proxies.contains_key(name) {
            transport.disconnect().await;
            return false;
        }

        let duplicate = match self.inner.transports.entry(name.to_string()) {
            Entry::Occupied(_) => Some(transport),
            Entry::Vacant(slot) => {
                slot.insert(transport);
                None
            }
        };
        if let Some(extra) = duplicate {
            tracing::debug!(name, "transport already live, closing duplicate");
            extra.disconnect().await;
            return true;
        }
        self.set_connected(name, true);
        tracing::info!(name, host = %host, port, "proxy connected");
        true
    }

    /// Attempt every registered proxy without a live transport, concurrently.
    /// Transports that report themselves closed are reaped first.
    ///
    /// Returns the number of live transports afterwards.
    pub async fn connect_pending(&self, handler: AdvertisementHandler) -> usize {
        let dead: Vec<String> = self
            .inner
            .transports
            .iter()
            .filter(|t| !t.value().is_connected())
            .map(|t| t.key().clone())
            .collect();
        for name in dead {
            self.inner.transports.remove(&name);
            self.set_connected(&name, false);
            tracing::warn!(name, "proxy connection lost, will retry");
        }

        let pending: Vec<String> = self
            .inner
            .proxies
            .iter()
            .map(|p| p.key().clone())
            .filter(|name| !self.inner.transports.contains_key(name))
            .collect();

        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "connecting pending proxies");
            join_all(
                pending
                    .iter()
                    .map(|name| self.connect_transport(name, handler.clone())),
            )
            .await;
        }

        self.inner.transports.len()
    }

    pub fn get_transport(&self, name: &str) -> Option<Arc<dyn ProxyTransport>> {
        self.inner.transports.get(name).map(|t| t.value().clone())
    }

    /// Names of proxies with a live transport, sorted.
    pub fn list_connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.transports.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Every known proxy, sorted by name.
    pub fn list(&self) -> Vec<ProxyEntry> {
        let mut proxies: Vec<ProxyEntry> = self.inner.proxies.iter().map(|p| p.value().clone()).collect();
        proxies.sort_by(|a, b| a.name.cmp(&b.name));
        proxies
    }

    pub fn len(&self) -> usize {
        self.inner.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.proxies.is_empty()
    }

    /// Close every transport. Used on shutdown.
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.inner.transports.iter().map(|t| t.key().clone()).collect();
        let transports: Vec<(String, Arc<dyn ProxyTransport>)> = names
            .into_iter()
            .filter_map(|name| self.inner.transports.remove(&name))
            .collect();

        for (name, transport) in transports {
            if tokio::time::timeout(self.inner.timeout, transport.disconnect()).await.is_err() {
                tracing::warn!(name, "proxy disconnect timed out");
            }
            self.set_connected(&name, false);
        }
        tracing::info!("all proxy transports closed");
    }

    fn set_connected(&self, name: &str, connected: bool) {
        if let Some(mut entry) = self.inner.proxies.get_mut(name) {
            entry.connected = connected;
            if connected {
                entry.last_seen = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubConnector, StubTransport};
    use crate::transport::RawAdvertisement;

    fn noop_handler() -> AdvertisementHandler {
        Arc::new(|_: &str, _: RawAdvertisement| {})
    }

    fn registry(connector: &StubConnector) -> ProxyRegistry {
        ProxyRegistry::new(Arc::new(connector.clone()), "", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn register_is_idempotent_and_keeps_flag() {
        let connector = StubConnector::default();
        connector.add("10.0.0.1", StubTransport::new());
        let registry = registry(&connector);

        registry.register(ProxyEntry::new("kitchen", "10.0.0.1", 6053));
        assert!(registry.connect_transport("kitchen", noop_handler()).await);

        registry.register(ProxyEntry::new("kitchen", "10.0.0.1", 6054));
        let proxies = registry.list();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].port, 6054);
        assert!(proxies[0].connected);
    }

    #[tokio::test]
    async fn failed_connect_marks_disconnected_and_retries() {
        let connector = StubConnector::default();
        let registry = registry(&connector);
        registry.register(ProxyEntry::new("garage", "10.0.0.2", 6053));

        assert_eq!(registry.connect_pending(noop_handler()).await, 0);
        assert!(!registry.list()[0].connected);
        assert!(registry.get_transport("garage").is_none());

        connector.add("10.0.0.2", StubTransport::new());
        assert_eq!(registry.connect_pending(noop_handler()).await, 1);
        assert_eq!(registry.list_connected(), vec!["garage".to_string()]);
    }

    #[tokio::test]
    async fn closed_transports_are_reaped_and_reconnected() {
        let connector = StubConnector::default();
        let first = StubTransport::new();
        connector.add("10.0.0.3", first.clone());
        let registry = registry(&connector);
        registry.register(ProxyEntry::new("attic", "10.0.0.3", 6053));
        registry.connect_pending(noop_handler()).await;
        assert_eq!(connector.connect_count(), 1);

        first.set_connected(false);
        let second = StubTransport::new();
        connector.add("10.0.0.3", second);
        assert_eq!(registry.connect_pending(noop_handler()).await, 1);
        assert_eq!(connector.connect_count(), 2);
        assert!(registry.get_transport("attic").is_some_and(|t| t.is_connected()));
    }

    #[tokio::test]
    async fn remove_closes_transport() {
        let connector = StubConnector::default();
        let transport = StubTransport::new();
        connector.add("10.0.0.4", transport.clone());
        let registry = registry(&connector);
        registry.register(ProxyEntry::new("porch", "10.0.0.4", 6053));
        registry.connect_transport("porch", noop_handler()).await;

        registry.remove("porch");
        assert!(registry.is_empty());
        assert!(registry.get_transport("porch").is_none());

        // Disconnect runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn disconnect_all_clears_transports() {
        let connector = StubConnector::default();
        let transport = StubTransport::new();
        connector.add("10.0.0.5", transport.clone());
        let registry = registry(&connector);
        registry.register(ProxyEntry::new("den", "10.0.0.5", 6053));
        registry.connect_transport("den", noop_handler()).await;

        registry.disconnect_all().await;
        assert!(registry.list_connected().is_empty());
        assert!(!registry.list()[0].connected);
        assert!(!transport.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connects_open_one_transport() {
        let connector = StubConnector::default();
        let transport = StubTransport::new();
        connector.add("10.0.0.6", transport.clone());
        connector.delay_connects(Duration::from_millis(50));
        let registry = registry(&connector);
        registry.register(ProxyEntry::new("shed", "10.0.0.6", 6053));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.connect_transport("shed", noop_handler()).await })
            })
            .collect();
        for attempt in attempts {
            attempt.await.unwrap();
        }

        assert_eq!(connector.connect_count(), 1);
        assert!(registry.connect_transport("shed", noop_handler()).await);
        assert_eq!(connector.connect_count(), 1);
        assert!(!transport.calls().contains(&crate::testing::StubCall::Disconnect));
    }
}

//! Device tracker — the RSSI-ranked catalog of advertising devices.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use blerelay_core::MacAddress;

/// One device, as seen by the proxy with the strongest signal.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub mac: MacAddress,
    pub name: String,
    /// Best RSSI across all proxies currently reporting the device.
    pub rssi: i32,
    /// Proxy that reported `rssi`.
    pub proxy: String,
    pub last_seen: Instant,
    pub ad_data: Option<Vec<u8>>,
}

#[derive(Default)]
struct TrackerState {
    devices: HashMap<MacAddress, DiscoveredDevice>,
    /// MAC → proxy name → last RSSI. Ordered so ties resolve to the smallest name.
    rssi_by_proxy: HashMap<MacAddress, BTreeMap<String, i32>>,
}

pub struct DeviceTracker {
    state: Mutex<TrackerState>,
    expiry: Duration,
}

pub type SharedTracker = Arc<DeviceTracker>;

fn strongest(table: &BTreeMap<String, i32>) -> Option<(&String, i32)> {
    let mut best: Option<(&String, i32)> = None;
    for (proxy, &rssi) in table {
        if best.map_or(true, |(_, b)| rssi > b) {
            best = Some((proxy, rssi));
        }
    }
    best
}

impl DeviceTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            expiry,
        }
    }

    pub fn shared(expiry: Duration) -> SharedTracker {
        Arc::new(Self::new(expiry))
    }

    /// Record a sighting of `mac` by `proxy`.
    pub fn update(&self, mac: MacAddress, name: &str, rssi: i32, proxy: &str, ad_data: Option<Vec<u8>>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let table = state.rssi_by_proxy.entry(mac).or_default();
        table.insert(proxy.to_string(), rssi);
        let Some((best_proxy, best_rssi)) = strongest(table).map(|(p, r)| (p.clone(), r)) else {
            return;
        };

        let now = Instant::now();
        match state.devices.get_mut(&mac) {
            Some(device) => {
                if !name.is_empty() {
                    device.name = name.to_string();
                }
                if ad_data.is_some() {
                    device.ad_data = ad_data;
                }
                if device.proxy != best_proxy {
                    tracing::debug!(mac = %mac, proxy = %best_proxy, rssi = best_rssi, "best proxy changed");
                }
                device.rssi = best_rssi;
                device.proxy = best_proxy;
                device.last_seen = now;
            }
            None => {
                tracing::info!(mac = %mac, name, rssi = best_rssi, proxy = %best_proxy, "discovered new device");
                state.devices.insert(
                    mac,
                    DiscoveredDevice {
                        mac,
                        name: name.to_string(),
                        rssi: best_rssi,
                        proxy: best_proxy,
                        last_seen: now,
                        ad_data,
                    },
                );
            }
        }
    }

    /// Devices, strongest first. Stale ones only when `include_stale`.
    pub fn list(&self, include_stale: bool) -> Vec<DiscoveredDevice> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut devices: Vec<DiscoveredDevice> = state
            .devices
            .values()
            .filter(|d| include_stale || now.duration_since(d.last_seen) <= self.expiry)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.mac.cmp(&b.mac)));
        devices
    }

    pub fn get(&self, mac: &MacAddress) -> Option<DiscoveredDevice> {
        self.state.lock().devices.get(mac).cloned()
    }

    /// The proxy hearing `mac` loudest, if any proxy has heard it.
    pub fn best_proxy(&self, mac: &MacAddress) -> Option<String> {
        let state = self.state.lock();
        state
            .rssi_by_proxy
            .get(mac)
            .and_then(strongest)
            .map(|(proxy, _)| proxy.clone())
    }

    pub fn proxy_rssi(&self, mac: &MacAddress, proxy: &str) -> Option<i32> {
        self.state.lock().rssi_by_proxy.get(mac).and_then(|t| t.get(proxy).copied())
    }

    /// Drop devices unseen for longer than the expiry window, along with
    /// their per-proxy RSSI tables.
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let stale: Vec<MacAddress> = state
            .devices
            .values()
            .filter(|d| now.duration_since(d.last_seen) > self.expiry)
            .map(|d| d.mac)
            .collect();

        for mac in &stale {
            state.devices.remove(mac);
            state.rssi_by_proxy.remove(mac);
            tracing::debug!(mac = %mac, "evicted stale device");
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "cleaned up stale devices");
        }
        stale.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.devices.clear();
        state.rssi_by_proxy.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().devices.is_empty()
    }

    /// Number of devices seen within the expiry window.
    pub fn fresh_count(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .devices
            .values()
            .filter(|d| now.duration_since(d.last_seen) <= self.expiry)
            .count()
    }
}

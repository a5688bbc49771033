//! Advertisement router — filters the raw advertisement flood from every
//! proxy and feeds survivors into the device tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use blerelay_core::config::DiscoveryConfig;
use blerelay_core::MacAddress;

use crate::device::SharedTracker;
use crate::transport::{AdvertisementHandler, RawAdvertisement};

pub struct AdvertisementRouter {
    tracker: SharedTracker,
    seen: Mutex<HashMap<(MacAddress, i32), Instant>>,
    window: Duration,
    retention: Duration,
    /// Lowercased. Empty accepts everything.
    name_filter: String,
}

impl AdvertisementRouter {
    pub fn new(tracker: SharedTracker, window: Duration, retention_factor: u32, name_filter: &str) -> Self {
        Self {
            tracker,
            seen: Mutex::new(HashMap::new()),
            window,
            retention: window * retention_factor.max(1),
            name_filter: name_filter.to_lowercase(),
        }
    }

    pub fn from_config(tracker: SharedTracker, config: &DiscoveryConfig) -> Self {
        Self::new(
            tracker,
            config.dedup_window(),
            config.dedup_retention_factor,
            &config.name_filter,
        )
    }

    /// Process one advertisement relayed by `proxy`. Returns whether it
    /// reached the tracker.
    pub fn ingest(&self, proxy: &str, adv: RawAdvertisement) -> bool {
        let Some(mac) = adv.address else {
            return false;
        };

        let now = Instant::now();
        {
            let mut seen = self.seen.lock();
            if let Some(last) = seen.get(&(mac, adv.rssi)) {
                if now.duration_since(*last) < self.window {
                    return false;
                }
            }
            // Stamped before the name filter runs.
            seen.insert((mac, adv.rssi), now);
        }

        if !self.name_filter.is_empty() && !adv.name.to_lowercase().contains(&self.name_filter) {
            tracing::trace!(mac = %mac, name = %adv.name, "ignoring filtered device");
            return false;
        }

        tracing::trace!(mac = %mac, name = %adv.name, rssi = adv.rssi, proxy, "advertisement accepted");
        self.tracker.update(mac, &adv.name, adv.rssi, proxy, adv.data);
        true
    }

    /// Purge dedup entries older than the retention period.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, last| now.duration_since(*last) <= self.retention);
        before - seen.len()
    }

    pub fn cache_len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Registry-facing handler that routes into this router.
    pub fn handler(self: &Arc<Self>) -> AdvertisementHandler {
        let router = Arc::clone(self);
        Arc::new(move |proxy, adv| {
            router.ingest(proxy, adv);
        })
    }
}

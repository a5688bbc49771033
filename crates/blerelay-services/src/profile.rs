//! Device profiles: the service, notify and write UUIDs a device was last
//! found to expose. In-memory only.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use blerelay_core::MacAddress;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub mac_address: MacAddress,
    pub service_uuid: String,
    pub notify_char_uuid: String,
    pub write_char_uuid: String,
    pub device_name: Option<String>,
    pub proxy_used: String,
}

#[derive(Clone, Default)]
pub struct ProfileCache {
    profiles: Arc<DashMap<MacAddress, DeviceProfile>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mac: &MacAddress) -> Option<DeviceProfile> {
        self.profiles.get(mac).map(|p| p.value().clone())
    }

    pub fn insert(&self, profile: DeviceProfile) {
        tracing::debug!(mac = %profile.mac_address, service = %profile.service_uuid, "profile cached");
        self.profiles.insert(profile.mac_address, profile);
    }

    pub fn remove(&self, mac: &MacAddress) -> Option<DeviceProfile> {
        self.profiles.remove(mac).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

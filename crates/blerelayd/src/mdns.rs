//! mDNS discovery of ESPHome proxies.

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use blerelay_services::{DiscoveryError, DiscoveryEvent, DiscoverySource};

pub struct MdnsDiscovery {
    service_type: String,
    daemon: Mutex<Option<ServiceDaemon>>,
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            daemon: Mutex::new(None),
        }
    }
}

/// Instance name from a full service name, e.g.
/// `living-room._esphomelib._tcp.local.` → `living-room`.
pub fn proxy_name(service_type: &str, fullname: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn translate(service_type: &str, event: ServiceEvent) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let addresses = info.get_addresses();
            let address = addresses
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addresses.iter().next())?;
            Some(DiscoveryEvent::ServiceAdded {
                name: proxy_name(service_type, info.get_fullname()),
                address: address.to_string(),
                port: info.get_port(),
            })
        }
        ServiceEvent::ServiceRemoved(_, fullname) => Some(DiscoveryEvent::ServiceRemoved {
            name: proxy_name(service_type, &fullname),
        }),
        _ => None,
    }
}

#[async_trait]
impl DiscoverySource for MdnsDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let mut slot = self.daemon.lock();
        if slot.is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Backend(e.to_string()))?;
        let browse = daemon
            .browse(&self.service_type)
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let service_type = self.service_type.clone();
        // The browse receiver ends when the daemon shuts down.
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = browse.recv() {
                if let Some(event) = translate(&service_type, event) {
                    tracing::debug!(?event, "mdns event");
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            }
        });

        tracing::info!(service_type = %self.service_type, "mdns browsing started");
        *slot = Some(daemon);
        Ok(rx)
    }

    async fn stop(&self) {
        let daemon = self.daemon.lock().take();
        if let Some(daemon) = daemon {
            if let Err(e) = daemon.stop_browse(&self.service_type) {
                tracing::debug!(error = %e, "mdns stop_browse failed");
            }
            if let Err(e) = daemon.shutdown() {
                tracing::warn!(error = %e, "mdns daemon shutdown failed");
            }
        }
    }
}

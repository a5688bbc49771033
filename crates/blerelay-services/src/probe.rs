//! One-shot UUID retrieval: connect, enumerate, pick a usable service,
//! disconnect.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use blerelay_core::MacAddress;

use crate::error::RelayError;
use crate::profile::DeviceProfile;
use crate::transport::{CharProperties, GattService, ProxyTransport, TransportError};

/// Run `fut` under `limit`, mapping elapsed time to [`RelayError::Timeout`].
pub(crate) async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, RelayError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(RelayError::from),
        Err(_) => Err(RelayError::Timeout(what)),
    }
}

/// UUIDs of the first service exposing both a notifiable and a writable
/// characteristic, as `(service, notify, write)`.
///
/// Within a service the last matching characteristic of each kind wins.
pub fn select_service(services: &[GattService]) -> Option<(String, String, String)> {
    services.iter().find_map(|service| {
        let mut notify = None;
        let mut write = None;
        for ch in &service.characteristics {
            if ch.properties.contains(CharProperties::NOTIFY) {
                notify = Some(&ch.uuid);
            }
            if ch.properties.can_write() {
                write = Some(&ch.uuid);
            }
        }
        match (notify, write) {
            (Some(n), Some(w)) => Some((service.uuid.clone(), n.clone(), w.clone())),
            _ => None,
        }
    })
}

/// Discover the profile of `mac` through `transport`. The device is
/// disconnected afterwards whatever the outcome.
pub async fn retrieve_profile(
    transport: Arc<dyn ProxyTransport>,
    mac: MacAddress,
    proxy_name: &str,
    device_name: Option<String>,
    limit: Duration,
) -> Result<DeviceProfile, RelayError> {
    tracing::info!(mac = %mac, proxy = proxy_name, "retrieving device profile");

    let result = async {
        bounded(limit, "Connection", transport.device_connect(mac)).await?;
        let services = bounded(limit, "Service discovery", transport.gatt_services(mac)).await?;
        tracing::debug!(mac = %mac, services = services.len(), "services retrieved");
        select_service(&services).ok_or(RelayError::NoSuitableService)
    }
    .await;

    if let Err(e) = bounded(limit, "Disconnect", transport.device_disconnect(mac)).await {
        tracing::warn!(mac = %mac, error = %e, "error disconnecting after profile retrieval");
    }

    let (service_uuid, notify_char_uuid, write_char_uuid) = result?;
    tracing::info!(
        mac = %mac,
        service = %service_uuid,
        notify = %notify_char_uuid,
        write = %write_char_uuid,
        "profile retrieved"
    );

    Ok(DeviceProfile {
        mac_address: mac,
        service_uuid,
        notify_char_uuid,
        write_char_uuid,
        device_name,
        proxy_used: proxy_name.to_string(),
    })
}

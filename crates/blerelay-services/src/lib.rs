//! blerelay-services — proxy registry, device tracking, advertisement
//! routing, GATT sessions and the discovery coordinator.

pub mod advert;
pub mod device;
pub mod discovery;
pub mod error;
pub mod probe;
pub mod profile;
pub mod proxy;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use advert::AdvertisementRouter;
pub use device::{DeviceTracker, DiscoveredDevice, SharedTracker};
pub use discovery::{DiscoveryCoordinator, DiscoveryError, DiscoveryEvent, DiscoverySource};
pub use error::{ErrorKind, RelayError};
pub use probe::{retrieve_profile, select_service};
pub use profile::{DeviceProfile, ProfileCache};
pub use proxy::{ProxyEntry, ProxyRegistry};
pub use session::{
    Notification, SessionEvent, SessionEventSink, SessionInfo, SessionManager, SessionRequest, SessionState,
};
pub use transport::{
    AdvertisementHandler, AdvertisementSink, CharProperties, GattCharacteristic, GattNotification, GattService,
    ProxyTransport, RawAdvertisement, TransportConnector, TransportError,
};

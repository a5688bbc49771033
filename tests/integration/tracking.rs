//! Advertisement routing and best-proxy selection through stub proxies.

use std::time::Duration;

use blerelay_services::{AdvertisementRouter, DeviceTracker, RawAdvertisement};

use crate::*;

/// −70 on A, −50 on B selects B; −40 on A flips back to A.
#[tokio::test]
async fn best_proxy_follows_strongest_signal() {
    let relay = Relay::start().await;
    let tracker = &relay.state.tracker;
    let dev = mac("AA:BB:CC:DD:EE:10");

    relay.advertise(PROXY_A, dev, "SFP-Wizard", -70);
    assert_eq!(tracker.best_proxy(&dev).as_deref(), Some(PROXY_A));

    relay.advertise(PROXY_B, dev, "SFP-Wizard", -50);
    assert_eq!(tracker.best_proxy(&dev).as_deref(), Some(PROXY_B));

    relay.advertise(PROXY_A, dev, "SFP-Wizard", -40);
    assert_eq!(tracker.best_proxy(&dev).as_deref(), Some(PROXY_A));

    // A weaker report from the other proxy never wins.
    relay.advertise(PROXY_B, dev, "SFP-Wizard", -45);
    assert_eq!(tracker.best_proxy(&dev).as_deref(), Some(PROXY_A));
    assert_eq!(tracker.proxy_rssi(&dev, PROXY_B), Some(-45));
}

/// Identical (mac, rssi) inside the window is dropped, even from another proxy.
#[tokio::test]
async fn duplicate_advertisements_are_dropped_inside_window() {
    let relay = Relay::start().await;
    let tracker = &relay.state.tracker;
    let dev = mac("AA:BB:CC:DD:EE:11");

    relay.advertise(PROXY_A, dev, "SFP", -55);
    relay.advertise(PROXY_B, dev, "SFP", -55);
    assert_eq!(tracker.proxy_rssi(&dev, PROXY_A), Some(-55));
    assert_eq!(tracker.proxy_rssi(&dev, PROXY_B), None);

    tokio::time::sleep(DEDUP_WINDOW + Duration::from_millis(50)).await;
    relay.advertise(PROXY_B, dev, "SFP", -55);
    assert_eq!(tracker.proxy_rssi(&dev, PROXY_B), Some(-55));
}

#[tokio::test]
async fn devices_outside_name_filter_are_ignored() {
    let relay = Relay::start().await;
    let dev = mac("AA:BB:CC:DD:EE:12");

    relay.advertise(PROXY_A, dev, "Kitchen Thermometer", -40);
    assert!(relay.state.tracker.get(&dev).is_none());

    relay.advertise(PROXY_A, dev, "sfp-wizard", -41);
    assert_eq!(relay.state.tracker.get(&dev).map(|d| d.name).as_deref(), Some("sfp-wizard"));
}

/// Eviction drops per-proxy RSSI along with the device.
#[tokio::test]
async fn eviction_forgets_best_proxy() {
    let tracker = DeviceTracker::shared(Duration::from_millis(50));
    let router = AdvertisementRouter::new(tracker.clone(), Duration::from_millis(10), 10, "");
    let dev = mac("AA:BB:CC:DD:EE:13");

    assert!(router.ingest(
        PROXY_A,
        RawAdvertisement {
            address: Some(dev),
            name: String::new(),
            rssi: -60,
            data: None,
        }
    ));
    assert_eq!(tracker.best_proxy(&dev).as_deref(), Some(PROXY_A));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(tracker.evict_stale(), 1);
    assert_eq!(tracker.best_proxy(&dev), None);
    assert_eq!(tracker.proxy_rssi(&dev, PROXY_A), None);
    assert_eq!(router.prune(), 1);

}

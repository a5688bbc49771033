//! REST and SSE endpoints.

use serde_json::json;

use blerelay_services::testing::{sample_services, StubCall, NOTIFY_UUID, SERVICE_UUID, WRITE_UUID};
use blerelay_services::GattService;

use crate::*;

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}/api{path}")
}

#[tokio::test]
async fn status_and_listings() -> Result<()> {
    let relay = Relay::start().await;
    relay.advertise(PROXY_A, mac("AA:BB:CC:DD:EE:40"), "SFP-1", -60);
    relay.advertise(PROXY_B, mac("AA:BB:CC:DD:EE:41"), "SFP-2", -50);
    let addr = relay.serve().await;

    let status: Value = reqwest::get(url(addr, "/status")).await?.json().await?;
    assert_eq!(
        status,
        json!({
            "enabled": true,
            "proxies_discovered": 2,
            "proxies_connected": 2,
            "devices_discovered": 2,
            "active_sessions": 0,
        })
    );

    let devices: Value = reqwest::get(url(addr, "/devices")).await?.json().await?;
    let devices = devices.as_array().context("devices array")?;
    assert_eq!(devices.len(), 2);
    // Strongest first.
    assert_eq!(devices[0]["mac_address"], "AA:BB:CC:DD:EE:41");
    assert_eq!(devices[0]["best_proxy"], PROXY_B);
    assert_eq!(devices[1]["rssi"], -60);

    let proxies: Value = reqwest::get(url(addr, "/proxies")).await?.json().await?;
    let names: Vec<&str> = proxies
        .as_array()
        .context("proxies array")?
        .iter()
        .filter_map(|p| p["name"].as_str())
        .collect();
    assert_eq!(names, vec![PROXY_A, PROXY_B]);
    assert_eq!(proxies[0]["connected"], true);

    let sessions: Value = reqwest::get(url(addr, "/sessions")).await?.json().await?;
    assert_eq!(sessions, json!([]));
    Ok(())
}

#[tokio::test]
async fn connect_endpoint_retrieves_profile_and_releases_device() -> Result<()> {
    let relay = Relay::start().await;
    let dev = mac("AA:BB:CC:DD:EE:42");
    relay.advertise(PROXY_A, dev, "SFP-Wizard", -55);
    let addr = relay.serve().await;

    let resp = reqwest::Client::new()
        .post(url(addr, "/connect"))
        .json(&json!({ "mac_address": "aa-bb-cc-dd-ee-42" }))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);
    let profile: Value = resp.json().await?;
    assert_eq!(
        profile,
        json!({
            "mac_address": "AA:BB:CC:DD:EE:42",
            "service_uuid": SERVICE_UUID,
            "notify_char_uuid": NOTIFY_UUID,
            "write_char_uuid": WRITE_UUID,
            "device_name": "SFP-Wizard",
            "proxy_used": PROXY_A,
        })
    );

    assert_eq!(
        relay.proxy_a.calls().last(),
        Some(&StubCall::DeviceDisconnect(dev))
    );
    assert!(relay.state.profiles.get(&dev).is_some());
    assert!(relay.state.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn connect_endpoint_error_statuses() -> Result<()> {
    let relay = Relay::start().await;
    let addr = relay.serve().await;
    let client = reqwest::Client::new();

    let bad_mac = client
        .post(url(addr, "/connect"))
        .json(&json!({ "mac_address": "nope" }))
        .send()
        .await?;
    assert_eq!(bad_mac.status().as_u16(), 400);

    let unseen = client
        .post(url(addr, "/connect"))
        .json(&json!({ "mac_address": "AA:BB:CC:DD:EE:43" }))
        .send()
        .await?;
    assert_eq!(unseen.status().as_u16(), 404);
    assert!(unseen.text().await?.contains("AA:BB:CC:DD:EE:43"));

    // Only the Generic Access service: nothing usable.
    let dev = mac("AA:BB:CC:DD:EE:44");
    let generic_only: Vec<GattService> = sample_services().into_iter().take(1).collect();
    relay.proxy_a.set_services(generic_only);
    relay.advertise(PROXY_A, dev, "SFP", -50);
    let unsupported = client
        .post(url(addr, "/connect"))
        .json(&json!({ "mac_address": "AA:BB:CC:DD:EE:44" }))
        .send()
        .await?;
    assert_eq!(unsupported.status().as_u16(), 400);
    assert!(unsupported.text().await?.starts_with("No suitable GATT service found"));
    assert!(relay.proxy_a.calls().contains(&StubCall::DeviceDisconnect(dev)));

    // Proxy fails the device connection.
    let dev = mac("AA:BB:CC:DD:EE:45");
    relay.proxy_b.fail_device_connect(-1);
    relay.advertise(PROXY_B, dev, "SFP", -50);
    let failed = client
        .post(url(addr, "/connect"))
        .json(&json!({ "mac_address": "AA:BB:CC:DD:EE:45" }))
        .send()
        .await?;
    assert_eq!(failed.status().as_u16(), 502);
    Ok(())
}

#[tokio::test]
async fn device_stream_emits_device_arrays() -> Result<()> {
    let relay = Relay::start().await;
    relay.advertise(PROXY_A, mac("AA:BB:CC:DD:EE:46"), "SFP", -50);
    let addr = relay.serve().await;

    let mut resp = reqwest::get(url(addr, "/devices/stream")).await?;
    assert_eq!(resp.status().as_u16(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let mut body = String::new();
    while !body.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .context("timed out waiting for SSE event")??
            .context("stream ended")?;
        body.push_str(&String::from_utf8_lossy(&chunk));
    }
    let data = body
        .lines()
        .find_map(|l| l.strip_prefix("data:"))
        .context("no data line")?;
    let devices: Value = serde_json::from_str(data.trim())?;
    assert_eq!(devices[0]["mac_address"], "AA:BB:CC:DD:EE:46");
    Ok(())
}

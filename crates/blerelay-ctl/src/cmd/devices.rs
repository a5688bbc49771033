//! Device listing and one-shot UUID retrieval.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::http::{base_url, get_json, post_json_body};

#[derive(Deserialize)]
struct DeviceInfo {
    mac_address:    String,
    name:           String,
    rssi:           i32,
    best_proxy:     String,
    last_seen_secs: u64,
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    mac_address: &'a str,
}

#[derive(Deserialize)]
struct DeviceProfile {
    mac_address:      String,
    service_uuid:     String,
    notify_char_uuid: String,
    write_char_uuid:  String,
    device_name:      Option<String>,
    proxy_used:       String,
}

pub async fn cmd_devices(port: u16) -> Result<()> {
    let devices: Vec<DeviceInfo> = get_json(&format!("{}/devices", base_url(port))).await?;

    if devices.is_empty() {
        println!("No devices in range.");
        return Ok(());
    }

    println!("{:<19} {:<24} {:>5}  {:<20} {}", "MAC", "NAME", "RSSI", "PROXY", "SEEN");
    for d in &devices {
        let name = if d.name.is_empty() { "-" } else { d.name.as_str() };
        println!(
            "{:<19} {:<24} {:>5}  {:<20} {}s",
            d.mac_address, name, d.rssi, d.best_proxy, d.last_seen_secs
        );
    }

    Ok(())
}

pub async fn cmd_probe(port: u16, mac: &str) -> Result<()> {
    let profile: DeviceProfile = post_json_body(
        &format!("{}/connect", base_url(port)),
        &ConnectRequest { mac_address: mac },
    )
    .await?;

    println!("═══════════════════════════════════════");
    println!("  Device Profile");
    println!("═══════════════════════════════════════");
    println!("  MAC     : {}", profile.mac_address);
    println!("  Name    : {}", profile.device_name.as_deref().unwrap_or("-"));
    println!("  Proxy   : {}", profile.proxy_used);
    println!("  Service : {}", profile.service_uuid);
    println!("  Notify  : {}", profile.notify_char_uuid);
    println!("  Write   : {}", profile.write_char_uuid);

    Ok(())
}

//! Status and proxy commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    enabled:            bool,
    proxies_discovered: usize,
    proxies_connected:  usize,
    devices_discovered: usize,
    active_sessions:    usize,
}

#[derive(Deserialize)]
struct ProxyInfo {
    name:           String,
    address:        String,
    port:           u16,
    connected:      bool,
    last_seen_secs: u64,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  BLE Relay Status");
    println!("═══════════════════════════════════════");
    println!("  Enabled            : {}", if resp.enabled { "yes" } else { "no" });
    println!("  Proxies discovered : {}", resp.proxies_discovered);
    println!("  Proxies connected  : {}", resp.proxies_connected);
    println!("  Devices discovered : {}", resp.devices_discovered);
    println!("  Active sessions    : {}", resp.active_sessions);

    Ok(())
}

pub async fn cmd_proxies(port: u16) -> Result<()> {
    let proxies: Vec<ProxyInfo> = get_json(&format!("{}/proxies", base_url(port))).await?;

    if proxies.is_empty() {
        println!("No proxies discovered yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Bluetooth Proxies ({})", proxies.len());
    println!("═══════════════════════════════════════");

    for p in &proxies {
        let marker = if p.connected { "●" } else { "○" };
        println!("  {} {}", marker, p.name);
        println!("      address   : {}:{}", p.address, p.port);
        println!("      last seen : {}s ago", p.last_seen_secs);
    }

    Ok(())
}

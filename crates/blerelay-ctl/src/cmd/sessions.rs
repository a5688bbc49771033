//! Active session listing.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct SessionInfo {
    client_id:   String,
    mac_address: String,
    proxy_name:  String,
    device_name: Option<String>,
    subscribed:  bool,
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    let sessions: Vec<SessionInfo> = get_json(&format!("{}/sessions", base_url(port))).await?;

    if sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }

    println!("Sessions ({}):", sessions.len());
    for s in &sessions {
        println!("  ┌─ {}", s.client_id);
        println!("  │  device : {} ({})", s.mac_address, s.device_name.as_deref().unwrap_or("unnamed"));
        println!("  │  proxy  : {}", s.proxy_name);
        println!("  └─ notify : {}", if s.subscribed { "on" } else { "off" });
    }

    Ok(())
}

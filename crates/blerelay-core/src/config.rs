//! Configuration system for blerelay.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BLERELAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/blerelay/config.toml
//!   3. ~/.config/blerelay/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub proxies: ProxiesConfig,
    pub discovery: DiscoveryConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the HTTP/WebSocket API binds to.
    pub bind: String,
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxiesConfig {
    /// Native API password. Empty = no authentication.
    pub password: String,
    /// Bound for proxy connect and every GATT operation.
    pub connect_timeout_secs: u64,
    /// Browse mDNS for proxies.
    pub mdns: bool,
    pub service_type: String,
    /// Proxies registered at startup, for networks mDNS does not reach.
    #[serde(rename = "static")]
    pub static_proxies: Vec<StaticProxy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticProxy {
    pub name: String,
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

fn default_proxy_port() -> u16 {
    6053
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Devices unseen for longer than this are stale.
    pub device_expiry_secs: u64,
    /// Identical (mac, rssi) advertisements inside this window are dropped.
    pub dedup_window_ms: u64,
    /// Dedup entries older than `dedup_window_ms * dedup_retention_factor` are purged.
    pub dedup_retention_factor: u32,
    pub connect_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Case-insensitive substring a device name must contain. Empty = accept all.
    pub name_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Interval between device-stream events.
    pub sse_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            api_port: 8081,
        }
    }
}

impl Default for ProxiesConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            connect_timeout_secs: 30,
            mdns: true,
            service_type: "_esphomelib._tcp.local.".to_string(),
            static_proxies: Vec::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_expiry_secs: 30,
            dedup_window_ms: 2_000,
            dedup_retention_factor: 10,
            connect_interval_secs: 5,
            cleanup_interval_secs: 10,
            name_filter: "sfp".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { sse_interval_secs: 1 }
    }
}

impl ProxiesConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl DiscoveryConfig {
    pub fn device_expiry(&self) -> Duration {
        Duration::from_secs(self.device_expiry_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_secs(self.connect_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("blerelay")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RelayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RelayConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BLERELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RelayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BLERELAY_* overrides from `lookup` (the process environment in production).
    ///
    /// `BLERELAY_PROXY__HOST` + `BLERELAY_PROXY__NAME` register one extra static
    /// proxy, for container deployments where multicast does not reach.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("BLERELAY_NETWORK__BIND") {
            self.network.bind = v;
        }
        if let Some(p) = lookup("BLERELAY_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = lookup("BLERELAY_PROXIES__PASSWORD") {
            self.proxies.password = v;
        }
        if let Some(t) = lookup("BLERELAY_PROXIES__CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.proxies.connect_timeout_secs = t;
        }
        if let Some(v) = lookup("BLERELAY_PROXIES__MDNS") {
            self.proxies.mdns = flag(v);
        }
        if let Some(v) = lookup("BLERELAY_DISCOVERY__NAME_FILTER") {
            self.discovery.name_filter = v;
        }
        if let Some(s) = lookup("BLERELAY_DISCOVERY__DEVICE_EXPIRY_SECS").and_then(|v| v.parse().ok()) {
            self.discovery.device_expiry_secs = s;
        }

        if let (Some(host), Some(name)) = (lookup("BLERELAY_PROXY__HOST"), lookup("BLERELAY_PROXY__NAME")) {
            let port = lookup("BLERELAY_PROXY__PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_proxy_port);
            if !self.proxies.static_proxies.iter().any(|p| p.name == name) {
                self.proxies.static_proxies.push(StaticProxy { name, host, port });
            }
        }
    }
}

//! Ferry Configuration
//!
//! Settings consumed by the rendezvous listener, the dialer and every channel.
//! Values come from defaults, then an optional TOML/JSON file, then `FERRY_*`
//! environment variables.

use crate::errors::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Smallest accepted key length in bytes
pub const MIN_KEY_LENGTH: usize = 8;

/// Rendezvous configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    /// Listen port for the rendezvous listener (0 picks an ephemeral port)
    pub port: u16,
    /// Local address the listener binds to
    pub bind_address: IpAddr,
    /// Random bytes per channel key (the key is hex, so twice as many chars)
    pub key_length: usize,
    /// How long `open` waits for the peer to dial in
    pub pending_connection_timeout_ms: u64,
    /// Upper bound on establishing an outbound WebSocket
    pub dial_timeout_ms: u64,
    /// Service that echoes the caller's public address
    pub address_echo_url: String,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            port: 9010,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            key_length: 16,
            pending_connection_timeout_ms: 10_000, // 10 seconds
            dial_timeout_ms: 5_000,
            address_echo_url: "https://api.ipify.org".to_string(),
        }
    }
}

impl FerryConfig {
    /// Loopback-only listener on an ephemeral port with short timeouts
    pub fn testing() -> Self {
        Self {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            pending_connection_timeout_ms: 2_000,
            dial_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    /// Pending-connection timeout as a `Duration`
    pub fn pending_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_connection_timeout_ms)
    }

    /// Dial timeout as a `Duration`
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Load configuration from a `.toml` or `.json` file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FerryError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| FerryError::configuration(format!("Invalid JSON: {e}")))?,
            _ => {
                return Err(FerryError::configuration(format!(
                    "Unsupported config format: {}",
                    path.display()
                )))
            }
        };

        tracing::debug!(path = %path.display(), "Loaded ferry configuration");
        Ok(config)
    }

    /// Overlay `FERRY_*` environment variables
    pub fn merge_with_env(&mut self) -> Result<()> {
        if let Some(port) = env_parse("FERRY_PORT")? {
            self.port = port;
        }
        if let Some(bind_address) = env_parse("FERRY_BIND_ADDRESS")? {
            self.bind_address = bind_address;
        }
        if let Some(key_length) = env_parse("FERRY_KEY_LENGTH")? {
            self.key_length = key_length;
        }
        if let Some(timeout) = env_parse("FERRY_PENDING_CONNECTION_TIMEOUT_MS")? {
            self.pending_connection_timeout_ms = timeout;
        }
        if let Some(timeout) = env_parse("FERRY_DIAL_TIMEOUT_MS")? {
            self.dial_timeout_ms = timeout;
        }
        if let Ok(url) = std::env::var("FERRY_ADDRESS_ECHO_URL") {
            self.address_echo_url = url;
        }
        Ok(())
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.key_length < MIN_KEY_LENGTH {
            return Err(FerryError::configuration(format!(
                "key_length must be at least {MIN_KEY_LENGTH} bytes (got {})",
                self.key_length
            )));
        }

        if self.pending_connection_timeout_ms == 0 {
            return Err(FerryError::configuration(
                "pending_connection_timeout_ms must be greater than 0",
            ));
        }

        if self.dial_timeout_ms == 0 {
            return Err(FerryError::configuration(
                "dial_timeout_ms must be greater than 0",
            ));
        }

        let echo = url::Url::parse(&self.address_echo_url).map_err(|e| {
            FerryError::configuration(format!("address_echo_url is not a URL: {e}"))
        })?;
        if !matches!(echo.scheme(), "http" | "https") {
            return Err(FerryError::configuration(format!(
                "address_echo_url must be http(s), got {}",
                echo.scheme()
            )));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FerryError::configuration(format!("Invalid value in {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

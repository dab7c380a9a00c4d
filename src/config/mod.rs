//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `beacon` binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BeaconError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Device identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Public IP lookup configuration
    #[serde(default)]
    pub ip_lookup: IpLookupConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BeaconError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| BeaconError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `BEACON_*` environment variables on top of this config
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("BEACON_SERVER_URL") {
            self.session.server_url = url;
        }
        if let Ok(key) = std::env::var("BEACON_API_KEY") {
            self.session.api_key = key;
        }
        if let Ok(device_type) = std::env::var("BEACON_DEVICE_TYPE") {
            self.session.device_type = device_type;
        }
        if let Ok(val) = std::env::var("BEACON_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = val.parse() {
                self.session.heartbeat_interval_ms = val;
            }
        }
        if let Ok(val) = std::env::var("BEACON_STATUS_REPORT_INTERVAL_MS") {
            if let Ok(val) = val.parse() {
                self.session.status_report_interval_ms = val;
            }
        }
        if let Ok(path) = std::env::var("BEACON_IDENTITY_PATH") {
            self.identity.path = Some(PathBuf::from(path));
        }

        self
    }

    /// Reject configurations the session cannot run with
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;

        if session.server_url.trim().is_empty() {
            return Err(BeaconError::Config("server_url must not be empty".to_string()));
        }
        if session.heartbeat_interval_ms == 0 {
            return Err(BeaconError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if session.status_report_interval_ms == 0 || session.max_status_report_interval_ms == 0 {
            return Err(BeaconError::Config(
                "status report intervals must be positive".to_string(),
            ));
        }
        if session.reconnect_base_delay_ms == 0 {
            return Err(BeaconError::Config(
                "reconnect_base_delay_ms must be positive".to_string(),
            ));
        }
        if session.reconnect_base_delay_ms > session.reconnect_max_delay_ms {
            return Err(BeaconError::Config(format!(
                "reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                session.reconnect_base_delay_ms, session.reconnect_max_delay_ms
            )));
        }
        if self.ip_lookup.timeout_ms == 0 {
            return Err(BeaconError::Config("ip_lookup.timeout_ms must be positive".to_string()));
        }

        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Control server base URL (e.g., wss://control.example.com/ws)
    pub server_url: String,

    /// API key appended to the connection URI
    pub api_key: String,

    /// Declared device type
    pub device_type: String,

    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Initial status report period in milliseconds
    pub status_report_interval_ms: u64,

    /// Upper bound applied to server-pushed status report periods
    pub max_status_report_interval_ms: u64,

    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: u64,

    /// Give up reconnecting after this many attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,

    /// Opening handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            api_key: String::new(),
            device_type: "android".to_string(),
            heartbeat_interval_ms: 30_000,
            status_report_interval_ms: 300_000,
            max_status_report_interval_ms: 3_600_000, // 1 hour
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: None,
            connect_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Initial status report period
    pub fn status_report_interval(&self) -> Duration {
        Duration::from_millis(self.status_report_interval_ms)
    }

    /// Cap for server-pushed status report periods
    pub fn max_status_report_interval(&self) -> Duration {
        Duration::from_millis(self.max_status_report_interval_ms)
    }

    /// Opening handshake timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Build the transport target for a device.
    ///
    /// Query parameter names and order are fixed by the server.
    pub fn connection_uri(&self, device_id: &str) -> String {
        format!(
            "{}?deviceId={}&deviceType={}&apiKey={}",
            self.server_url,
            urlencoding::encode(device_id),
            urlencoding::encode(&self.device_type),
            urlencoding::encode(&self.api_key)
        )
    }
}

/// Device identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Namespace prefixed to the identity key
    pub namespace: String,

    /// Identity file location (None = platform data dir)
    pub path: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            namespace: "proxy_sdk".to_string(),
            path: None,
        }
    }
}

impl IdentityConfig {
    /// Resolved identity file location
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("beacon")
                .join("identity.json")
        })
    }
}

/// Public IP lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpLookupConfig {
    /// Plain-text IP echo endpoint
    pub url: String,

    /// Lookup timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for IpLookupConfig {
    fn default() -> Self {
        Self {
            url: "https://api.ipify.org?format=text".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl IpLookupConfig {
    /// Lookup timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

//! Public IP lookup.
//!
//! The lookup is best effort: callers go through [`lookup_or_unknown`], which
//! bounds it in time and substitutes [`UNKNOWN_IP`] on any failure.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::IpLookupConfig;
use crate::error::{BeaconError, Result};

/// Sentinel reported when the public IP is not known
pub const UNKNOWN_IP: &str = "unknown";

/// Source of the device's public IP address
pub trait IpLookup: Send + Sync {
    /// Resolve the public IP. May fail or hang; callers bound it.
    fn lookup(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// Plain-text IP echo service over HTTP (e.g. ipify)
#[derive(Debug, Clone)]
pub struct HttpIpLookup {
    client: reqwest::Client,
    url: String,
}

impl HttpIpLookup {
    /// Create a lookup against the configured endpoint
    pub fn new(config: &IpLookupConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Endpoint queried by this lookup
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl IpLookup for HttpIpLookup {
    fn lookup(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            let body = self
                .client
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            let ip = body.trim();
            if ip.is_empty() {
                return Err(BeaconError::IpLookup(format!("empty response from {}", self.url)));
            }
            Ok(ip.to_string())
        })
    }
}

/// Fixed answer, for tests and deployments that know their address
#[derive(Debug, Clone, Default)]
pub struct StaticIpLookup {
    ip: Option<String>,
}

impl StaticIpLookup {
    /// Always resolve to `ip`
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
        }
    }

    /// Always fail
    pub fn unavailable() -> Self {
        Self { ip: None }
    }
}

impl IpLookup for StaticIpLookup {
    fn lookup(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let ip = self.ip.clone();
        Box::pin(async move {
            ip.ok_or_else(|| BeaconError::IpLookup("no static address configured".to_string()))
        })
    }
}

/// Resolve the public IP within `timeout`, falling back to [`UNKNOWN_IP`]
pub async fn lookup_or_unknown(lookup: &dyn IpLookup, timeout: Duration) -> String {
    match tokio::time::timeout(timeout, lookup.lookup()).await {
        Ok(Ok(ip)) => ip,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Public IP lookup failed");
            UNKNOWN_IP.to_string()
        },
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Public IP lookup timed out");
            UNKNOWN_IP.to_string()
        },
    }
}

//! Configuration types for the relay client.

use crate::error::{ClientError, ClientResult};
use std::time::Duration;
use url::Url;

/// Path of the tunnel endpoint on the relay host.
pub const TUNNEL_PATH: &str = "/connect";

/// Configuration for the relay client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server URL (`ws`, `wss`, `http` or `https`).
    pub relay_url: Url,
    /// Subdomain to ask for on first connect.
    pub subdomain: Option<String>,
    /// Bearer token agents must present on the public endpoint.
    pub access_token: Option<String>,
    /// Shared secret some relays require before accepting a tunnel.
    pub registration_secret: Option<String>,
    /// Bound on dialing plus the hello/welcome exchange.
    pub connect_timeout: Duration,
    /// Drop the tunnel after this long without hearing from the relay.
    pub idle_timeout: Duration,
    /// Reconnect behavior.
    pub retry_config: RetryConfig,
}

impl ClientConfig {
    /// Create a new configuration for the given relay.
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            subdomain: None,
            access_token: None,
            registration_secret: None,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            retry_config: RetryConfig::default(),
        }
    }

    /// Parse the relay URL and build a configuration for it.
    pub fn parse(relay_url: &str) -> ClientResult<Self> {
        Ok(Self::new(Url::parse(relay_url)?))
    }

    /// WebSocket URL of the relay's tunnel endpoint.
    ///
    /// `http(s)` schemes map to `ws(s)`; a bare host gets `/connect`.
    pub fn tunnel_url(&self) -> ClientResult<Url> {
        let mut url = self.relay_url.clone();

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ClientError::Config(format!(
                    "unsupported relay URL scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config("Failed to set WebSocket scheme".to_string()))?;

        if url.path().is_empty() || url.path() == "/" {
            url.set_path(TUNNEL_PATH);
        }

        Ok(url)
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum reconnect attempts per outage; `None` keeps trying.
    pub max_retries: Option<u32>,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a configuration that gives up after the first drop.
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        std::cmp::min(Duration::from_millis(backoff_ms as u64), self.max_backoff)
    }

    /// Whether attempt number `attempt` (0-based) may still be made.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }
}

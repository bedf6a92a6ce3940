use crate::registry::{InMemoryRouteTable, RouteTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Tenants live at `<subdomain>.<base_domain>`
    pub base_domain: String,

    /// Scheme used when announcing public URLs
    pub public_scheme: String,

    /// Port appended to announced public URLs, if not the scheme default
    pub public_port: Option<u16>,

    /// How long an agent request may wait on the relay client
    pub request_timeout_secs: u64,

    /// How long a subdomain stays reserved after its client disconnects
    pub lease_secs: u64,

    pub handshake_timeout_secs: u64,

    /// Interval between server pings on the tunnel
    pub keepalive_secs: u64,

    pub max_pending_per_tenant: usize,

    /// Open agent sessions (SSE, WebSocket, HTTP) allowed per tenant
    pub max_streams_per_tenant: usize,

    /// How long an `Mcp-Session-Id` session may sit unused before it is dropped
    pub session_idle_secs: u64,

    /// Shared secret relay clients must present, if set
    pub registration_secret: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            public_scheme: "https".to_string(),
            public_port: None,
            request_timeout_secs: 120,
            lease_secs: 300,
            handshake_timeout_secs: 10,
            keepalive_secs: 30,
            max_pending_per_tenant: 64,
            max_streams_per_tenant: 256,
            session_idle_secs: 600,
            registration_secret: None,
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file, or use defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse configuration file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_domain.trim().is_empty() {
            anyhow::bail!("base_domain must not be empty");
        }
        if self.request_timeout_secs == 0
            || self.handshake_timeout_secs == 0
            || self.keepalive_secs == 0
            || self.session_idle_secs == 0
        {
            anyhow::bail!("timeouts and keepalive interval must be positive");
        }
        if self.max_pending_per_tenant == 0 || self.max_streams_per_tenant == 0 {
            anyhow::bail!("per-tenant limits must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Public origin for a tenant
    pub fn public_url(&self, subdomain: &str) -> String {
        match self.public_port {
            Some(port) => format!(
                "{}://{}.{}:{}",
                self.public_scheme, subdomain, self.base_domain, port
            ),
            None => format!("{}://{}.{}", self.public_scheme, subdomain, self.base_domain),
        }
    }

    /// Extract the tenant label from a `Host` header value
    ///
    /// Only a single label directly under the base domain names a tenant.
    pub fn tenant_from_host(&self, host: &str) -> Option<String> {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host,
        };

        let suffix = format!(".{}", self.base_domain.to_ascii_lowercase());
        let label = host.strip_suffix(&suffix)?;
        if is_valid_label(label) {
            Some(label.to_string())
        } else {
            None
        }
    }
}

/// A DNS label we are willing to hand out as a subdomain
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub routes: Arc<dyn RouteTable>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_routes(config, Arc::new(InMemoryRouteTable::new()))
    }

    /// Use an externally provided route table
    pub fn with_routes(config: RelayConfig, routes: Arc<dyn RouteTable>) -> Self {
        Self {
            config: Arc::new(config),
            routes,
        }
    }
}

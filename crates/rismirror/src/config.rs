//! Configuration file support for ris-mirror
//!
//! Loads and validates the mirror configuration from TOML files.
//! Default location: /etc/ris-mirror/ris-mirror.toml

use crate::error::{MirrorError, Result};
use ris_types::{IpAddress, RouteDistinguisher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ris-mirror/ris-mirror.toml";

/// Feed connection behaviour shared by every upstream source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay in milliseconds, doubled on each failure
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    /// Upper bound of the reconnect delay in seconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,

    /// Purge a disconnected feed's routes after this many seconds (0 = never)
    #[serde(default)]
    pub stale_route_timeout_secs: u64,

    /// Ask upstream for its RIB even before it is fully converged
    #[serde(default = "default_allow_unready_rib")]
    pub allow_unready_rib: bool,

    /// Buffered change notifications per merged table
    #[serde(default = "default_change_channel_capacity")]
    pub change_channel_capacity: usize,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

/// One mirrored router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    pub address: IpAddress,
    /// Upstream feed endpoints, each believed to observe this router
    pub sources: Vec<String>,
    /// VRFs to mirror; defaults to the global table
    #[serde(default = "default_vrfs")]
    pub vrfs: Vec<RouteDistinguisher>,
}

/// Complete ris-mirror configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub routers: Vec<RouterConfig>,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_retry_initial_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30
}

fn default_allow_unready_rib() -> bool {
    true
}

fn default_change_channel_capacity() -> usize {
    4096
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_vrfs() -> Vec<RouteDistinguisher> {
    vec![RouteDistinguisher::default()]
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            stale_route_timeout_secs: 0,
            allow_unready_rib: default_allow_unready_rib(),
            change_channel_capacity: default_change_channel_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    /// `None` when the staleness purge is disabled
    pub fn stale_route_timeout(&self) -> Option<Duration> {
        (self.stale_route_timeout_secs > 0).then(|| Duration::from_secs(self.stale_route_timeout_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            return Err(MirrorError::Config(
                "connect_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.retry_initial_delay_ms == 0 {
            return Err(MirrorError::Config(
                "retry_initial_delay_ms must be > 0".to_string(),
            ));
        }

        if self.retry_initial_delay() > self.retry_max_delay() {
            return Err(MirrorError::Config(
                "retry_initial_delay_ms must not exceed retry_max_delay_secs".to_string(),
            ));
        }

        if self.change_channel_capacity == 0 {
            return Err(MirrorError::Config(
                "change_channel_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl MirrorConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                MirrorError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(MirrorError::Io(e)),
        }
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.feed.validate()?;

        let mut names = HashSet::new();
        for router in &self.routers {
            if router.name.is_empty() {
                return Err(MirrorError::Config("router name must not be empty".to_string()));
            }

            if !names.insert(router.name.as_str()) {
                return Err(MirrorError::Config(format!(
                    "router {} configured more than once",
                    router.name
                )));
            }

            if router.sources.is_empty() {
                return Err(MirrorError::Config(format!(
                    "router {} has no sources",
                    router.name
                )));
            }
        }

        Ok(())
    }
}

//! Configuration for the causeway engine

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main engine configuration
///
/// The configuration file uses TOML format:
///
/// ```toml
/// [session]
/// session_timeout_secs = 3600
/// cleanup_interval_secs = 30
/// heartbeat_interval_secs = 600
/// server_version = "0.4.2"
///
/// [udp]
/// udp_timeout_secs = 120
/// worker_max_count = 32
/// shared_pool = false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,

    /// UDP proxy pool settings
    #[serde(default)]
    pub udp: UdpConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.session.session_timeout_secs == 0 {
            return Err(Error::Config("session_timeout_secs must be non-zero".into()));
        }
        if self.session.cleanup_interval_secs == 0 {
            return Err(Error::Config(
                "cleanup_interval_secs must be non-zero".into(),
            ));
        }
        if self.session.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "heartbeat_interval_secs must be non-zero".into(),
            ));
        }
        if self.udp.udp_timeout_secs == 0 {
            return Err(Error::Config("udp_timeout_secs must be non-zero".into()));
        }
        if self.udp.worker_max_count == 0 {
            return Err(Error::Config("worker_max_count must be at least 1".into()));
        }

        let version_parts = self.session.server_version.split('.').count();
        let version_ok = version_parts == 3
            && self
                .session
                .server_version
                .split('.')
                .all(|part| part.parse::<u32>().is_ok());
        if !version_ok {
            return Err(Error::Config(format!(
                "server_version must be a three-part version, got {:?}",
                self.session.server_version
            )));
        }

        Ok(())
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are reclaimed by cleanup
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Cadence of the cleanup job
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Minimum spacing between heartbeat events
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Three-part server version reported in analytics
    #[serde(default = "default_server_version")]
    pub server_version: String,
}

impl SessionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            server_version: default_server_version(),
        }
    }
}

/// UDP proxy pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Idle timeout for proxy workers and flow mappings
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,

    /// Maximum proxy workers per pool
    #[serde(default = "default_worker_max_count")]
    pub worker_max_count: usize,

    /// Use one server-wide pool instead of a pool per session
    #[serde(default)]
    pub shared_pool: bool,
}

impl UdpConfig {
    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            udp_timeout_secs: default_udp_timeout(),
            worker_max_count: default_worker_max_count(),
            shared_pool: false,
        }
    }
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    600
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_udp_timeout() -> u64 {
    120
}

fn default_worker_max_count() -> usize {
    32
}

//! WolfHA Configuration
//!
//! Startup configuration for a route leadership node. Every value is
//! read once at startup and stays fixed for the node's lifetime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::lifecycle::LifecycleConfig;
use crate::registration::RegistrationConfig;
use crate::state::ElectionConfig;

/// Main WolfHA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfHaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Consensus cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Election tuning
    #[serde(default)]
    pub election: ElectionSection,

    /// Route lifecycle configuration
    #[serde(default)]
    pub lifecycle: LifecycleSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Namespace the node coordinates in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Routes this node contends for
    #[serde(default)]
    pub routes: Vec<String>,
}

/// Consensus cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Consensus service peer addresses
    #[serde(default)]
    pub peers: Vec<String>,

    /// Session timeout in milliseconds (missed keep-alives expire the session)
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Upper bound for a single lock request in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Upper bound for a single join attempt in milliseconds
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Attempts before a join or subscription is reported as failed
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Initial retry backoff in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Election tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// Maximum random delay before re-contending after a release
    #[serde(default = "default_contention_jitter_ms")]
    pub contention_jitter_ms: u64,

    /// Maximum random delay before a node that stepped down contends again
    #[serde(default = "default_step_down_holdoff_ms")]
    pub step_down_holdoff_ms: u64,

    /// Per-route event buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Route lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSection {
    /// Grace period for route activation and drain in milliseconds
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_namespace() -> String {
    "default".to_string()
}

fn default_session_timeout_ms() -> u64 {
    3000
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    2000
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2000
}

fn default_contention_jitter_ms() -> u64 {
    50
}

fn default_step_down_holdoff_ms() -> u64 {
    200
}

fn default_event_buffer() -> usize {
    16
}

fn default_drain_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            session_timeout_ms: default_session_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for ElectionSection {
    fn default() -> Self {
        Self {
            contention_jitter_ms: default_contention_jitter_ms(),
            step_down_holdoff_ms: default_step_down_holdoff_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WolfHaConfig {
    /// Build a configuration for a node with every other value defaulted
    pub fn for_node(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                namespace: namespace.into(),
                routes: Vec::new(),
            },
            cluster: ClusterConfig::default(),
            election: ElectionSection::default(),
            lifecycle: LifecycleSection::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfHaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.namespace.is_empty() {
            return Err(crate::Error::Config("node.namespace cannot be empty".into()));
        }

        if self.node.routes.iter().any(|r| r.is_empty()) {
            return Err(crate::Error::Config("node.routes cannot contain empty names".into()));
        }

        if self.cluster.session_timeout_ms == 0 {
            return Err(crate::Error::Config("cluster.session_timeout_ms must be positive".into()));
        }

        if self.cluster.connect_attempts == 0 {
            return Err(crate::Error::Config("cluster.connect_attempts must be at least 1".into()));
        }

        if self.cluster.backoff_base_ms > self.cluster.backoff_max_ms {
            return Err(crate::Error::Config(
                "cluster.backoff_base_ms cannot exceed cluster.backoff_max_ms".into(),
            ));
        }

        if self.election.event_buffer == 0 {
            return Err(crate::Error::Config("election.event_buffer must be at least 1".into()));
        }

        Ok(())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.session_timeout_ms)
    }

    /// Get lock timeout as Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.lock_timeout_ms)
    }

    /// Get drain grace period as Duration
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.lifecycle.drain_grace_ms)
    }

    /// Settings for joining the namespace group
    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            join_timeout: Duration::from_millis(self.cluster.join_timeout_ms),
            connect_attempts: self.cluster.connect_attempts,
            backoff_base: Duration::from_millis(self.cluster.backoff_base_ms),
            backoff_max: Duration::from_millis(self.cluster.backoff_max_ms),
            session_timeout: self.session_timeout(),
        }
    }

    /// Settings for the election engine
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            lock_timeout: self.lock_timeout(),
            subscribe_attempts: self.cluster.connect_attempts,
            backoff_base: Duration::from_millis(self.cluster.backoff_base_ms),
            backoff_max: Duration::from_millis(self.cluster.backoff_max_ms),
            contention_jitter: Duration::from_millis(self.election.contention_jitter_ms),
            step_down_holdoff: Duration::from_millis(self.election.step_down_holdoff_ms),
            event_buffer: self.election.event_buffer,
        }
    }

    /// Settings for the lifecycle controller
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            grace_period: self.drain_grace(),
        }
    }
}

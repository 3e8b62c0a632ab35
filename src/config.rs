//! Connector configuration loaded from TOML
//!
//! Timing values are plain milliseconds in the file and become
//! [`std::time::Duration`]s in [`ConnectorSettings`]. Passwords are either
//! inline or, preferably, read from the environment variable named by
//! `password_env` when the nodes are resolved.

use crate::connector::nodes::{BrokerNode, Credentials, TrustLevel, DEFAULT_VHOST};
use crate::connector::shutdown::DrainPolicy;
use crate::connector::ConnectorSettings;
use crate::message::{DEFAULT_FALLBACK_EXCHANGE, EMERGENCY_ROUTING_KEY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherConfig {
    #[serde(default)]
    pub connector: ConnectorSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    #[serde(default)]
    pub nodes: Vec<NodeSection>,
}

/// Failover and publishing behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorSection {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Full sweeps over all nodes before giving up
    #[serde(default = "default_max_sweeps")]
    pub max_sweeps: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,
    #[serde(default = "default_fallback_exchange")]
    pub fallback_exchange: String,
    #[serde(default = "default_emergency_routing_key")]
    pub emergency_routing_key: String,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_sweeps: default_max_sweeps(),
            connection_timeout_ms: default_connection_timeout_ms(),
            publish_batch_size: default_publish_batch_size(),
            fallback_exchange: default_fallback_exchange(),
            emergency_routing_key: default_emergency_routing_key(),
        }
    }
}

/// Graceful-finish tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownSection {
    #[serde(default = "default_drain_check_interval_ms")]
    pub drain_check_interval_ms: u64,
    #[serde(default = "default_max_stagnant_checks")]
    pub max_stagnant_checks: u32,
    /// Hard cap on drain checks; unlimited when absent
    pub max_drain_checks: Option<u32>,
    #[serde(default = "default_force_close_timeout_ms")]
    pub force_close_timeout_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_check_interval_ms: default_drain_check_interval_ms(),
            max_stagnant_checks: default_max_stagnant_checks(),
            max_drain_checks: None,
            force_close_timeout_ms: default_force_close_timeout_ms(),
        }
    }
}

/// Priority as written in the file: `priority = 2` or `priority = "2"`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PriorityValue {
    Number(u64),
    Text(String),
}

impl PriorityValue {
    pub fn as_text(&self) -> String {
        match self {
            PriorityValue::Number(n) => n.to_string(),
            PriorityValue::Text(s) => s.clone(),
        }
    }
}

/// One `[[nodes]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    pub host: String,
    pub port: Option<u16>,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    pub username: String,
    /// Inline password; prefer `password_env`
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
    pub exchange: String,
    #[serde(default = "default_trust")]
    pub trust: TrustLevel,
    pub priority: Option<PriorityValue>,
    #[serde(default)]
    pub tls: bool,
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

fn default_max_sweeps() -> u32 {
    5
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_publish_batch_size() -> usize {
    100
}

fn default_fallback_exchange() -> String {
    DEFAULT_FALLBACK_EXCHANGE.to_string()
}

fn default_emergency_routing_key() -> String {
    EMERGENCY_ROUTING_KEY.to_string()
}

fn default_drain_check_interval_ms() -> u64 {
    500
}

fn default_max_stagnant_checks() -> u32 {
    10
}

fn default_force_close_timeout_ms() -> u64 {
    2_000
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_string()
}

fn default_trust() -> TrustLevel {
    TrustLevel::Trusted
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PublisherConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PublisherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::InvalidConfig(message));

        if self.nodes.is_empty() {
            return invalid("at least one [[nodes]] entry is required".to_string());
        }
        if self.connector.max_sweeps == 0 {
            return invalid("connector.max_sweeps must be greater than 0".to_string());
        }
        if self.connector.connection_timeout_ms == 0 {
            return invalid("connector.connection_timeout_ms must be greater than 0".to_string());
        }
        if self.connector.publish_batch_size == 0 {
            return invalid("connector.publish_batch_size must be greater than 0".to_string());
        }
        if self.connector.fallback_exchange.trim().is_empty() {
            return invalid("connector.fallback_exchange must not be empty".to_string());
        }
        if self.connector.emergency_routing_key.trim().is_empty() {
            return invalid("connector.emergency_routing_key must not be empty".to_string());
        }
        if self.shutdown.drain_check_interval_ms == 0 {
            return invalid("shutdown.drain_check_interval_ms must be greater than 0".to_string());
        }
        if self.shutdown.max_stagnant_checks == 0 {
            return invalid("shutdown.max_stagnant_checks must be greater than 0".to_string());
        }
        if self.shutdown.max_drain_checks == Some(0) {
            return invalid("shutdown.max_drain_checks must be greater than 0 when set".to_string());
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if node.host.trim().is_empty() {
                return invalid(format!("nodes[{index}].host must not be empty"));
            }
            if node.exchange.trim().is_empty() {
                return invalid(format!("nodes[{index}].exchange must not be empty"));
            }
            if node.username.is_empty() {
                return invalid(format!("nodes[{index}].username must not be empty"));
            }
            if node.password.is_none() && node.password_env.is_none() {
                return invalid(format!(
                    "nodes[{index}] needs either password or password_env"
                ));
            }
        }

        Ok(())
    }

    /// Runtime settings for the connector
    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            reconnect_delay: Duration::from_millis(self.connector.reconnect_delay_ms),
            max_sweeps: self.connector.max_sweeps,
            connection_timeout: Duration::from_millis(self.connector.connection_timeout_ms),
            publish_batch_size: self.connector.publish_batch_size,
            fallback_exchange: self.connector.fallback_exchange.clone(),
            emergency_routing_key: self.connector.emergency_routing_key.clone(),
            drain: DrainPolicy {
                check_interval: Duration::from_millis(self.shutdown.drain_check_interval_ms),
                max_stagnant_checks: self.shutdown.max_stagnant_checks,
                max_checks: self.shutdown.max_drain_checks,
                force_close_timeout: Duration::from_millis(self.shutdown.force_close_timeout_ms),
            },
        }
    }

    /// Build broker nodes, reading passwords from the environment where configured
    pub fn resolve_nodes(&self) -> Result<Vec<BrokerNode>, ConfigError> {
        self.nodes.iter().map(NodeSection::resolve).collect()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connector]
reconnect_delay_ms = 10

[[nodes]]
host = "localhost"
username = "guest"
password = "guest"
exchange = "rabbitsender_integration_exchange"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

impl NodeSection {
    fn resolve(&self) -> Result<BrokerNode, ConfigError> {
        let password = match (&self.password_env, &self.password) {
            (Some(var), _) => get_env_var_required(var)?,
            (None, Some(password)) => password.clone(),
            (None, None) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "node {} has no password",
                    self.host
                )))
            }
        };

        let mut node = BrokerNode::new(
            Credentials::new(self.username.clone(), password),
            self.host.clone(),
            self.exchange.clone(),
            self.trust,
        )
        .with_vhost(self.vhost.clone())
        .with_tls(self.tls);

        if let Some(port) = self.port {
            node = node.with_port(port);
        }
        if let Some(priority) = &self.priority {
            node = node.with_priority(priority.as_text());
        }
        Ok(node)
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

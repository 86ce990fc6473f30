//! Cluster State Configuration
//!
//! Configuration structures for a node taking part in the cluster, loaded
//! from TOML, plus the validation rules a clustered node must satisfy
//! before it is allowed to start.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::state::NodeType;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Software version announced to the cluster
    #[serde(default = "default_software_version")]
    pub software_version: String,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node type ("application" or "search"), mandatory in cluster mode
    #[serde(rename = "type", default)]
    pub node_type: Option<String>,

    /// Host other members use to reach this node
    #[serde(default)]
    pub host: Option<String>,

    /// Cluster communication port
    #[serde(default = "default_node_port")]
    pub port: u16,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Run as part of a cluster
    #[serde(default)]
    pub enabled: bool,

    /// Name every node of the cluster must share
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Addresses of the cluster members (host:port)
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Addresses of the search nodes (host:port)
    #[serde(default)]
    pub search_hosts: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_node_port() -> u16 {
    9003
}

fn default_cluster_name() -> String {
    "clusterstate".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_software_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ClusterStateConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            cluster: ClusterConfig::default(),
            logging: LoggingConfig::default(),
            software_version: default_software_version(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_type: None,
            host: None,
            port: default_node_port(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_cluster_name(),
            hosts: Vec::new(),
            search_hosts: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterStateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClusterStateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(Error::Config(format!(
                "logging.format must be one of [pretty, json], got [{}]",
                self.logging.format
            )));
        }

        if self.software_version.trim().is_empty() {
            return Err(Error::Config("software_version cannot be empty".into()));
        }

        if !self.cluster.enabled {
            return Ok(());
        }

        let node_type = self.node_type()?;

        if self.cluster.name.trim().is_empty() {
            return Err(Error::Config("cluster.name cannot be empty".into()));
        }

        if self.cluster.hosts.is_empty() {
            return Err(Error::Config("cluster.hosts cannot be empty".into()));
        }

        let host = self.node.host.as_deref().map(str::trim).unwrap_or("");
        if host.is_empty() {
            return Err(Error::Config(
                "node.host is mandatory when cluster.enabled is true".into(),
            ));
        }
        if is_loopback(host) {
            return Err(Error::Config(format!(
                "node.host must not be a loopback address: [{}]",
                host
            )));
        }

        if node_type == NodeType::Application && self.cluster.search_hosts.is_empty() {
            return Err(Error::Config(
                "cluster.search_hosts cannot be empty for application nodes".into(),
            ));
        }

        Ok(())
    }

    /// Parsed node type. Mandatory in cluster mode.
    pub fn node_type(&self) -> Result<NodeType> {
        match self.node.node_type.as_deref().map(str::trim) {
            None | Some("") => Err(Error::Config(format!(
                "Property node.type is mandatory when cluster.enabled is true, allowed values are [{}]",
                NodeType::ALLOWED.join(", ")
            ))),
            Some(value) => value.parse(),
        }
    }

    /// Address advertised to other members (host:port)
    pub fn node_address(&self) -> String {
        let host = self.node.host.as_deref().unwrap_or("127.0.0.1");
        format!("{}:{}", host, self.node.port)
    }
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

//! Process and Node Identifiers
//!
//! Identifiers shared by every node of the cluster: which node, which
//! sub-process role, and which kind of node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique identifier the substrate assigns to a running process instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Sub-process roles coordinated across the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcessId {
    /// Search index
    Search,
    /// Web server
    WebServer,
    /// Background compute engine
    ComputeEngine,
}

impl ProcessId {
    pub const ALL: [ProcessId; 3] = [
        ProcessId::Search,
        ProcessId::WebServer,
        ProcessId::ComputeEngine,
    ];

    /// Stable short key
    pub fn key(&self) -> &'static str {
        match self {
            ProcessId::Search => "search",
            ProcessId::WebServer => "web",
            ProcessId::ComputeEngine => "ce",
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Search => write!(f, "SEARCH"),
            ProcessId::WebServer => write!(f, "WEB_SERVER"),
            ProcessId::ComputeEngine => write!(f, "COMPUTE_ENGINE"),
        }
    }
}

/// One process role on one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterProcessKey {
    pub node_id: NodeId,
    pub process_id: ProcessId,
}

impl ClusterProcessKey {
    pub fn new(node_id: NodeId, process_id: ProcessId) -> Self {
        Self { node_id, process_id }
    }
}

impl fmt::Display for ClusterProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.process_id.key())
    }
}

/// Kind of node, as configured by `node.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Runs the web server and compute engine
    Application,
    /// Runs the search index only
    Search,
}

impl NodeType {
    pub const ALLOWED: [&'static str; 2] = ["application", "search"];

    pub fn value(&self) -> &'static str {
        match self {
            NodeType::Application => "application",
            NodeType::Search => "search",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "application" => Ok(NodeType::Application),
            "search" => Ok(NodeType::Search),
            _ => Err(Error::Config(format!(
                "Invalid value for property node.type: [{}], only [{}] are allowed",
                s,
                NodeType::ALLOWED.join(", ")
            ))),
        }
    }
}

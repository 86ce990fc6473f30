//! Cluster State - Application State Coordination for Clustered Nodes
//!
//! Tracks which sub-processes are operational on every node of a cluster,
//! elects a single leader, and makes sure every node agrees on the cluster
//! name and software version before it serves traffic.
//!
//! # Architecture
//!
//! All cluster-wide state lives in a coordination substrate (distributed
//! lock, atomic references, replicated map, membership events). The
//! [`state::ClusterAppState`] facade composes:
//!
//! - an operational process tracker (local cache + replicated map + listeners)
//! - a leader elector (lock-protected double-checked write of the leader slot)
//! - a cluster identity guard (cluster name and software version)
//! - a membership change handler (cleanup when nodes leave)
//!
//! # Features
//!
//! - Exactly one leader per cluster lifetime, until every application node is gone
//! - Fail-fast identity checks on startup
//! - Departed nodes' processes flipped to non-operational, never deleted
//! - Fail-soft shutdown
//! - In-process substrate for tests and single-process deployments

pub mod config;
pub mod error;
pub mod logging;
pub mod state;
pub mod substrate;

pub use config::ClusterStateConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ClusterStateConfig;
    pub use crate::error::{Error, Result};
    pub use crate::state::{build_app_state, AppState, ClusterAppState, LocalAppState};
    pub use crate::state::{NodeId, NodeType, ProcessId};
    pub use crate::substrate::{InMemoryCluster, MembershipSubstrate};
}

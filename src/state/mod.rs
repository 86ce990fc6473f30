//! State Management Module
//!
//! Cluster-wide application state: which process roles are operational,
//! which node is leader, and the identity every node must agree on.

mod process;
mod tracker;
mod identity;
mod membership;
pub mod election;
pub mod app_state;

pub use process::{ClusterProcessKey, NodeId, NodeType, ProcessId};
pub use tracker::{OperationalListener, OperationalProcessTracker};
pub use identity::ClusterIdentityGuard;
pub use membership::MembershipChangeHandler;
pub use election::LeaderElector;
pub use app_state::{
    build_app_state, AppState, ClusterAppState, LocalAppState, SearchHealthReporter,
};

/// Name of the replicated map of operational processes
pub const OPERATIONAL_PROCESSES: &str = "operational_processes";

/// Name of the leader slot and of the lock guarding it
pub const LEADER_SLOT: &str = "leader";

/// Name of the cluster name slot and of the lock guarding it
pub const CLUSTER_NAME_SLOT: &str = "clusterName";

/// Name of the software version slot and of the lock guarding it
pub const SOFTWARE_VERSION_SLOT: &str = "softwareVersion";

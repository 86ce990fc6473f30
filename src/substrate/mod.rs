//! Membership Substrate
//!
//! The distributed-coordination primitives this crate rides on: a named
//! distributed lock, compare-and-set atomic references, a replicated map
//! with change notifications, and a membership event stream.
//!
//! Any clustering library able to supply these can back the cluster
//! state. [`memory`] provides an in-process implementation.

pub mod memory;
#[cfg(test)]
pub(crate) mod faulty;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::{ClusterProcessKey, NodeId, NodeType};

pub use memory::{InMemoryCluster, InMemoryNode};

/// Handle returned when registering a listener, used to unregister it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(uuid::Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live member of the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Substrate-assigned identifier
    pub id: NodeId,
    /// Reachable address (host:port)
    pub address: String,
    /// Node type attribute, if the member published one
    pub node_type: Option<NodeType>,
    /// When the member joined
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl Member {
    pub fn new(id: NodeId, address: String, node_type: Option<NodeType>) -> Self {
        Self {
            id,
            address,
            node_type,
            joined_at: chrono::Utc::now(),
        }
    }

    pub fn is_application(&self) -> bool {
        self.node_type == Some(NodeType::Application)
    }
}

/// A held distributed lock. Dropping it releases the lock.
pub trait ClusterLock: Send {
    /// Name of the locked resource
    fn name(&self) -> &str;
}

/// Cluster-wide atomic reference holding an optional string
#[async_trait]
pub trait AtomicRef: Send + Sync {
    async fn get(&self) -> Result<Option<String>>;

    /// Set to `update` if the current value equals `expect`
    async fn compare_and_set(&self, expect: Option<&str>, update: Option<&str>) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

/// Kind of change observed on a replicated map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
}

/// A change observed on a replicated map entry
#[derive(Debug, Clone)]
pub struct EntryEvent<K, V> {
    pub kind: EntryEventKind,
    pub key: K,
    /// New value, or the removed value for `Removed`
    pub value: V,
}

/// Callback invoked for every entry change, on the delivering task
pub type EntryListener<K, V> = Arc<dyn Fn(&EntryEvent<K, V>) + Send + Sync>;

/// Map replicated to every node, last-write-wins per key
#[async_trait]
pub trait ReplicatedMap<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn put(&self, key: K, value: V) -> Result<()>;

    async fn get(&self, key: &K) -> Result<Option<V>>;

    async fn remove(&self, key: &K) -> Result<Option<V>>;

    async fn entries(&self) -> Result<Vec<(K, V)>>;

    fn add_entry_listener(&self, listener: EntryListener<K, V>) -> Result<ListenerId>;

    fn remove_entry_listener(&self, id: ListenerId) -> Result<bool>;
}

/// Receiver of membership events
#[async_trait]
pub trait MembershipListener: Send + Sync {
    async fn member_added(&self, member: &Member);

    async fn member_removed(&self, member: &Member);
}

/// Connection of one node to the coordination substrate
#[async_trait]
pub trait MembershipSubstrate: Send + Sync {
    /// Identifier of this node, stable for the life of the process
    fn self_id(&self) -> NodeId;

    /// Acquire the named lock, waiting as long as it takes
    async fn acquire_lock(&self, name: &str) -> Result<Box<dyn ClusterLock>>;

    fn atomic_ref(&self, name: &str) -> Result<Arc<dyn AtomicRef>>;

    fn operational_map(&self, name: &str)
        -> Result<Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>>;

    /// Current live members, including this node
    async fn members(&self) -> Result<Vec<Member>>;

    fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) -> Result<ListenerId>;

    fn remove_membership_listener(&self, id: ListenerId) -> Result<bool>;

    fn is_running(&self) -> bool;

    /// Leave the cluster and close the connection
    async fn shutdown(&self) -> Result<()>;
}

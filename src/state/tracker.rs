//! Operational Process Tracker
//!
//! Tracks which process roles are up, both on this node (local cache) and
//! across the cluster (replicated operational map), and notifies registered
//! listeners whenever any node reports a process as operational.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::state::{ClusterProcessKey, NodeId, ProcessId};
use crate::substrate::{EntryEvent, EntryEventKind, ListenerId, ReplicatedMap};

/// Callback invoked with the process that became operational somewhere in the cluster
pub type OperationalListener = Arc<dyn Fn(ProcessId) + Send + Sync>;

/// Local and cluster-wide operational state of process roles
pub struct OperationalProcessTracker {
    /// This node's ID
    node_id: NodeId,
    /// Replicated map shared by all nodes
    map: Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>,
    /// What this node itself reported
    local: RwLock<HashMap<ProcessId, bool>>,
    /// Listeners registered by supervision code, in registration order
    listeners: Arc<RwLock<Vec<OperationalListener>>>,
    /// Registration of our entry listener on the replicated map
    map_listener: Mutex<Option<ListenerId>>,
}

impl OperationalProcessTracker {
    /// Create a tracker over the given replicated map
    pub fn new(node_id: NodeId, map: Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>) -> Self {
        Self {
            node_id,
            map,
            local: RwLock::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            map_listener: Mutex::new(None),
        }
    }

    /// Subscribe to replicated map changes. Calling it again is a no-op.
    pub fn attach(&self) -> Result<()> {
        let mut registration = self.map_listener.lock();
        if registration.is_some() {
            return Ok(());
        }

        let listeners = Arc::clone(&self.listeners);
        let id = self.map.add_entry_listener(Arc::new(
            move |event: &EntryEvent<ClusterProcessKey, bool>| {
                if event.kind == EntryEventKind::Removed || !event.value {
                    return;
                }
                // Snapshot so a listener may register further listeners
                let snapshot: Vec<OperationalListener> = listeners.read().clone();
                for listener in snapshot {
                    listener(event.key.process_id);
                }
            },
        ))?;
        *registration = Some(id);
        Ok(())
    }

    /// Unsubscribe from replicated map changes
    pub fn detach(&self) -> Result<bool> {
        match self.map_listener.lock().take() {
            Some(id) => self.map.remove_entry_listener(id),
            None => Ok(false),
        }
    }

    /// Register a listener, invoked after all previously registered ones
    pub fn add_listener(&self, listener: OperationalListener) {
        self.listeners.write().push(listener);
    }

    /// Mark a process role of this node as operational
    pub async fn set_operational(&self, process_id: ProcessId) -> Result<()> {
        self.local.write().insert(process_id, true);

        let key = ClusterProcessKey::new(self.node_id.clone(), process_id);
        self.map.put(key, true).await?;

        tracing::debug!("Process {} is operational on node {}", process_id, self.node_id);
        Ok(())
    }

    /// Whether this node reported the process as operational
    pub fn is_locally_operational(&self, process_id: ProcessId) -> bool {
        self.local.read().get(&process_id).copied().unwrap_or(false)
    }

    /// Whether the process is operational on this node (`local`) or on any node
    pub async fn is_operational(&self, process_id: ProcessId, local: bool) -> Result<bool> {
        if local {
            return Ok(self.is_locally_operational(process_id));
        }

        let entries = self.map.entries().await?;
        Ok(entries
            .iter()
            .any(|(key, up)| key.process_id == process_id && *up))
    }

    /// Processes this node has reported as operational
    pub fn local_snapshot(&self) -> Vec<ProcessId> {
        let local = self.local.read();
        let mut up: Vec<ProcessId> = local
            .iter()
            .filter(|(_, up)| **up)
            .map(|(p, _)| *p)
            .collect();
        up.sort();
        up
    }

    /// Remove every key this node owns from the replicated map
    pub async fn remove_local_entries(&self) -> Result<usize> {
        let mut removed = 0;
        for process_id in ProcessId::ALL {
            let key = ClusterProcessKey::new(self.node_id.clone(), process_id);
            if self.map.remove(&key).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{InMemoryCluster, MembershipSubstrate};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MAP: &str = "operational";

    async fn tracker_on(cluster: &InMemoryCluster, address: &str) -> OperationalProcessTracker {
        let node = cluster.join(address, None).await;
        let tracker =
            OperationalProcessTracker::new(node.self_id(), node.operational_map(MAP).unwrap());
        tracker.attach().unwrap();
        tracker
    }

    #[tokio::test]
    async fn test_local_vs_cluster_wide() {
        let cluster = InMemoryCluster::new();
        let a = tracker_on(&cluster, "10.0.0.1:9003").await;
        let b = tracker_on(&cluster, "10.0.0.2:9003").await;

        a.set_operational(ProcessId::Search).await.unwrap();

        assert!(a.is_operational(ProcessId::Search, true).await.unwrap());
        assert!(!b.is_operational(ProcessId::Search, true).await.unwrap());
        assert!(a.is_operational(ProcessId::Search, false).await.unwrap());
        assert!(b.is_operational(ProcessId::Search, false).await.unwrap());
        assert!(!b.is_operational(ProcessId::WebServer, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_listeners_run_in_order_on_every_node() {
        let cluster = InMemoryCluster::new();
        let a = tracker_on(&cluster, "10.0.0.1:9003").await;
        let b = tracker_on(&cluster, "10.0.0.2:9003").await;

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (name, tracker) in [("a1", &a), ("a2", &a), ("b1", &b)] {
            let order = Arc::clone(&order);
            tracker.add_listener(Arc::new(move |p: ProcessId| order.lock().push((name, p))));
        }

        a.set_operational(ProcessId::ComputeEngine).await.unwrap();

        let seen = order.lock().clone();
        assert_eq!(
            seen,
            vec![
                ("a1", ProcessId::ComputeEngine),
                ("a2", ProcessId::ComputeEngine),
                ("b1", ProcessId::ComputeEngine),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_operational_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let a = tracker_on(&cluster, "10.0.0.1:9003").await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        a.add_listener(Arc::new(move |_: ProcessId| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        a.set_operational(ProcessId::WebServer).await.unwrap();
        a.set_operational(ProcessId::WebServer).await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(a.local_snapshot(), vec![ProcessId::WebServer]);
    }

    #[tokio::test]
    async fn test_detach_stops_notifications() {
        let cluster = InMemoryCluster::new();
        let a = tracker_on(&cluster, "10.0.0.1:9003").await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        a.add_listener(Arc::new(move |_: ProcessId| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(a.detach().unwrap());
        assert!(!a.detach().unwrap());
        a.set_operational(ProcessId::Search).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_local_entries() {
        let cluster = InMemoryCluster::new();
        let a = tracker_on(&cluster, "10.0.0.1:9003").await;
        let b = tracker_on(&cluster, "10.0.0.2:9003").await;

        a.set_operational(ProcessId::Search).await.unwrap();
        a.set_operational(ProcessId::WebServer).await.unwrap();
        b.set_operational(ProcessId::Search).await.unwrap();

        assert_eq!(a.remove_local_entries().await.unwrap(), 2);
        assert!(!b.is_operational(ProcessId::WebServer, false).await.unwrap());
        assert!(b.is_operational(ProcessId::Search, false).await.unwrap());
    }
}

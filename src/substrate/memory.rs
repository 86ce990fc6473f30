//! In-Memory Substrate
//!
//! A substrate whose "cluster" lives inside one process. Every simulated
//! node gets its own [`InMemoryNode`] connection onto a shared hub, which
//! holds the locks, atomic references, replicated maps and member list.
//!
//! Events are delivered inline on the task that caused them, to the
//! listeners of every live node in registration order. Hub locks are
//! always released before a listener runs.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::state::{ClusterProcessKey, NodeId, NodeType};

use super::{
    AtomicRef, ClusterLock, EntryEvent, EntryEventKind, EntryListener, ListenerId, Member,
    MembershipListener, MembershipSubstrate, ReplicatedMap,
};

type OperationalEntries = SharedMap<ClusterProcessKey, bool>;
type MembershipRegistration = (ListenerId, NodeId, Arc<dyn MembershipListener>);

/// Liveness of one node's connection
struct NodeHandle {
    id: NodeId,
    running: AtomicBool,
}

impl NodeHandle {
    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::SubstrateInactive)
        }
    }
}

/// Shared state of the simulated cluster
struct Hub {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    refs: RwLock<HashMap<String, Option<String>>>,
    maps: parking_lot::Mutex<HashMap<String, Arc<OperationalEntries>>>,
    members: RwLock<Vec<Member>>,
    nodes: parking_lot::RwLock<HashMap<NodeId, Arc<NodeHandle>>>,
    membership_listeners: parking_lot::RwLock<Vec<MembershipRegistration>>,
    /// Upper bound of scheduler yields injected at lock and read boundaries
    max_jitter: usize,
}

impl Hub {
    async fn jitter(&self) {
        if self.max_jitter == 0 {
            return;
        }
        let yields = rand::thread_rng().gen_range(0..=self.max_jitter);
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }
    }

    fn map(&self, name: &str) -> Arc<OperationalEntries> {
        let mut maps = self.maps.lock();
        maps.entry(name.to_string())
            .or_insert_with(|| Arc::new(SharedMap::new()))
            .clone()
    }

    /// Drop a node from the cluster and announce it to the remaining nodes
    async fn remove_member(&self, id: &NodeId) -> bool {
        if let Some(handle) = self.nodes.write().remove(id) {
            handle.running.store(false, Ordering::SeqCst);
        }

        let removed = {
            let mut members = self.members.write().await;
            match members.iter().position(|m| &m.id == id) {
                Some(pos) => members.remove(pos),
                None => return false,
            }
        };

        self.membership_listeners.write().retain(|(_, owner, _)| owner != id);
        for map in self.maps.lock().values() {
            map.drop_listeners_of(id);
        }

        tracing::debug!("Member {} left the in-memory cluster", id);

        let listeners: Vec<_> = self
            .membership_listeners
            .read()
            .iter()
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.member_removed(&removed).await;
        }

        true
    }
}

/// A simulated cluster shared by any number of [`InMemoryNode`]s
#[derive(Clone)]
pub struct InMemoryCluster {
    hub: Arc<Hub>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_jitter(0)
    }

    /// Create a cluster that yields to the scheduler up to `max_yields`
    /// times before every lock acquisition and atomic read
    pub fn with_jitter(max_yields: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                locks: Mutex::new(HashMap::new()),
                refs: RwLock::new(HashMap::new()),
                maps: parking_lot::Mutex::new(HashMap::new()),
                members: RwLock::new(Vec::new()),
                nodes: parking_lot::RwLock::new(HashMap::new()),
                membership_listeners: parking_lot::RwLock::new(Vec::new()),
                max_jitter: max_yields,
            }),
        }
    }

    /// Join a new node to the cluster
    pub async fn join(
        &self,
        address: impl Into<String>,
        node_type: Option<NodeType>,
    ) -> InMemoryNode {
        let member = Member::new(NodeId::random(), address.into(), node_type);
        let handle = Arc::new(NodeHandle {
            id: member.id.clone(),
            running: AtomicBool::new(true),
        });

        self.hub.nodes.write().insert(member.id.clone(), Arc::clone(&handle));
        self.hub.members.write().await.push(member.clone());

        tracing::debug!(
            "Member {} ({}) joined the in-memory cluster",
            member.id,
            member.address
        );

        let listeners: Vec<_> = self
            .hub
            .membership_listeners
            .read()
            .iter()
            .filter(|(_, owner, _)| owner != &member.id)
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.member_added(&member).await;
        }

        InMemoryNode {
            hub: Arc::clone(&self.hub),
            handle,
        }
    }

    /// Remove a node as if its process had crashed
    pub async fn evict(&self, id: &NodeId) -> bool {
        self.hub.remove_member(id).await
    }

    /// Number of live members
    pub async fn size(&self) -> usize {
        self.hub.members.read().await.len()
    }
}

/// One node's connection to an [`InMemoryCluster`]
pub struct InMemoryNode {
    hub: Arc<Hub>,
    handle: Arc<NodeHandle>,
}

#[async_trait]
impl MembershipSubstrate for InMemoryNode {
    fn self_id(&self) -> NodeId {
        self.handle.id.clone()
    }

    async fn acquire_lock(&self, name: &str) -> Result<Box<dyn ClusterLock>> {
        self.handle.ensure_running()?;
        self.hub.jitter().await;

        let lock = {
            let mut locks = self.hub.locks.lock().await;
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        tracing::trace!("Node {} acquired lock '{}'", self.handle.id, name);

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            _guard: guard,
        }))
    }

    fn atomic_ref(&self, name: &str) -> Result<Arc<dyn AtomicRef>> {
        self.handle.ensure_running()?;
        Ok(Arc::new(MemoryAtomicRef {
            hub: Arc::clone(&self.hub),
            handle: Arc::clone(&self.handle),
            name: name.to_string(),
        }))
    }

    fn operational_map(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>> {
        self.handle.ensure_running()?;
        Ok(Arc::new(MemoryMapView {
            handle: Arc::clone(&self.handle),
            map: self.hub.map(name),
        }))
    }

    async fn members(&self) -> Result<Vec<Member>> {
        self.handle.ensure_running()?;
        Ok(self.hub.members.read().await.clone())
    }

    fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) -> Result<ListenerId> {
        self.handle.ensure_running()?;
        let id = ListenerId::new();
        self.hub
            .membership_listeners
            .write()
            .push((id, self.handle.id.clone(), listener));
        Ok(id)
    }

    fn remove_membership_listener(&self, id: ListenerId) -> Result<bool> {
        self.handle.ensure_running()?;
        let mut listeners = self.hub.membership_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        Ok(listeners.len() != before)
    }

    fn is_running(&self) -> bool {
        self.handle.running.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        self.handle.ensure_running()?;
        self.hub.remove_member(&self.handle.id).await;
        Ok(())
    }
}

/// Held lock; the mutex guard releases on drop
struct MemoryLock {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl ClusterLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }
}

struct MemoryAtomicRef {
    hub: Arc<Hub>,
    handle: Arc<NodeHandle>,
    name: String,
}

#[async_trait]
impl AtomicRef for MemoryAtomicRef {
    async fn get(&self) -> Result<Option<String>> {
        self.handle.ensure_running()?;
        self.hub.jitter().await;
        let refs = self.hub.refs.read().await;
        Ok(refs.get(&self.name).cloned().flatten())
    }

    async fn compare_and_set(&self, expect: Option<&str>, update: Option<&str>) -> Result<bool> {
        self.handle.ensure_running()?;
        let mut refs = self.hub.refs.write().await;
        let slot = refs.entry(self.name.clone()).or_default();
        if slot.as_deref() != expect {
            return Ok(false);
        }
        *slot = update.map(str::to_string);
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        self.handle.ensure_running()?;
        self.hub.refs.write().await.insert(self.name.clone(), None);
        Ok(())
    }
}

/// Entries and listeners of one named map
struct SharedMap<K, V> {
    entries: RwLock<HashMap<K, V>>,
    listeners: parking_lot::RwLock<Vec<(ListenerId, NodeId, EntryListener<K, V>)>>,
}

impl<K, V> SharedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            listeners: parking_lot::RwLock::new(Vec::new()),
        }
    }

    fn drop_listeners_of(&self, node: &NodeId) {
        self.listeners.write().retain(|(_, owner, _)| owner != node);
    }

    fn publish(&self, event: EntryEvent<K, V>) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// One node's view of a shared map
struct MemoryMapView<K, V> {
    handle: Arc<NodeHandle>,
    map: Arc<SharedMap<K, V>>,
}

#[async_trait]
impl<K, V> ReplicatedMap<K, V> for MemoryMapView<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, key: K, value: V) -> Result<()> {
        self.handle.ensure_running()?;
        let previous = self
            .map
            .entries
            .write()
            .await
            .insert(key.clone(), value.clone());

        let kind = if previous.is_some() {
            EntryEventKind::Updated
        } else {
            EntryEventKind::Added
        };
        self.map.publish(EntryEvent { kind, key, value });
        Ok(())
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        self.handle.ensure_running()?;
        Ok(self.map.entries.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &K) -> Result<Option<V>> {
        self.handle.ensure_running()?;
        let removed = self.map.entries.write().await.remove(key);
        if let Some(value) = &removed {
            self.map.publish(EntryEvent {
                kind: EntryEventKind::Removed,
                key: key.clone(),
                value: value.clone(),
            });
        }
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<(K, V)>> {
        self.handle.ensure_running()?;
        let entries = self.map.entries.read().await;
        Ok(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn add_entry_listener(&self, listener: EntryListener<K, V>) -> Result<ListenerId> {
        self.handle.ensure_running()?;
        let id = ListenerId::new();
        self.map
            .listeners
            .write()
            .push((id, self.handle.id.clone(), listener));
        Ok(id)
    }

    fn remove_entry_listener(&self, id: ListenerId) -> Result<bool> {
        self.handle.ensure_running()?;
        let mut listeners = self.map.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        Ok(listeners.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessId;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_atomic_ref_compare_and_set() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("10.0.0.1:9003", Some(NodeType::Application)).await;
        let b = cluster.join("10.0.0.2:9003", Some(NodeType::Application)).await;

        let slot_a = a.atomic_ref("leader").unwrap();
        let slot_b = b.atomic_ref("leader").unwrap();

        assert!(slot_a.get().await.unwrap().is_none());
        assert!(slot_a.compare_and_set(None, Some("a")).await.unwrap());
        assert!(!slot_b.compare_and_set(None, Some("b")).await.unwrap());
        assert_eq!(slot_b.get().await.unwrap().as_deref(), Some("a"));

        slot_b.clear().await.unwrap();
        assert!(slot_a.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_map_events_reach_every_node() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("10.0.0.1:9003", None).await;
        let b = cluster.join("10.0.0.2:9003", None).await;

        let seen = Arc::new(AtomicUsize::new(0));
        for node in [&a, &b] {
            let seen = Arc::clone(&seen);
            node.operational_map("ops")
                .unwrap()
                .add_entry_listener(Arc::new(move |event: &EntryEvent<ClusterProcessKey, bool>| {
                    assert_eq!(event.kind, EntryEventKind::Added);
                    seen.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        let key = ClusterProcessKey::new(a.self_id(), ProcessId::Search);
        a.operational_map("ops").unwrap().put(key.clone(), true).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(b.operational_map("ops").unwrap().get(&key).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("10.0.0.1:9003", None).await;
        let b = cluster.join("10.0.0.2:9003", None).await;

        let held = a.acquire_lock("leader").await.unwrap();
        assert_eq!(held.name(), "leader");

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            b.acquire_lock("leader"),
        )
        .await;
        assert!(waiting.is_err());

        drop(held);
        assert!(b.acquire_lock("leader").await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_makes_connection_inactive() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("10.0.0.1:9003", None).await;
        let _b = cluster.join("10.0.0.2:9003", None).await;

        a.shutdown().await.unwrap();
        assert!(!a.is_running());
        assert_eq!(cluster.size().await, 1);
        assert!(matches!(a.members().await, Err(Error::SubstrateInactive)));
        assert!(matches!(a.shutdown().await, Err(Error::SubstrateInactive)));

        // evicting an absent member is a no-op
        assert!(!cluster.evict(&a.self_id()).await);
    }
}

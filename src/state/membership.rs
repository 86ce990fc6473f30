//! Membership Change Handling
//!
//! Reacts to nodes leaving the cluster: their processes are flipped to
//! non-operational, and once no application node is left the leader and
//! identity slots are purged so the next application node starts fresh.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::state::{
    ClusterProcessKey, NodeId, CLUSTER_NAME_SLOT, LEADER_SLOT, SOFTWARE_VERSION_SLOT,
};
use crate::substrate::{Member, MembershipListener, MembershipSubstrate, ReplicatedMap};

/// Cleans up shared state when members leave
pub struct MembershipChangeHandler {
    substrate: Arc<dyn MembershipSubstrate>,
    map: Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>,
}

impl MembershipChangeHandler {
    pub fn new(
        substrate: Arc<dyn MembershipSubstrate>,
        map: Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>,
    ) -> Self {
        Self { substrate, map }
    }

    /// Apply the departure of `departed` to the shared state
    pub async fn handle_departure(&self, departed: &NodeId) -> Result<()> {
        let flipped = self.mark_processes_down(departed).await?;
        if flipped > 0 {
            tracing::info!(
                "Marked {} process(es) of departed node {} as not operational",
                flipped,
                departed
            );
        }

        let members = self.substrate.members().await?;
        let application_left = members
            .iter()
            .any(|m| &m.id != departed && m.is_application());
        if !application_left {
            tracing::info!("No application node left in the cluster, purging leader and identity");
            self.purge().await?;
        }
        Ok(())
    }

    /// Write `false` for every process key of the node. Keys are never deleted.
    async fn mark_processes_down(&self, node: &NodeId) -> Result<usize> {
        let mut flipped = 0;
        for (key, up) in self.map.entries().await? {
            if &key.node_id == node && up {
                self.map.put(key, false).await?;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    /// Clear the leader slot and both identity slots
    pub async fn purge(&self) -> Result<()> {
        for slot in [LEADER_SLOT, SOFTWARE_VERSION_SLOT, CLUSTER_NAME_SLOT] {
            self.substrate.atomic_ref(slot)?.clear().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipListener for MembershipChangeHandler {
    async fn member_added(&self, member: &Member) {
        tracing::debug!(
            "Member {} joined at {} (type: {})",
            member.id,
            member.address,
            member
                .node_type
                .map(|t| t.value())
                .unwrap_or("unknown")
        );
    }

    async fn member_removed(&self, member: &Member) {
        tracing::debug!("Member {} left the cluster", member.id);
        if let Err(e) = self.handle_departure(&member.id).await {
            tracing::warn!(
                "Failed to clean up shared state after departure of {}: {}",
                member.id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NodeType, ProcessId, OPERATIONAL_PROCESSES};
    use crate::substrate::{InMemoryCluster, InMemoryNode};

    async fn join_with_handler(
        cluster: &InMemoryCluster,
        address: &str,
        node_type: NodeType,
    ) -> (Arc<InMemoryNode>, Arc<MembershipChangeHandler>) {
        let node = Arc::new(cluster.join(address, Some(node_type)).await);
        let substrate: Arc<dyn MembershipSubstrate> = node.clone();
        let map = substrate.operational_map(OPERATIONAL_PROCESSES).unwrap();
        let handler = Arc::new(MembershipChangeHandler::new(substrate.clone(), map));
        substrate.add_membership_listener(handler.clone()).unwrap();
        (node, handler)
    }

    #[tokio::test]
    async fn test_departure_flips_but_never_deletes() {
        let cluster = InMemoryCluster::new();
        let (a, _) = join_with_handler(&cluster, "10.0.0.1:9003", NodeType::Search).await;
        let (b, _) = join_with_handler(&cluster, "10.0.0.2:9003", NodeType::Application).await;

        let key = ClusterProcessKey::new(a.self_id(), ProcessId::Search);
        let map = b.operational_map(OPERATIONAL_PROCESSES).unwrap();
        map.put(key.clone(), true).await.unwrap();

        cluster.evict(&a.self_id()).await;

        assert_eq!(map.get(&key).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_purge_after_last_application_node() {
        let cluster = InMemoryCluster::new();
        let (a, _) = join_with_handler(&cluster, "10.0.0.1:9003", NodeType::Application).await;
        let (b, _) = join_with_handler(&cluster, "10.0.0.2:9003", NodeType::Application).await;
        let (s, _) = join_with_handler(&cluster, "10.0.0.3:9003", NodeType::Search).await;

        for (slot, value) in [
            (LEADER_SLOT, "a"),
            (CLUSTER_NAME_SLOT, "foo"),
            (SOFTWARE_VERSION_SLOT, "1.0"),
        ] {
            a.atomic_ref(slot)
                .unwrap()
                .compare_and_set(None, Some(value))
                .await
                .unwrap();
        }

        cluster.evict(&a.self_id()).await;
        // b is still an application node
        assert!(s.atomic_ref(LEADER_SLOT).unwrap().get().await.unwrap().is_some());

        cluster.evict(&b.self_id()).await;
        for slot in [LEADER_SLOT, CLUSTER_NAME_SLOT, SOFTWARE_VERSION_SLOT] {
            assert!(s.atomic_ref(slot).unwrap().get().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_redelivered_departure_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let (a, _) = join_with_handler(&cluster, "10.0.0.1:9003", NodeType::Application).await;
        let (s, handler) = join_with_handler(&cluster, "10.0.0.2:9003", NodeType::Search).await;

        let key = ClusterProcessKey::new(a.self_id(), ProcessId::WebServer);
        let map = s.operational_map(OPERATIONAL_PROCESSES).unwrap();
        map.put(key.clone(), true).await.unwrap();

        cluster.evict(&a.self_id()).await;
        handler.handle_departure(&a.self_id()).await.unwrap();

        assert_eq!(map.get(&key).await.unwrap(), Some(false));
        assert!(s.atomic_ref(LEADER_SLOT).unwrap().get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let cluster = InMemoryCluster::new();
        let (a, handler) =
            join_with_handler(&cluster, "10.0.0.1:9003", NodeType::Application).await;
        a.shutdown().await.unwrap();

        // the substrate is gone; the callback must still return normally
        let ghost = Member::new(NodeId::from("ghost"), "10.0.0.9:9003".into(), None);
        handler.member_removed(&ghost).await;
        assert!(handler.handle_departure(&ghost.id).await.is_err());
    }
}

//! Leader Election
//!
//! Single-writer election over the cluster-wide leader slot. The first node
//! to fill the slot stays leader until the slot is purged by the membership
//! change handler; there is no re-election when the leader alone departs.

use std::sync::Arc;

use crate::error::Result;
use crate::state::{NodeId, LEADER_SLOT};
use crate::substrate::{AtomicRef, MembershipSubstrate};

/// Elects the leader by writing this node's ID into the leader slot
pub struct LeaderElector {
    substrate: Arc<dyn MembershipSubstrate>,
    slot: Arc<dyn AtomicRef>,
}

impl LeaderElector {
    pub fn new(substrate: Arc<dyn MembershipSubstrate>) -> Result<Self> {
        let slot = substrate.atomic_ref(LEADER_SLOT)?;
        Ok(Self { substrate, slot })
    }

    /// Current content of the leader slot
    pub async fn leader_id(&self) -> Result<Option<NodeId>> {
        Ok(self.slot.get().await?.map(NodeId::new))
    }

    /// Try to claim leadership. Returns `true` for exactly one caller until the slot is purged.
    pub async fn try_become_leader(&self) -> Result<bool> {
        if self.slot.get().await?.is_some() {
            return Ok(false);
        }

        let _lock = self.substrate.acquire_lock(LEADER_SLOT).await?;

        if let Some(leader) = self.slot.get().await? {
            tracing::debug!("Leader slot was taken by {} while waiting for the lock", leader);
            return Ok(false);
        }

        let me = self.substrate.self_id();
        let won = self.slot.compare_and_set(None, Some(me.as_str())).await?;
        if won {
            tracing::info!("Node {} is now the cluster leader", me);
        }
        Ok(won)
    }

    /// Address of the leader, if the slot is filled and the leader is still a member
    pub async fn leader_address(&self) -> Result<Option<String>> {
        let leader = match self.leader_id().await? {
            Some(leader) => leader,
            None => return Ok(None),
        };

        let members = self.substrate.members().await?;
        Ok(members
            .into_iter()
            .find(|m| m.id == leader)
            .map(|m| m.address))
    }
}

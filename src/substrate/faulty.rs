//! Fault injection for tests: an [`InMemoryNode`] whose atomic references
//! misbehave in a chosen way while everything else is delegated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::state::{ClusterProcessKey, NodeId};

use super::{
    AtomicRef, ClusterLock, InMemoryNode, ListenerId, Member, MembershipListener,
    MembershipSubstrate, ReplicatedMap,
};

/// Misbehaviour of every atomic reference handed out by a [`FaultyNode`]
#[derive(Debug, Clone)]
pub enum Fault {
    /// The n-th `get` (1-based) on a reference fails
    FailGet(usize),
    /// A compare-and-set on an empty reference loses to this value
    LoseCas(String),
}

pub struct FaultyNode {
    inner: InMemoryNode,
    fault: Fault,
}

impl FaultyNode {
    pub fn new(inner: InMemoryNode, fault: Fault) -> Self {
        Self { inner, fault }
    }
}

struct FaultyRef {
    inner: Arc<dyn AtomicRef>,
    fault: Fault,
    gets: AtomicUsize,
}

#[async_trait]
impl AtomicRef for FaultyRef {
    async fn get(&self) -> Result<Option<String>> {
        let call = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        if let Fault::FailGet(n) = self.fault {
            if call == n {
                return Err(Error::Substrate(format!("injected failure on get #{}", call)));
            }
        }
        self.inner.get().await
    }

    async fn compare_and_set(&self, expect: Option<&str>, update: Option<&str>) -> Result<bool> {
        if let Fault::LoseCas(other) = &self.fault {
            if expect.is_none() && self.inner.compare_and_set(None, Some(other.as_str())).await? {
                return Ok(false);
            }
        }
        self.inner.compare_and_set(expect, update).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

#[async_trait]
impl MembershipSubstrate for FaultyNode {
    fn self_id(&self) -> NodeId {
        self.inner.self_id()
    }

    async fn acquire_lock(&self, name: &str) -> Result<Box<dyn ClusterLock>> {
        self.inner.acquire_lock(name).await
    }

    fn atomic_ref(&self, name: &str) -> Result<Arc<dyn AtomicRef>> {
        Ok(Arc::new(FaultyRef {
            inner: self.inner.atomic_ref(name)?,
            fault: self.fault.clone(),
            gets: AtomicUsize::new(0),
        }))
    }

    fn operational_map(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ReplicatedMap<ClusterProcessKey, bool>>> {
        self.inner.operational_map(name)
    }

    async fn members(&self) -> Result<Vec<Member>> {
        self.inner.members().await
    }

    fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) -> Result<ListenerId> {
        self.inner.add_membership_listener(listener)
    }

    fn remove_membership_listener(&self, id: ListenerId) -> Result<bool> {
        self.inner.remove_membership_listener(id)
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

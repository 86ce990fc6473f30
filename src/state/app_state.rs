//! Application State
//!
//! The single object process-supervision code talks to. [`ClusterAppState`]
//! composes the tracker, the elector, the identity guard and the membership
//! change handler on top of a substrate connection; [`LocalAppState`] is the
//! standalone counterpart used when clustering is disabled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::config::ClusterStateConfig;
use crate::error::{Error, Result};
use crate::state::{
    ClusterIdentityGuard, LeaderElector, MembershipChangeHandler, NodeId, NodeType,
    OperationalListener, OperationalProcessTracker, ProcessId, OPERATIONAL_PROCESSES,
};
use crate::substrate::{ListenerId, MembershipSubstrate};

/// Application state shared with process supervision
#[async_trait]
pub trait AppState: Send + Sync {
    /// Register a listener called whenever a process becomes operational
    fn add_listener(&self, listener: OperationalListener);

    async fn set_operational(&self, process_id: ProcessId) -> Result<()>;

    async fn is_operational(&self, process_id: ProcessId, local: bool) -> Result<bool>;

    async fn try_become_leader(&self) -> Result<bool>;

    async fn leader_address(&self) -> Result<Option<String>>;

    async fn register_cluster_identity(&self, name: &str, version: &str) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    /// Release everything. Never fails; problems are logged.
    async fn close(&self);
}

/// Start/stop contract of search-index health reporting
#[async_trait]
pub trait SearchHealthReporter: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Application state of a clustered node
pub struct ClusterAppState {
    substrate: Arc<dyn MembershipSubstrate>,
    tracker: OperationalProcessTracker,
    elector: LeaderElector,
    identity: ClusterIdentityGuard,
    membership_listener: Mutex<Option<ListenerId>>,
    health_reporter: Option<Arc<dyn SearchHealthReporter>>,
    closed: AtomicBool,
}

impl ClusterAppState {
    pub async fn new(substrate: Arc<dyn MembershipSubstrate>) -> Result<Self> {
        Self::with_health_reporter(substrate, None).await
    }

    /// Create the state and start the given health reporter, stopped again on close.
    ///
    /// Nothing stays registered on the substrate when this fails.
    pub async fn with_health_reporter(
        substrate: Arc<dyn MembershipSubstrate>,
        health_reporter: Option<Arc<dyn SearchHealthReporter>>,
    ) -> Result<Self> {
        let map = substrate.operational_map(OPERATIONAL_PROCESSES)?;
        let elector = LeaderElector::new(Arc::clone(&substrate))?;

        let tracker = OperationalProcessTracker::new(substrate.self_id(), Arc::clone(&map));
        tracker.attach()?;

        let handler = Arc::new(MembershipChangeHandler::new(Arc::clone(&substrate), map));
        let membership_listener = match substrate.add_membership_listener(handler) {
            Ok(id) => id,
            Err(e) => {
                unregister(substrate.as_ref(), &tracker, None);
                return Err(e);
            }
        };

        if let Some(reporter) = &health_reporter {
            if let Err(e) = reporter.start().await {
                unregister(substrate.as_ref(), &tracker, Some(membership_listener));
                return Err(e);
            }
        }

        tracing::info!("Cluster application state ready on node {}", substrate.self_id());

        Ok(Self {
            elector,
            identity: ClusterIdentityGuard::new(Arc::clone(&substrate)),
            substrate,
            tracker,
            membership_listener: Mutex::new(Some(membership_listener)),
            health_reporter,
            closed: AtomicBool::new(false),
        })
    }

    /// This node's ID
    pub fn node_id(&self) -> NodeId {
        self.substrate.self_id()
    }

    /// Current content of the leader slot
    pub async fn leader_id(&self) -> Result<Option<NodeId>> {
        self.elector.leader_id().await
    }
}

#[async_trait]
impl AppState for ClusterAppState {
    fn add_listener(&self, listener: OperationalListener) {
        self.tracker.add_listener(listener);
    }

    async fn set_operational(&self, process_id: ProcessId) -> Result<()> {
        self.tracker.set_operational(process_id).await
    }

    async fn is_operational(&self, process_id: ProcessId, local: bool) -> Result<bool> {
        self.tracker.is_operational(process_id, local).await
    }

    async fn try_become_leader(&self) -> Result<bool> {
        self.elector.try_become_leader().await
    }

    async fn leader_address(&self) -> Result<Option<String>> {
        self.elector.leader_address().await
    }

    async fn register_cluster_identity(&self, name: &str, version: &str) -> Result<()> {
        self.identity.register_cluster_identity(name, version).await
    }

    async fn reset(&self) -> Result<()> {
        Err(Error::State(
            "state reset is not supported when clustering is enabled".into(),
        ))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Cluster application state already closed");
            return;
        }

        if let Some(reporter) = &self.health_reporter {
            if let Err(e) = reporter.stop().await {
                tracing::warn!("Failed to stop search health reporting: {}", e);
            }
        }

        let registration = self.membership_listener.lock().take();
        unregister(self.substrate.as_ref(), &self.tracker, registration);

        match self.tracker.remove_local_entries().await {
            Ok(removed) => tracing::debug!("Removed {} operational entries of this node", removed),
            Err(e) => tracing::warn!("Failed to remove operational entries of this node: {}", e),
        }

        if let Err(e) = self.substrate.shutdown().await {
            tracing::warn!("Failed to shut down substrate connection: {}", e);
        }

        tracing::info!("Cluster application state closed");
    }
}

/// Drop the listeners a cluster state registered, logging failures
fn unregister(
    substrate: &dyn MembershipSubstrate,
    tracker: &OperationalProcessTracker,
    membership_listener: Option<ListenerId>,
) {
    if let Err(e) = tracker.detach() {
        tracing::warn!("Failed to unregister operational map listener: {}", e);
    }

    if let Some(id) = membership_listener {
        if let Err(e) = substrate.remove_membership_listener(id) {
            tracing::warn!("Failed to unregister membership listener: {}", e);
        }
    }
}

/// Application state of a standalone node
pub struct LocalAppState {
    address: String,
    processes: RwLock<HashMap<ProcessId, bool>>,
    listeners: RwLock<Vec<OperationalListener>>,
    leader: AtomicBool,
}

impl LocalAppState {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            processes: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            leader: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AppState for LocalAppState {
    fn add_listener(&self, listener: OperationalListener) {
        self.listeners.write().push(listener);
    }

    async fn set_operational(&self, process_id: ProcessId) -> Result<()> {
        self.processes.write().insert(process_id, true);
        let listeners: Vec<OperationalListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(process_id);
        }
        Ok(())
    }

    async fn is_operational(&self, process_id: ProcessId, _local: bool) -> Result<bool> {
        Ok(self.processes.read().get(&process_id).copied().unwrap_or(false))
    }

    async fn try_become_leader(&self) -> Result<bool> {
        Ok(!self.leader.swap(true, Ordering::SeqCst))
    }

    async fn leader_address(&self) -> Result<Option<String>> {
        if self.leader.load(Ordering::SeqCst) {
            Ok(Some(self.address.clone()))
        } else {
            Ok(None)
        }
    }

    async fn register_cluster_identity(&self, _name: &str, _version: &str) -> Result<()> {
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.processes.write().clear();
        self.leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        tracing::debug!("Standalone application state closed");
    }
}

/// Build the application state matching the configuration.
///
/// In cluster mode a substrate connection is required, and application
/// nodes register the configured cluster name and software version,
/// failing fast when they disagree with the cluster.
pub async fn build_app_state(
    config: &ClusterStateConfig,
    substrate: Option<Arc<dyn MembershipSubstrate>>,
) -> Result<Arc<dyn AppState>> {
    config.validate()?;

    if !config.cluster.enabled {
        return Ok(Arc::new(LocalAppState::new(config.node_address())));
    }

    let substrate = substrate.ok_or_else(|| {
        Error::Config("cluster.enabled is true but no substrate connection was supplied".into())
    })?;

    let node_type = config.node_type()?;
    if let Err(e) = check_member_type(substrate.as_ref(), node_type).await {
        if let Err(shutdown_err) = substrate.shutdown().await {
            tracing::warn!("Failed to shut down substrate connection: {}", shutdown_err);
        }
        return Err(e);
    }

    let state = ClusterAppState::new(substrate).await?;
    if node_type == NodeType::Application {
        if let Err(e) = state
            .register_cluster_identity(&config.cluster.name, &config.software_version)
            .await
        {
            state.close().await;
            return Err(e);
        }
    }
    Ok(Arc::new(state))
}

/// Require the substrate to publish this node with the configured node type.
/// Departure handling counts application nodes by the published type.
async fn check_member_type(
    substrate: &dyn MembershipSubstrate,
    expected: NodeType,
) -> Result<()> {
    let me = substrate.self_id();
    let published = substrate
        .members()
        .await?
        .into_iter()
        .find(|m| m.id == me)
        .ok_or_else(|| {
            Error::Config(format!("node {} is not a member of the cluster it joined", me))
        })?
        .node_type;

    if published != Some(expected) {
        return Err(Error::Config(format!(
            "node.type is [{}] but this node joined the cluster as [{}]",
            expected.value(),
            published.map(|t| t.value()).unwrap_or("unknown")
        )));
    }
    Ok(())
}

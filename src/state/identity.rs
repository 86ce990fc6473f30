//! Cluster Identity Guard
//!
//! Every node must agree on the cluster name and the software version. The
//! first node to start fills each slot; later nodes are compared against it
//! and refuse to join on mismatch.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::{CLUSTER_NAME_SLOT, SOFTWARE_VERSION_SLOT};
use crate::substrate::MembershipSubstrate;

/// Registers and checks the cluster name and software version
pub struct ClusterIdentityGuard {
    substrate: Arc<dyn MembershipSubstrate>,
}

impl ClusterIdentityGuard {
    pub fn new(substrate: Arc<dyn MembershipSubstrate>) -> Self {
        Self { substrate }
    }

    /// Register both identity fields. Both checks always run; when both fail,
    /// the software version error is returned and the other one logged.
    pub async fn register_cluster_identity(&self, name: &str, version: &str) -> Result<()> {
        let version_check = self.register_software_version(version).await;
        let name_check = self.register_cluster_name(name).await;

        match (version_check, name_check) {
            (Err(version_err), Err(name_err)) => {
                tracing::error!("{}", name_err);
                Err(version_err)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    pub async fn register_cluster_name(&self, name: &str) -> Result<()> {
        self.register(CLUSTER_NAME_SLOT, name).await
    }

    pub async fn register_software_version(&self, version: &str) -> Result<()> {
        self.register(SOFTWARE_VERSION_SLOT, version).await
    }

    /// Fill the named slot with `local` if empty, otherwise require it to match
    async fn register(&self, property: &str, local: &str) -> Result<()> {
        let slot = self.substrate.atomic_ref(property)?;

        let shared = match slot.get().await? {
            Some(shared) => shared,
            None => {
                let _lock = self.substrate.acquire_lock(property).await?;
                match slot.get().await? {
                    Some(shared) => shared,
                    None => {
                        if slot.compare_and_set(None, Some(local)).await? {
                            tracing::info!("Registered {} [{}] for the cluster", property, local);
                            return Ok(());
                        }
                        slot.get().await?.ok_or_else(|| {
                            Error::State(format!("{} was cleared while registering it", property))
                        })?
                    }
                }
            }
        };

        if shared != local {
            return Err(Error::IdentityMismatch {
                property: property.to_string(),
                local: local.to_string(),
                cluster: shared,
            });
        }
        Ok(())
    }
}

//! ClusterCIDR reconciliation.
//!
//! A new ClusterCIDR is validated, gets its allocators and the finalizer
//! that keeps it alive while nodes use it. Once deletion is requested the
//! pool stops taking new nodes, and the finalizer is removed when the last
//! node holding ranges from it is gone.

use super::Reconciler;
use crate::error::ControllerError;
use crate::registry::Registration;
use crds::ClusterCIDR;
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Brings one ClusterCIDR's registration in line with the cache.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed or modified spec (not retried), `Kube`
    /// or `Conflict` when the finalizer could not be updated yet, and
    /// `PoolInUse` while a deleted pool of the same name still has nodes.
    pub async fn sync_pool(&self, name: &str) -> Result<(), ControllerError> {
        let Some(cc) = self.pools.get(&ObjectRef::new(name)) else {
            self.forget_deleted_pool(name);
            return Ok(());
        };

        if cc.is_terminating() {
            return self.finalize_pool(&cc).await;
        }

        match self.registry.register(&cc)? {
            Registration::Added => self.activate_pool(name),
            Registration::Replaced(previous) => {
                info!("ClusterCIDR {} was recreated, dropping the leftover of the deleted one", name);
                self.metrics.pool_removed(&previous);
                self.activate_pool(name);
            }
            Registration::Resumed => {
                info!(
                    "ClusterCIDR {} was recreated unchanged, keeping its {} node(s)",
                    name,
                    self.registry.associations(name).unwrap_or(0)
                );
                self.request_nodes_without_ranges();
            }
            Registration::Unchanged => debug!("ClusterCIDR {} is already registered", name),
        }

        self.pool_client.add_finalizer(&cc).await
    }

    /// Makes a freshly registered pool selectable.
    ///
    /// Ranges nodes already carry from the pool's blocks are marked taken
    /// first, so they are never handed out a second time.
    fn activate_pool(&self, name: &str) {
        let mut adopted = 0;
        for node in self.nodes.state() {
            if self.allocation(&node.name_any()).is_some() {
                continue;
            }
            let cidrs = super::node::pod_cidrs(&node);
            if !cidrs.is_empty() && self.adopt_node(&node, cidrs) {
                adopted += 1;
            }
        }

        self.registry.activate(name);
        if let Some(pool) = self.registry.get(name) {
            info!(
                "Registered ClusterCIDR {} ({} sub-blocks per family at most, {} already assigned)",
                name,
                pool.capacity(),
                adopted
            );
            self.metrics.pool_registered(&pool);
        }
        self.request_nodes_without_ranges();
    }

    /// Handles a ClusterCIDR that is marked for deletion
    async fn finalize_pool(&self, cc: &ClusterCIDR) -> Result<(), ControllerError> {
        let name = cc.name_any();
        if let Some(associations) = self.registry.mark_terminating(&name) {
            if associations > 0 {
                // The last release requests the pool again
                info!(
                    "ClusterCIDR {} is terminating, waiting for {} node(s) to release their Pod CIDRs",
                    name, associations
                );
                return Ok(());
            }
            let pool = self.registry.get(&name);
            self.registry.unregister(&name)?;
            if let Some(pool) = pool {
                self.metrics.pool_removed(&pool);
            }
        }

        self.pool_client.remove_finalizer(cc).await?;
        info!("Finalized ClusterCIDR {}", name);
        Ok(())
    }

    /// Handles a ClusterCIDR that disappeared without going through finalization
    pub(crate) fn forget_deleted_pool(&self, name: &str) {
        match self.registry.mark_terminating(name) {
            None => debug!("ClusterCIDR {} is not registered, nothing to forget", name),
            Some(0) => self.unregister_pool(name),
            Some(associations) => warn!(
                "ClusterCIDR {} was deleted while {} node(s) still hold Pod CIDRs from it",
                name, associations
            ),
        }
    }

    /// Requests every cached node that has neither ranges nor an allocation record
    fn request_nodes_without_ranges(&self) {
        for node in self.nodes.state() {
            let name = node.name_any();
            if self.allocation(&name).is_none() && super::node::pod_cidrs(&node).is_empty() {
                self.triggers.node(&name);
            }
        }
    }
}

//! Node reconciliation.
//!
//! A node without Pod CIDRs gets one sub-block per family from the best
//! matching pool; a deleted node gives its sub-blocks back. Ranges are never
//! changed while a node exists.
//!
//! Deletes arrive through `Reconciler::observe_node`, not through
//! `sync_node`, so both sides check for the other when a patch races a
//! delete.

use super::{NodeAllocation, Reconciler};
use crate::candidate;
use crate::error::ControllerError;
use crate::registry::Pool;
use crate::selector::NodeFields;
use cidrset::CidrSetError;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Pod CIDRs recorded on a node, `spec.podCIDRs` first, then `spec.podCIDR`
pub fn pod_cidrs(node: &Node) -> Vec<IpNet> {
    let Some(spec) = &node.spec else {
        return Vec::new();
    };
    let raw: Vec<&String> = match (&spec.pod_cidrs, &spec.pod_cidr) {
        (Some(cidrs), _) if !cidrs.is_empty() => cidrs.iter().collect(),
        (_, Some(cidr)) if !cidr.is_empty() => vec![cidr],
        _ => Vec::new(),
    };
    raw.into_iter()
        .filter_map(|cidr| match cidr.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                warn!("Node {} has unparsable Pod CIDR {:?}: {}", node.name_any(), cidr, e);
                None
            }
        })
        .collect()
}

impl Reconciler {
    /// Brings one node's allocation in line with the cache.
    ///
    /// # Errors
    ///
    /// `NoMatch` and `Exhausted` when the node cannot get ranges yet,
    /// `Conflict` or `Kube` when the patch failed. All are retried.
    pub async fn sync_node(&self, name: &str) -> Result<(), ControllerError> {
        let Some(node) = self.nodes.get(&ObjectRef::new(name)) else {
            self.release_node(name);
            return Ok(());
        };

        let uid = node.uid();
        if let Some(existing) = self.allocation(name) {
            if existing.uid == uid {
                debug!("Node {} already holds {}", name, format_cidrs(&existing.cidrs));
                return Ok(());
            }
            info!("Node {} was recreated, releasing ranges of its previous incarnation", name);
            self.release_node(name);
        }

        let assigned = pod_cidrs(&node);
        if !assigned.is_empty() {
            self.adopt_node(&node, assigned);
            return Ok(());
        }

        self.allocate_node(&node).await
    }

    /// Records Pod CIDRs a node already carries. Returns true if a pool owns them.
    ///
    /// Only usage is updated: the ranges were handed out before.
    pub(crate) fn adopt_node(&self, node: &Node, cidrs: Vec<IpNet>) -> bool {
        let name = node.name_any();
        let mut allocations = self.lock_allocations();
        if allocations.contains_key(&name) {
            return true;
        }
        let Some(pool) = self.registry.find_owner(&cidrs) else {
            debug!("Node {} has Pod CIDRs {} outside every ClusterCIDR, leaving it alone", name, format_cidrs(&cidrs));
            return false;
        };

        if let Err(e) = pool.occupy(&cidrs) {
            error!(
                "Node {} claims {} from ClusterCIDR {} but they cannot be marked allocated: {}",
                name,
                format_cidrs(&cidrs),
                pool.name(),
                e
            );
            return false;
        }
        if let Err(e) = self.registry.increment_association(pool.name()) {
            pool.release_all(&cidrs);
            error!("Failed to record node {} on ClusterCIDR {}: {}", name, pool.name(), e);
            return false;
        }

        debug!("Adopted Pod CIDRs {} of node {} into ClusterCIDR {}", format_cidrs(&cidrs), name, pool.name());
        self.metrics.record_adoption(&pool);
        allocations.insert(
            name,
            NodeAllocation {
                uid: node.uid(),
                pool: pool.name().to_string(),
                cidrs,
            },
        );
        true
    }

    async fn allocate_node(&self, node: &Node) -> Result<(), ControllerError> {
        let name = node.name_any();
        let fields = NodeFields {
            name: &name,
            labels: node.labels(),
        };
        let candidates = candidate::rank(fields, &self.registry.list_eligible());
        if candidates.is_empty() {
            self.metrics.record_not_available("NoMatch");
            self.node_client
                .report_cidr_not_available(node, "No ClusterCIDR selects this node")
                .await;
            return Err(ControllerError::NoMatch(name));
        }

        let mut tries = 0;
        for candidate in candidates {
            tries += 1;
            let pool = candidate.pool;
            // Pool may have started terminating since it was listed
            if let Err(e) = self.registry.reserve(pool.name()) {
                debug!("Skipping ClusterCIDR {} for node {}: {}", pool.name(), name, e);
                continue;
            }

            match pool.allocate_all() {
                Ok(cidrs) => return self.commit(node, &pool, cidrs, tries).await,
                Err(CidrSetError::Exhausted(block)) => {
                    debug!("ClusterCIDR {} block {} is exhausted, trying the next candidate", pool.name(), block);
                    self.release_association(pool.name());
                }
                Err(e) => {
                    self.release_association(pool.name());
                    return Err(e.into());
                }
            }
        }

        self.metrics.record_not_available("Exhausted");
        self.node_client
            .report_cidr_not_available(node, "Every matching ClusterCIDR is exhausted")
            .await;
        Err(ControllerError::Exhausted(name))
    }

    /// Writes freshly allocated ranges to the node, rolling back on failure
    async fn commit(&self, node: &Node, pool: &Arc<Pool>, cidrs: Vec<IpNet>, tries: u32) -> Result<(), ControllerError> {
        let name = node.name_any();
        match self.node_client.patch_pod_cidrs(&name, &cidrs).await {
            Ok(()) => {
                info!("Assigned Pod CIDRs {} to node {} from ClusterCIDR {}", format_cidrs(&cidrs), name, pool.name());
                self.metrics.record_allocation(pool, tries);
                self.lock_allocations().insert(
                    name.clone(),
                    NodeAllocation {
                        uid: node.uid(),
                        pool: pool.name().to_string(),
                        cidrs,
                    },
                );
                // A delete observed during the patch found no record to release
                let current = self.nodes.get(&ObjectRef::new(&name));
                if current.is_none_or(|current| current.uid() != node.uid()) {
                    info!("Node {} was deleted while its Pod CIDRs were written", name);
                    self.release_node(&name);
                }
                Ok(())
            }
            Err(e) => {
                pool.release_all(&cidrs);
                self.release_association(pool.name());
                match e {
                    ControllerError::NotFound(_) => {
                        info!("Node {} vanished before its Pod CIDRs were recorded", name);
                        Ok(())
                    }
                    e => Err(e),
                }
            }
        }
    }

    /// Gives back the ranges of a deleted node. No-op without a record.
    pub(crate) fn release_node(&self, name: &str) {
        let Some(allocation) = self.lock_allocations().remove(name) else {
            debug!("Node {} holds no Pod CIDRs, nothing to release", name);
            return;
        };

        match self.registry.get(&allocation.pool) {
            Some(pool) => {
                pool.release_all(&allocation.cidrs);
                self.metrics.record_release(&pool);
                self.release_association(&allocation.pool);
                info!(
                    "Released Pod CIDRs {} of node {} back to ClusterCIDR {} ({} node(s) left)",
                    format_cidrs(&allocation.cidrs),
                    name,
                    allocation.pool,
                    self.registry.associations(&allocation.pool).unwrap_or(0)
                );
            }
            None => warn!(
                "ClusterCIDR {} of node {} is no longer registered, dropping {}",
                allocation.pool,
                name,
                format_cidrs(&allocation.cidrs)
            ),
        }
    }
}

fn format_cidrs(cidrs: &[IpNet]) -> String {
    cidrs.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

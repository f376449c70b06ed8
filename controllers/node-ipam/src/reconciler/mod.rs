//! Reconciliation logic for nodes and ClusterCIDRs.
//!
//! This module is organized by resource:
//! - `node`: assigns Pod CIDRs to new nodes and takes them back from deleted ones
//! - `pool`: registers ClusterCIDRs and finalizes them once no node uses them
//!
//! The `Reconciler` is the shared context of the Node and ClusterCIDR
//! controllers. Reconciliations read the current object from the reflector
//! caches. Deletions never reach them: the controllers only reconcile
//! cached objects, so deletes are handled as the watch events pass through
//! (`observe_node`, `observe_pool`).

pub mod node;
pub mod pool;

use crate::backoff::RetryTracker;
use crate::client::{NodeClient, PoolClient};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::registry::PoolRegistry;
use crds::ClusterCIDR;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher::Event;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pod CIDRs held by one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAllocation {
    /// UID of the node the ranges were given to
    pub uid: Option<String>,
    /// Pool the ranges came from
    pub pool: String,
    /// One sub-block per family, IPv4 first
    pub cidrs: Vec<IpNet>,
}

/// Sends reconcile requests the watch events alone would not produce
#[derive(Debug, Clone)]
pub struct Triggers {
    nodes: UnboundedSender<ObjectRef<Node>>,
    pools: UnboundedSender<ObjectRef<ClusterCIDR>>,
}

/// Receiving ends of `Triggers`, fed to the controllers' `reconcile_on`
#[derive(Debug)]
pub struct TriggerStreams {
    /// Nodes to reconcile
    pub nodes: UnboundedReceiver<ObjectRef<Node>>,
    /// ClusterCIDRs to reconcile
    pub pools: UnboundedReceiver<ObjectRef<ClusterCIDR>>,
}

/// Creates connected `Triggers` and `TriggerStreams`
#[must_use]
pub fn triggers() -> (Triggers, TriggerStreams) {
    let (nodes, node_rx) = mpsc::unbounded();
    let (pools, pool_rx) = mpsc::unbounded();
    (
        Triggers { nodes, pools },
        TriggerStreams {
            nodes: node_rx,
            pools: pool_rx,
        },
    )
}

impl Triggers {
    /// Requests a reconciliation of a node
    pub fn node(&self, name: &str) {
        if self.nodes.unbounded_send(ObjectRef::new(name)).is_err() {
            debug!("Node controller has stopped, not reconciling {}", name);
        }
    }

    /// Requests a reconciliation of a ClusterCIDR
    pub fn pool(&self, name: &str) {
        if self.pools.unbounded_send(ObjectRef::new(name)).is_err() {
            debug!("ClusterCIDR controller has stopped, not reconciling {}", name);
        }
    }
}

/// Reconciles nodes and ClusterCIDRs.
pub struct Reconciler {
    registry: PoolRegistry,
    nodes: Store<Node>,
    pools: Store<ClusterCIDR>,
    node_client: Arc<dyn NodeClient>,
    pool_client: Arc<dyn PoolClient>,
    triggers: Triggers,
    retries: RetryTracker,
    /// Allocation records by node name
    allocations: Mutex<HashMap<String, NodeAllocation>>,
    metrics: Arc<Metrics>,
    /// Flipped once `startup` has rebuilt the in-memory state
    started: watch::Sender<bool>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        nodes: Store<Node>,
        pools: Store<ClusterCIDR>,
        node_client: Arc<dyn NodeClient>,
        pool_client: Arc<dyn PoolClient>,
        triggers: Triggers,
        retries: RetryTracker,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry: PoolRegistry::new(),
            nodes,
            pools,
            node_client,
            pool_client,
            triggers,
            retries,
            allocations: Mutex::new(HashMap::new()),
            metrics,
            started: watch::channel(false).0,
        }
    }

    /// Registered pools
    #[cfg(test)]
    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Allocation record of a node, if it holds ranges
    pub fn allocation(&self, node: &str) -> Option<NodeAllocation> {
        self.lock_allocations().get(node).cloned()
    }

    /// Rebuilds in-memory state from the synced caches, then lets the
    /// controllers reconcile.
    ///
    /// Registers every known pool, marks the Pod CIDRs nodes already carry
    /// as allocated, and only then makes the live pools selectable.
    pub fn startup(&self) {
        let pools = self.pools.state();
        info!("Performing startup reconciliation from {} ClusterCIDR(s)", pools.len());

        // Register pools, including ones already terminating: their nodes
        // still need releasing
        for cc in &pools {
            let name = cc.name_any();
            match self.registry.register(cc) {
                Ok(_) => {
                    if let Some(pool) = self.registry.get(&name) {
                        self.metrics.pool_registered(&pool);
                    }
                    if cc.is_terminating() {
                        self.registry.mark_terminating(&name);
                    }
                }
                Err(e) => error!("Failed to register ClusterCIDR {}: {}", name, e),
            }
        }

        if self.registry.is_empty() {
            warn!("No usable ClusterCIDR found, nodes will wait until one is created");
        } else {
            info!("Registered {} ClusterCIDR(s)", self.registry.len());
        }

        // Rehydrate allocations recorded on nodes
        let nodes = self.nodes.state();
        let mut adopted = 0;
        for node in &nodes {
            let cidrs = node::pod_cidrs(node);
            if !cidrs.is_empty() && self.adopt_node(node, cidrs) {
                adopted += 1;
            }
        }
        info!("Rehydrated Pod CIDRs of {} of {} node(s)", adopted, nodes.len());

        // Terminating pools stay out of selection
        for cc in &pools {
            self.registry.activate(&cc.name_any());
        }

        self.started.send_replace(true);
    }

    /// Waits until `startup` has run
    async fn wait_started(&self) {
        let mut started = self.started.subscribe();
        if started.wait_for(|started| *started).await.is_err() {
            warn!("Startup signal dropped before startup completed");
        }
    }

    /// Handles watch events the Node controller does not reconcile.
    ///
    /// Called after the event reached the cache.
    pub fn observe_node(&self, event: &Event<Node>) {
        match event {
            Event::Delete(node) => {
                let name = node.name_any();
                match self.allocation(&name) {
                    Some(record) if record.uid != node.uid() => {
                        debug!("Ignoring delete of a previous incarnation of node {}", name);
                    }
                    _ => self.release_node(&name),
                }
            }
            // Nodes deleted while the watch was down never get a Delete
            Event::InitDone => {
                let recorded: Vec<String> = self.lock_allocations().keys().cloned().collect();
                for name in recorded {
                    if self.nodes.get(&ObjectRef::new(&name)).is_none() {
                        info!("Node {} disappeared while the watch was down", name);
                        self.release_node(&name);
                    }
                }
            }
            Event::Init | Event::InitApply(_) | Event::Apply(_) => {}
        }
    }

    /// Handles watch events the ClusterCIDR controller does not reconcile.
    ///
    /// Called after the event reached the cache.
    pub fn observe_pool(&self, event: &Event<ClusterCIDR>) {
        match event {
            Event::Delete(cc) => self.forget_deleted_pool(&cc.name_any()),
            Event::InitDone => {
                for name in self.registry.names() {
                    if self.pools.get(&ObjectRef::new(&name)).is_none() {
                        self.forget_deleted_pool(&name);
                    }
                }
            }
            Event::Init | Event::InitApply(_) | Event::Apply(_) => {}
        }
    }

    /// Gives back an association. A pool left unused while terminating is
    /// reconciled again, or dropped if its object is gone.
    fn release_association(&self, pool: &str) {
        if !self.registry.decrement_association(pool) {
            return;
        }
        if self.pools.get(&ObjectRef::new(pool)).is_some() {
            debug!("ClusterCIDR {} has no nodes left, requesting reconciliation", pool);
            self.triggers.pool(pool);
        } else {
            self.unregister_pool(pool);
        }
    }

    /// Drops an unused pool and its metrics
    fn unregister_pool(&self, name: &str) {
        let pool = self.registry.get(name);
        match self.registry.unregister(name) {
            Ok(()) => {
                if let Some(pool) = pool {
                    self.metrics.pool_removed(&pool);
                }
                info!("Unregistered ClusterCIDR {}", name);
            }
            Err(e) => warn!("Failed to unregister ClusterCIDR {}: {}", name, e),
        }
    }

    /// Decides what happens after a failed reconciliation
    fn retry_action(&self, controller: &'static str, name: &str, error: &ControllerError) -> Action {
        let key = format!("{controller}/{name}");
        if !error.is_retryable() {
            error!("Failed to sync {} {}: {}", controller, name, error);
            self.retries.reset(&key);
            return Action::await_change();
        }
        match self.retries.next_delay(&key) {
            Some(delay) => {
                warn!(
                    "Failed to sync {} {}: {} (retry {} in {:?})",
                    controller,
                    name,
                    error,
                    self.retries.retries(&key),
                    delay
                );
                Action::requeue(delay)
            }
            None => {
                error!("Giving up on {} {} after repeated failures: {}", controller, name, error);
                self.metrics.record_sync_failure(controller);
                Action::await_change()
            }
        }
    }

    fn lock_allocations(&self) -> MutexGuard<'_, HashMap<String, NodeAllocation>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Node controller reconcile function
///
/// # Errors
///
/// Returns the error of `Reconciler::sync_node`.
pub async fn reconcile_node(node: Arc<Node>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    ctx.wait_started().await;
    let name = node.name_any();
    ctx.sync_node(&name).await?;
    ctx.retries.reset(&format!("node/{name}"));
    Ok(Action::await_change())
}

/// Node controller error policy: exponential backoff up to the retry cap
pub fn node_error_policy(node: Arc<Node>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    ctx.retry_action("node", &node.name_any(), error)
}

/// ClusterCIDR controller reconcile function
///
/// # Errors
///
/// Returns the error of `Reconciler::sync_pool`.
pub async fn reconcile_pool(cc: Arc<ClusterCIDR>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    ctx.wait_started().await;
    let name = cc.name_any();
    ctx.sync_pool(&name).await?;
    ctx.retries.reset(&format!("pool/{name}"));
    Ok(Action::await_change())
}

/// ClusterCIDR controller error policy: exponential backoff up to the retry cap
pub fn pool_error_policy(cc: Arc<ClusterCIDR>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    ctx.retry_action("pool", &cc.name_any(), error)
}

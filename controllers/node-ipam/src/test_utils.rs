//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data, in-memory
//! implementations of the write clients, and a harness wiring a
//! `Reconciler` to reflector stores the test feeds by hand.

use crate::backoff::{ExponentialBackoff, RetryTracker};
use crate::client::{NodeClient, PoolClient};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{Reconciler, TriggerStreams, triggers};
use async_trait::async_trait;
use crds::{
    ClusterCIDR, ClusterCIDRSpec, NodeSelector, NodeSelectorOperator,
    NodeSelectorRequirement, NodeSelectorTerm,
};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Node, NodeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use kube_runtime::reflector::Store;
use kube_runtime::reflector::store::Writer;
use kube_runtime::watcher;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Helper to create test ClusterCIDR CRD
///
/// `labels` become one `In` requirement each, all in a single term; no
/// labels means no selector.
pub fn create_test_cluster_cidr(
    name: &str,
    ipv4: &str,
    ipv6: &str,
    host_bits: i32,
    labels: &[(&str, &str)],
) -> ClusterCIDR {
    let node_selector = (!labels.is_empty()).then(|| NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: labels
                .iter()
                .map(|(k, v)| NodeSelectorRequirement::new(*k, NodeSelectorOperator::In, [*v]))
                .collect(),
            match_fields: vec![],
        }],
    });

    ClusterCIDR {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: ClusterCIDRSpec {
            node_selector,
            per_node_host_bits4: host_bits,
            per_node_host_bits6: host_bits,
            ipv4: ipv4.to_string(),
            ipv6: ipv6.to_string(),
        },
    }
}

/// Helper to create test Node
pub fn create_test_node(name: &str, uid: &str, labels: &[(&str, &str)], pod_cidrs: &[&str]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            pod_cidr: pod_cidrs.first().map(|c| (*c).to_string()),
            pod_cidrs: (!pod_cidrs.is_empty())
                .then(|| pod_cidrs.iter().map(|c| (*c).to_string()).collect()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Marks a ClusterCIDR as deleted-but-finalizing
pub fn mark_deleted(cc: &mut ClusterCIDR) {
    cc.metadata.deletion_timestamp = Some(Time(Default::default()));
}

/// Failure a mock client returns on its next call
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    /// Write lost a race
    Conflict,
    /// Target object is gone
    NotFound,
}

impl MockFailure {
    fn into_error(self, target: &str) -> ControllerError {
        match self {
            Self::Conflict => ControllerError::Conflict(target.to_string()),
            Self::NotFound => ControllerError::NotFound(target.to_string()),
        }
    }
}

/// In-memory `NodeClient`
#[derive(Debug, Default)]
pub struct MockNodeClient {
    patched: Mutex<HashMap<String, Vec<IpNet>>>,
    events: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<MockFailure>>,
}

impl MockNodeClient {
    /// Makes the next patch fail
    pub fn fail_next(&self, failure: MockFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    /// CIDRs last patched onto a node
    pub fn patched(&self, name: &str) -> Option<Vec<String>> {
        self.patched
            .lock()
            .unwrap()
            .get(name)
            .map(|cidrs| cidrs.iter().map(ToString::to_string).collect())
    }

    /// Recorded (node, message) events
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn patch_pod_cidrs(&self, name: &str, cidrs: &[IpNet]) -> Result<(), ControllerError> {
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure.into_error(name));
        }
        self.patched
            .lock()
            .unwrap()
            .insert(name.to_string(), cidrs.to_vec());
        Ok(())
    }

    async fn report_cidr_not_available(&self, node: &Node, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((node.name_any(), message.to_string()));
    }
}

/// In-memory `PoolClient` tracking which pools carry the finalizer
#[derive(Debug, Default)]
pub struct MockPoolClient {
    finalizers: Mutex<HashMap<String, bool>>,
    failures: Mutex<VecDeque<MockFailure>>,
}

impl MockPoolClient {
    /// Makes the next finalizer update fail
    pub fn fail_next(&self, failure: MockFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    /// Whether the finalizer is currently on the pool
    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.lock().unwrap().get(name).copied().unwrap_or(false)
    }

    fn set(&self, cc: &ClusterCIDR, present: bool) -> Result<(), ControllerError> {
        let name = cc.name_any();
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure.into_error(&name));
        }
        self.finalizers.lock().unwrap().insert(name, present);
        Ok(())
    }
}

#[async_trait]
impl PoolClient for MockPoolClient {
    async fn add_finalizer(&self, cc: &ClusterCIDR) -> Result<(), ControllerError> {
        self.set(cc, true)
    }

    async fn remove_finalizer(&self, cc: &ClusterCIDR) -> Result<(), ControllerError> {
        self.set(cc, false)
    }
}

/// Reconciler over the given caches, with mock clients and fast retries
pub struct TestReconciler {
    pub reconciler: Arc<Reconciler>,
    pub node_client: Arc<MockNodeClient>,
    pub pool_client: Arc<MockPoolClient>,
    pub metrics: Arc<Metrics>,
    pub requests: TriggerStreams,
}

/// Builds a `Reconciler` reading the given caches
pub fn test_reconciler(nodes: Store<Node>, pools: Store<ClusterCIDR>) -> TestReconciler {
    let node_client = Arc::new(MockNodeClient::default());
    let pool_client = Arc::new(MockPoolClient::default());
    let metrics = Arc::new(Metrics::new().unwrap());
    let (triggers, requests) = triggers();
    let retries = RetryTracker::new(ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)), 3);

    let reconciler = Arc::new(Reconciler::new(
        nodes,
        pools,
        Arc::clone(&node_client) as Arc<dyn NodeClient>,
        Arc::clone(&pool_client) as Arc<dyn PoolClient>,
        triggers,
        retries,
        Arc::clone(&metrics),
    ));

    TestReconciler {
        reconciler,
        node_client,
        pool_client,
        metrics,
        requests,
    }
}

/// Reconciler wired to hand-fed caches and mock clients
pub struct TestEnv {
    pub reconciler: Arc<Reconciler>,
    pub node_client: Arc<MockNodeClient>,
    pub pool_client: Arc<MockPoolClient>,
    pub metrics: Arc<Metrics>,
    requests: TriggerStreams,
    node_writer: Writer<Node>,
    pool_writer: Writer<ClusterCIDR>,
}

impl TestEnv {
    /// Creates an environment with empty caches
    pub fn new() -> Self {
        let node_writer: Writer<Node> = Writer::default();
        let pool_writer: Writer<ClusterCIDR> = Writer::default();
        let TestReconciler {
            reconciler,
            node_client,
            pool_client,
            metrics,
            requests,
        } = test_reconciler(node_writer.as_reader(), pool_writer.as_reader());

        Self {
            reconciler,
            node_client,
            pool_client,
            metrics,
            requests,
            node_writer,
            pool_writer,
        }
    }

    /// Puts a node into the cache
    pub fn apply_node(&mut self, node: Node) {
        self.node_writer.apply_watcher_event(&watcher::Event::Apply(node));
    }

    /// Removes a node from the cache and handles the delete
    pub fn delete_node(&mut self, node: Node) {
        let event = watcher::Event::Delete(node);
        self.node_writer.apply_watcher_event(&event);
        self.reconciler.observe_node(&event);
    }

    /// Replaces the node cache with a full relist
    pub fn relist_nodes(&mut self, nodes: Vec<Node>) {
        self.node_writer.apply_watcher_event(&watcher::Event::Init);
        for node in nodes {
            self.node_writer.apply_watcher_event(&watcher::Event::InitApply(node));
        }
        self.node_writer.apply_watcher_event(&watcher::Event::InitDone);
        self.reconciler.observe_node(&watcher::Event::InitDone);
    }

    /// Puts a ClusterCIDR into the cache
    pub fn apply_pool(&mut self, cc: ClusterCIDR) {
        self.pool_writer.apply_watcher_event(&watcher::Event::Apply(cc));
    }

    /// Removes a ClusterCIDR from the cache and handles the delete
    pub fn delete_pool(&mut self, cc: ClusterCIDR) {
        let event = watcher::Event::Delete(cc);
        self.pool_writer.apply_watcher_event(&event);
        self.reconciler.observe_pool(&event);
    }

    /// Adds a ClusterCIDR to the cache and syncs it
    pub async fn create_pool(&mut self, cc: ClusterCIDR) {
        let name = cc.name_any();
        self.apply_pool(cc);
        self.reconciler.sync_pool(&name).await.unwrap();
    }

    /// Adds a node to the cache and syncs it, returning the patched CIDRs
    pub async fn create_node(&mut self, node: Node) -> Result<Vec<String>, ControllerError> {
        let name = node.name_any();
        self.apply_node(node);
        self.reconciler.sync_node(&name).await?;
        Ok(self.node_client.patched(&name).unwrap_or_default())
    }

    /// Nodes requested for reconciliation so far, in order
    pub fn drain_node_triggers(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(obj) = self.requests.nodes.try_recv() {
            names.push(obj.name);
        }
        names
    }

    /// ClusterCIDRs requested for reconciliation so far, in order
    pub fn drain_pool_triggers(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(obj) = self.requests.pools.try_recv() {
            names.push(obj.name);
        }
        names
    }
}

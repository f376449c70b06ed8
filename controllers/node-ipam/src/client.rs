//! Kubernetes write operations.
//!
//! The reconciler reads from the reflector caches and writes through the
//! `NodeClient` and `PoolClient` traits. The kube implementations live
//! here; tests swap in the in-memory mocks from `test_utils`.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{CLUSTER_CIDR_FINALIZER, ClusterCIDR};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{debug, warn};

/// Name the controller reports itself as
pub const CONTROLLER_NAME: &str = "node-ipam-controller";

/// Reason of the Event recorded when a node cannot get ranges
pub const CIDR_NOT_AVAILABLE: &str = "CIDRNotAvailable";

/// Writes to Node objects
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Sets `spec.podCIDR` and `spec.podCIDRs` in one patch.
    ///
    /// Returns `Conflict` if the write lost a race and `NotFound` if the
    /// node is gone.
    async fn patch_pod_cidrs(&self, name: &str, cidrs: &[IpNet]) -> Result<(), ControllerError>;

    /// Records a Warning Event on the node. Failures are only logged.
    async fn report_cidr_not_available(&self, node: &Node, message: &str);
}

/// Writes to ClusterCIDR objects
#[async_trait]
pub trait PoolClient: Send + Sync {
    /// Adds the deletion-blocking finalizer if it is missing
    async fn add_finalizer(&self, cc: &ClusterCIDR) -> Result<(), ControllerError>;

    /// Removes the deletion-blocking finalizer, letting the pool go
    async fn remove_finalizer(&self, cc: &ClusterCIDR) -> Result<(), ControllerError>;
}

/// Maps API failures onto the controller's retry taxonomy
pub fn classify(target: impl Into<String>, error: kube::Error) -> ControllerError {
    let code = match &error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    };
    match code {
        Some(404) => ControllerError::NotFound(target.into()),
        Some(409 | 422) => ControllerError::Conflict(target.into()),
        _ => ControllerError::Kube(error),
    }
}

/// JSON merge patch assigning Pod CIDRs, primary family first
#[must_use]
pub fn pod_cidrs_patch(cidrs: &[IpNet]) -> serde_json::Value {
    let cidrs: Vec<String> = cidrs.iter().map(ToString::to_string).collect();
    serde_json::json!({
        "spec": {
            "podCIDR": cidrs.first(),
            "podCIDRs": cidrs,
        }
    })
}

/// `NodeClient` backed by the API server
pub struct KubeNodeClient {
    api: Api<Node>,
    recorder: Recorder,
}

impl KubeNodeClient {
    /// Creates a client writing through `client`
    #[must_use]
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            api: Api::all(client.clone()),
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn patch_pod_cidrs(&self, name: &str, cidrs: &[IpNet]) -> Result<(), ControllerError> {
        let patch = pod_cidrs_patch(cidrs);
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(format!("node {name}"), e))?;
        debug!("Patched node {} with Pod CIDRs {:?}", name, cidrs);
        Ok(())
    }

    async fn report_cidr_not_available(&self, node: &Node, message: &str) {
        let event = Event {
            type_: EventType::Warning,
            reason: CIDR_NOT_AVAILABLE.to_string(),
            note: Some(message.to_string()),
            action: "AllocatePodCIDR".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &node.object_ref(&())).await {
            warn!("Failed to record {} event on node {}: {}", CIDR_NOT_AVAILABLE, node.name_any(), e);
        }
    }
}

/// `PoolClient` backed by the API server
pub struct KubePoolClient {
    api: Api<ClusterCIDR>,
}

impl KubePoolClient {
    /// Creates a client writing through `client`
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }

    async fn patch_finalizers(&self, cc: &ClusterCIDR, finalizers: Vec<String>) -> Result<(), ControllerError> {
        let name = cc.name_any();
        // resourceVersion makes the merge patch fail on a concurrent change
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cc.resource_version(),
            }
        });
        self.api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(format!("ClusterCIDR {name}"), e))?;
        Ok(())
    }
}

#[async_trait]
impl PoolClient for KubePoolClient {
    async fn add_finalizer(&self, cc: &ClusterCIDR) -> Result<(), ControllerError> {
        if cc.has_finalizer() {
            return Ok(());
        }
        let mut finalizers = cc.finalizers().to_vec();
        finalizers.push(CLUSTER_CIDR_FINALIZER.to_string());
        self.patch_finalizers(cc, finalizers).await
    }

    async fn remove_finalizer(&self, cc: &ClusterCIDR) -> Result<(), ControllerError> {
        if !cc.has_finalizer() {
            return Ok(());
        }
        let finalizers = cc
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CLUSTER_CIDR_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(cc, finalizers).await
    }
}

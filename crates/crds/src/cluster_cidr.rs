//! ClusterCIDR CRD
//!
//! Declares one pool of Pod CIDRs: an IPv4 and/or IPv6 block, the size of
//! the range handed to each node, and which nodes the pool applies to.

use crate::node_selector::NodeSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer that keeps a ClusterCIDR alive while nodes still hold ranges from it
pub const CLUSTER_CIDR_FINALIZER: &str = "networking.x-k8s.io/cluster-cidr-finalizer";

/// ClusterCIDRSpec defines the desired state of a ClusterCIDR.
///
/// All fields are immutable once the object is created.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[kube(
    group = "networking.x-k8s.io",
    version = "v1",
    kind = "ClusterCIDR",
    shortname = "cc",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCIDRSpec {
    /// Which nodes the pool applies to. Empty or absent selects all nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,

    /// Host bits of each node's IPv4 range (8 gives a /24). Minimum 4.
    #[serde(default)]
    pub per_node_host_bits4: i32,

    /// Host bits of each node's IPv6 range (8 gives a /120). Minimum 4.
    #[serde(default)]
    pub per_node_host_bits6: i32,

    /// IPv4 block in CIDR notation (e.g. "10.0.0.0/8")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv4: String,

    /// IPv6 block in CIDR notation (e.g. "fd00:10:96::/112")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv6: String,
}

impl ClusterCIDR {
    /// Deletion was requested (deletionTimestamp is set)
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The deletion-blocking finalizer is present
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLUSTER_CIDR_FINALIZER)
    }
}

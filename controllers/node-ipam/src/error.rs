//! Controller-specific error types.
//!
//! Every failure a reconciliation can hit maps to one variant here. The
//! error policy decides from the variant whether the object is retried with
//! backoff or left alone until it changes.

use cidrset::CidrSetError;
use crds::ValidationErrors;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Node IPAM Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// ClusterCIDR spec is malformed or was changed after registration
    #[error("ClusterCIDR {name} is invalid: {errors}")]
    Validation {
        /// Pool name
        name: String,
        /// Every problem found
        errors: ValidationErrors,
    },

    /// Every matching pool is out of free sub-blocks
    #[error("No free CIDR left for node {0} in any matching ClusterCIDR")]
    Exhausted(String),

    /// No pool selects the node
    #[error("No ClusterCIDR matches node {0}")]
    NoMatch(String),

    /// A concurrent write won the race
    #[error("Conflicting update on {0}")]
    Conflict(String),

    /// Pool removal attempted while nodes still hold ranges from it
    #[error("ClusterCIDR {name} is still used by {associations} node(s)")]
    PoolInUse {
        /// Pool name
        name: String,
        /// Nodes still holding ranges from the pool
        associations: usize,
    },

    /// Target object vanished between observation and action
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Range set operation failed
    #[error("CIDR allocation failed: {0}")]
    CidrSet(#[from] CidrSetError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe server failed to bind or serve
    #[error("Probe server error: {0}")]
    Server(#[from] std::io::Error),
}

impl ControllerError {
    /// Whether the failed reconciliation should be retried with backoff.
    ///
    /// Validation errors stay put until the object changes, and a vanished
    /// object is handled as a delete on its next event.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::NotFound(_))
    }
}

//! Node IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the node IPAM controller,
//! the node selector types they embed, and the validation rules a
//! `ClusterCIDR` must satisfy before the controller will allocate from it.

pub mod cluster_cidr;
pub mod node_selector;
pub mod validation;

pub use cluster_cidr::*;
pub use node_selector::*;
pub use validation::{FamilyBlock, FieldError, IpFamily, ValidationErrors};

//! CIDR set errors

use ipnet::IpNet;
use thiserror::Error;

/// Errors that can occur when allocating from or releasing to a `CidrSet`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrSetError {
    /// Every sub-block of the set is already allocated
    #[error("CIDR set {0} has no free sub-block left")]
    Exhausted(IpNet),

    /// The requested sub-block is already marked as allocated
    #[error("sub-block {0} is already allocated")]
    AlreadyOccupied(IpNet),

    /// The sub-block does not belong to this set (wrong size, outside the block, or beyond the cap)
    #[error("sub-block {cidr} is out of range for {block}")]
    OutOfRange {
        /// Sub-block that was looked up
        cidr: IpNet,
        /// Base block of the set
        block: IpNet,
    },

    /// Host bits are larger than what the block can hold
    #[error("per-node host bits {host_bits} do not fit into {block}")]
    InvalidHostBits {
        /// Base block of the set
        block: IpNet,
        /// Requested host bits
        host_bits: u8,
    },

    /// IPv4 sub-block passed to an IPv6 set or vice versa
    #[error("address family of {cidr} does not match {block}")]
    FamilyMismatch {
        /// Sub-block that was looked up
        cidr: IpNet,
        /// Base block of the set
        block: IpNet,
    },
}

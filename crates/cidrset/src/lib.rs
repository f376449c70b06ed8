//! CIDR Set
//!
//! A bitmap allocator over a single CIDR block. The block is sliced into
//! fixed-size sub-blocks of `2^host_bits` addresses; each sub-block is one
//! bit in the bitmap. The set knows nothing about nodes or pools, it only
//! hands out and takes back sub-blocks.
//!
//! # Example
//!
//! ```
//! use cidrset::CidrSet;
//!
//! let set = CidrSet::new("10.0.0.0/16".parse().unwrap(), 8).unwrap();
//! let first = set.allocate_next().unwrap();
//! assert_eq!(first.to_string(), "10.0.0.0/24");
//!
//! set.release(&first).unwrap();
//! assert_eq!(set.allocate_next().unwrap(), first);
//! ```
//!
//! All operations take `&self`; mutations are serialized by a mutex owned by
//! the set, so a `CidrSet` can be shared between worker tasks behind an `Arc`.

pub mod error;

pub use error::CidrSetError;

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Upper bound on the bitmap size, expressed in bits of sub-block index.
///
/// Blocks that could be sliced into more than `2^16` sub-blocks are capped:
/// only the first `MAX_SUB_BLOCKS` sub-blocks are ever handed out.
pub const MAX_SUB_BLOCK_BITS: u32 = 16;

/// Maximum number of sub-blocks a single set tracks (8 KiB of bitmap).
pub const MAX_SUB_BLOCKS: usize = 1 << MAX_SUB_BLOCK_BITS;

const WORD_BITS: usize = u64::BITS as usize;

/// Occupancy snapshot of a `CidrSet`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    /// Number of sub-blocks currently allocated
    pub allocated: usize,
    /// Number of sub-blocks the set can hand out
    pub max: usize,
}

impl Usage {
    /// Fraction of the set that is allocated, in `[0.0, 1.0]`
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "sub-block counts are capped at 2^16")]
    pub fn ratio(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.allocated as f64 / self.max as f64
    }
}

#[derive(Debug)]
struct Bitmap {
    words: Vec<u64>,
    len: usize,
    allocated: usize,
    // Every index below this one is allocated.
    next_hint: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
            allocated: 0,
            next_hint: 0,
        }
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize) {
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        self.allocated += 1;
    }

    fn clear(&mut self, index: usize) {
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        self.allocated -= 1;
        self.next_hint = self.next_hint.min(index);
    }

    /// Lowest free index at or above `next_hint`.
    fn first_clear(&self) -> Option<usize> {
        let mut word_index = self.next_hint / WORD_BITS;
        let mut mask = u64::MAX << (self.next_hint % WORD_BITS);

        while word_index < self.words.len() {
            let free = !self.words[word_index] & mask;
            if free != 0 {
                let index = word_index * WORD_BITS + free.trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
            word_index += 1;
            mask = u64::MAX;
        }
        None
    }
}

/// Bitmap allocator over one CIDR block
#[derive(Debug)]
pub struct CidrSet {
    block: IpNet,
    host_bits: u8,
    max_count: usize,
    bitmap: Mutex<Bitmap>,
}

impl CidrSet {
    /// Creates a set over `block`, handing out sub-blocks of `2^host_bits` addresses.
    ///
    /// The base address is truncated to the block's prefix length, so
    /// `10.0.0.7/16` behaves like `10.0.0.0/16`.
    ///
    /// # Errors
    ///
    /// Returns `CidrSetError::InvalidHostBits` if `host_bits` exceeds the
    /// number of host bits available in `block`.
    pub fn new(block: IpNet, host_bits: u8) -> Result<Self, CidrSetError> {
        let block = block.trunc();
        let available = u32::from(block.max_prefix_len() - block.prefix_len());
        if u32::from(host_bits) > available {
            return Err(CidrSetError::InvalidHostBits { block, host_bits });
        }

        let index_bits = available - u32::from(host_bits);
        let max_count = if index_bits >= MAX_SUB_BLOCK_BITS {
            MAX_SUB_BLOCKS
        } else {
            1 << index_bits
        };

        Ok(Self {
            block,
            host_bits,
            max_count,
            bitmap: Mutex::new(Bitmap::new(max_count)),
        })
    }

    /// Base block of the set
    #[must_use]
    pub fn block(&self) -> IpNet {
        self.block
    }

    /// Host bits of each sub-block
    #[must_use]
    pub fn host_bits(&self) -> u8 {
        self.host_bits
    }

    /// Prefix length of every sub-block handed out by this set
    #[must_use]
    pub fn sub_block_prefix_len(&self) -> u8 {
        self.block.max_prefix_len() - self.host_bits
    }

    /// Number of sub-blocks this set can hand out
    #[must_use]
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Allocates the lowest free sub-block.
    ///
    /// # Errors
    ///
    /// Returns `CidrSetError::Exhausted` when every sub-block is taken.
    pub fn allocate_next(&self) -> Result<IpNet, CidrSetError> {
        let mut bitmap = self.lock();
        let index = bitmap
            .first_clear()
            .ok_or(CidrSetError::Exhausted(self.block))?;
        let cidr = self.sub_block_at(index)?;

        bitmap.set(index);
        bitmap.next_hint = index + 1;
        Ok(cidr)
    }

    /// Marks a specific sub-block as allocated.
    ///
    /// Used to rebuild the bitmap from ranges already recorded on nodes.
    ///
    /// # Errors
    ///
    /// Returns `CidrSetError::AlreadyOccupied` if the sub-block is taken, or
    /// `OutOfRange` / `FamilyMismatch` if it does not belong to this set.
    pub fn allocate(&self, cidr: &IpNet) -> Result<(), CidrSetError> {
        let index = self.index_of(cidr)?;
        let mut bitmap = self.lock();
        if bitmap.is_set(index) {
            return Err(CidrSetError::AlreadyOccupied(cidr.trunc()));
        }
        bitmap.set(index);
        Ok(())
    }

    /// Releases a sub-block. Releasing a free sub-block is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` / `FamilyMismatch` if the sub-block does not
    /// belong to this set.
    pub fn release(&self, cidr: &IpNet) -> Result<(), CidrSetError> {
        let index = self.index_of(cidr)?;
        let mut bitmap = self.lock();
        if bitmap.is_set(index) {
            bitmap.clear(index);
        }
        Ok(())
    }

    /// Whether `cidr` is currently allocated.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` / `FamilyMismatch` if the sub-block does not
    /// belong to this set.
    pub fn is_allocated(&self, cidr: &IpNet) -> Result<bool, CidrSetError> {
        let index = self.index_of(cidr)?;
        Ok(self.lock().is_set(index))
    }

    /// Whether `cidr` is one of the sub-blocks this set can hand out
    #[must_use]
    pub fn contains(&self, cidr: &IpNet) -> bool {
        self.index_of(cidr).is_ok()
    }

    /// Current occupancy
    #[must_use]
    pub fn usage(&self) -> Usage {
        Usage {
            allocated: self.lock().allocated,
            max: self.max_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bitmap> {
        // Mutations never leave the bitmap half-updated, so a poisoned lock is still usable.
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_of(&self, cidr: &IpNet) -> Result<usize, CidrSetError> {
        let out_of_range = || CidrSetError::OutOfRange {
            cidr: *cidr,
            block: self.block,
        };

        match (self.block, cidr) {
            (IpNet::V4(_), IpNet::V4(_)) | (IpNet::V6(_), IpNet::V6(_)) => {}
            _ => {
                return Err(CidrSetError::FamilyMismatch {
                    cidr: *cidr,
                    block: self.block,
                });
            }
        }

        if cidr.prefix_len() != self.sub_block_prefix_len() {
            return Err(out_of_range());
        }
        let cidr = cidr.trunc();
        if !self.block.contains(&cidr) {
            return Err(out_of_range());
        }

        let offset = (addr_to_u128(cidr.network()) - addr_to_u128(self.block.network()))
            .checked_shr(u32::from(self.host_bits))
            .unwrap_or(0);
        let index = usize::try_from(offset).map_err(|_| out_of_range())?;
        if index >= self.max_count {
            return Err(out_of_range());
        }
        Ok(index)
    }

    fn sub_block_at(&self, index: usize) -> Result<IpNet, CidrSetError> {
        let offset = (index as u128)
            .checked_shl(u32::from(self.host_bits))
            .unwrap_or(0);
        let value = addr_to_u128(self.block.network()) + offset;
        let addr = match self.block {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(
                u32::try_from(value).map_err(|_| CidrSetError::Exhausted(self.block))?,
            )),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
        };
        IpNet::new(addr, self.sub_block_prefix_len()).map_err(|_| CidrSetError::Exhausted(self.block))
    }
}

fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

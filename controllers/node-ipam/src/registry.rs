//! Pool registry.
//!
//! Owns one `CidrSet` per configured address family of every registered
//! ClusterCIDR, plus the per-pool bookkeeping that governs deletion: how
//! many nodes hold ranges from the pool, and whether deletion was
//! requested.
//!
//! Each `CidrSet` serializes its own mutations. The association table is a
//! separate exclusion domain, so allocating from one pool never waits on
//! another.

use cidrset::{CidrSet, CidrSetError};
use crds::validation::{self, FamilyBlock};
use crds::{ClusterCIDR, ClusterCIDRSpec, IpFamily, NodeSelector};
use ipnet::IpNet;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error::ControllerError;

/// One address family of a pool
#[derive(Debug)]
pub struct FamilySet {
    /// Address family
    pub family: IpFamily,
    /// Allocator over the family's block
    pub set: CidrSet,
}

/// A registered ClusterCIDR with its allocators
#[derive(Debug)]
pub struct Pool {
    name: String,
    spec: ClusterCIDRSpec,
    // Ordered IPv4, IPv6.
    families: Vec<FamilySet>,
}

impl Pool {
    /// Validates a spec and builds the allocators for it.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Validation` if the spec is malformed.
    pub fn new(name: impl Into<String>, spec: ClusterCIDRSpec) -> Result<Self, ControllerError> {
        let name = name.into();
        let blocks = validation::validate_spec(&spec).map_err(|errors| ControllerError::Validation {
            name: name.clone(),
            errors,
        })?;

        let families = blocks
            .into_iter()
            .map(|FamilyBlock { family, block, host_bits }| {
                Ok(FamilySet {
                    family,
                    set: CidrSet::new(block, host_bits)?,
                })
            })
            .collect::<Result<Vec<_>, CidrSetError>>()?;

        Ok(Self { name, spec, families })
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spec the pool was registered with
    #[must_use]
    pub fn spec(&self) -> &ClusterCIDRSpec {
        &self.spec
    }

    /// Node selector, if any
    #[must_use]
    pub fn node_selector(&self) -> Option<&NodeSelector> {
        self.spec.node_selector.as_ref()
    }

    /// Configured families in IPv4, IPv6 order
    #[must_use]
    pub fn families(&self) -> &[FamilySet] {
        &self.families
    }

    /// First configured family: IPv4 when present
    fn primary(&self) -> Option<&CidrSet> {
        self.families.first().map(|f| &f.set)
    }

    /// Sub-blocks a node can be given: the smallest family's count
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.families.iter().map(|f| f.set.max_count()).min().unwrap_or(0)
    }

    /// Per-node host bits of the primary family
    #[must_use]
    pub fn host_bits(&self) -> u8 {
        self.primary().map_or(0, CidrSet::host_bits)
    }

    /// Base block of the primary family
    #[must_use]
    pub fn base_block(&self) -> Option<IpNet> {
        self.primary().map(CidrSet::block)
    }

    /// Whether every CIDR is a sub-block of one of this pool's families
    #[must_use]
    pub fn owns(&self, cidrs: &[IpNet]) -> bool {
        !cidrs.is_empty()
            && cidrs
                .iter()
                .all(|cidr| self.families.iter().any(|f| f.set.contains(cidr)))
    }

    /// Allocates one sub-block per family, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns the first family's error; sub-blocks taken from earlier
    /// families are released first.
    pub fn allocate_all(&self) -> Result<Vec<IpNet>, CidrSetError> {
        let mut cidrs = Vec::with_capacity(self.families.len());
        for family in &self.families {
            match family.set.allocate_next() {
                Ok(cidr) => cidrs.push(cidr),
                Err(e) => {
                    self.release_all(&cidrs);
                    return Err(e);
                }
            }
        }
        Ok(cidrs)
    }

    /// Marks already-assigned sub-blocks as taken, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOccupied` if another node holds one of them, or
    /// `OutOfRange` if the pool does not own one of them.
    pub fn occupy(&self, cidrs: &[IpNet]) -> Result<(), CidrSetError> {
        for (i, cidr) in cidrs.iter().enumerate() {
            let result = self
                .set_for(cidr)
                .ok_or(CidrSetError::OutOfRange {
                    cidr: *cidr,
                    block: self.base_block().unwrap_or(*cidr),
                })
                .and_then(|set| set.allocate(cidr));
            if let Err(e) = result {
                self.release_all(&cidrs[..i]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Releases sub-blocks. Already free ones are skipped.
    pub fn release_all(&self, cidrs: &[IpNet]) {
        for cidr in cidrs {
            match self.set_for(cidr) {
                Some(set) => {
                    if let Err(e) = set.release(cidr) {
                        warn!("Failed to release {} from ClusterCIDR {}: {}", cidr, self.name, e);
                    }
                }
                None => warn!("CIDR {} does not belong to ClusterCIDR {}", cidr, self.name),
            }
        }
    }

    fn set_for(&self, cidr: &IpNet) -> Option<&CidrSet> {
        self.families
            .iter()
            .map(|f| &f.set)
            .find(|set| set.contains(cidr))
    }
}

/// Result of `PoolRegistry::register`
#[derive(Debug, Clone)]
pub enum Registration {
    /// Pool is new; it stays pending until `activate`
    Added,
    /// Pool replaced the unused leftover of a deleted pool of the same
    /// name; it stays pending until `activate`
    Replaced(Arc<Pool>),
    /// Pool was recreated with the spec of a deleted pool whose nodes still
    /// hold ranges, and took over that pool's allocations
    Resumed,
    /// Pool was already registered with the same spec
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    // Registered, existing node ranges not yet marked taken
    Pending,
    Active,
    Terminating,
}

#[derive(Debug)]
struct PoolEntry {
    pool: Arc<Pool>,
    associations: usize,
    state: PoolState,
}

impl PoolEntry {
    fn pending(pool: Pool) -> Self {
        Self {
            pool: Arc::new(pool),
            associations: 0,
            state: PoolState::Pending,
        }
    }
}

/// Registered pools by name
#[derive(Debug, Default)]
pub struct PoolRegistry {
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl PoolRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the allocators for a ClusterCIDR that is not being deleted.
    ///
    /// A new pool is not selectable until `activate`: ranges nodes already
    /// carry must be marked taken first.
    ///
    /// A terminating entry under the same name belongs to a deleted pool,
    /// since deletion cannot be undone. Unused, it is replaced. Still in
    /// use, it is resumed if the spec is the same.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Validation` if the spec is malformed or a
    /// live pool of that name has a different spec, and
    /// `ControllerError::PoolInUse` if a deleted pool with a different spec
    /// still has nodes.
    pub fn register(&self, cc: &ClusterCIDR) -> Result<Registration, ControllerError> {
        let name = cc.name_any();
        {
            let mut entries = self.lock();
            if let Some(entry) = entries.get_mut(&name) {
                let unchanged = validation::validate_update(entry.pool.spec(), &cc.spec);
                match (entry.state, unchanged) {
                    (PoolState::Pending | PoolState::Active, Ok(())) => return Ok(Registration::Unchanged),
                    (PoolState::Pending | PoolState::Active, Err(errors)) => {
                        return Err(ControllerError::Validation { name, errors });
                    }
                    (PoolState::Terminating, Ok(())) if entry.associations > 0 => {
                        entry.state = PoolState::Active;
                        debug!("Resumed ClusterCIDR {} with {} node(s)", name, entry.associations);
                        return Ok(Registration::Resumed);
                    }
                    (PoolState::Terminating, Err(_)) if entry.associations > 0 => {
                        return Err(ControllerError::PoolInUse {
                            name,
                            associations: entry.associations,
                        });
                    }
                    // Unused leftover, replaced below
                    (PoolState::Terminating, _) => {}
                }
            }
        }

        let pool = Pool::new(name.clone(), cc.spec.clone())?;
        for FamilySet { family, set } in pool.families() {
            debug!(
                "ClusterCIDR {} {} block {}: {} sub-block(s) of /{}",
                name,
                family,
                set.block(),
                set.max_count(),
                set.sub_block_prefix_len()
            );
        }

        let mut entries = self.lock();
        match entries.get(&name) {
            None => {}
            Some(entry) if entry.state == PoolState::Terminating && entry.associations == 0 => {}
            // Lost a race with another registration of the same object
            Some(_) => return Ok(Registration::Unchanged),
        }
        match entries.insert(name.clone(), PoolEntry::pending(pool)) {
            Some(previous) => {
                debug!("Replaced leftover of deleted ClusterCIDR {}", name);
                Ok(Registration::Replaced(previous.pool))
            }
            None => {
                debug!("Registered ClusterCIDR {}", name);
                Ok(Registration::Added)
            }
        }
    }

    /// Makes a pending pool selectable. Returns false if the pool is
    /// unknown or not pending.
    pub fn activate(&self, name: &str) -> bool {
        match self.lock().get_mut(name) {
            Some(entry) if entry.state == PoolState::Pending => {
                entry.state = PoolState::Active;
                true
            }
            _ => false,
        }
    }

    /// Removes a pool no node depends on. Unknown names are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::PoolInUse` while nodes hold ranges from it.
    pub fn unregister(&self, name: &str) -> Result<(), ControllerError> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(name) {
            if entry.associations > 0 {
                return Err(ControllerError::PoolInUse {
                    name: name.to_string(),
                    associations: entry.associations,
                });
            }
            entries.remove(name);
            debug!("Unregistered ClusterCIDR {}", name);
        }
        Ok(())
    }

    /// Excludes a pool from selection. Returns its association count, or
    /// `None` if it is not registered.
    pub fn mark_terminating(&self, name: &str) -> Option<usize> {
        self.lock().get_mut(name).map(|entry| {
            entry.state = PoolState::Terminating;
            entry.associations
        })
    }

    /// Records one more node holding ranges from the pool.
    ///
    /// Used for ranges a node already carries, so pending and terminating
    /// pools count too.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the pool is unknown.
    pub fn increment_association(&self, name: &str) -> Result<usize, ControllerError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(format!("ClusterCIDR {name}")))?;
        entry.associations += 1;
        Ok(entry.associations)
    }

    /// Takes an association ahead of a new allocation.
    ///
    /// Refused unless the pool is active: a pool being deleted cannot pick
    /// up new dependents, and a pending one may still hand out ranges that
    /// nodes already carry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the pool is unknown, `Conflict` if it is
    /// pending or terminating.
    pub fn reserve(&self, name: &str) -> Result<usize, ControllerError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ControllerError::NotFound(format!("ClusterCIDR {name}")))?;
        match entry.state {
            PoolState::Active => {}
            PoolState::Pending => {
                return Err(ControllerError::Conflict(format!("ClusterCIDR {name} is not active yet")));
            }
            PoolState::Terminating => {
                return Err(ControllerError::Conflict(format!("ClusterCIDR {name} is terminating")));
            }
        }
        entry.associations += 1;
        Ok(entry.associations)
    }

    /// Records one node fewer holding ranges from the pool.
    ///
    /// Returns true when the count reached zero on a terminating pool,
    /// i.e. the pool can now be finalized.
    pub fn decrement_association(&self, name: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(name) else {
            warn!("Association released for unknown ClusterCIDR {}", name);
            return false;
        };
        entry.associations = entry.associations.saturating_sub(1);
        entry.associations == 0 && entry.state == PoolState::Terminating
    }

    /// Active pools, sorted by name
    #[must_use]
    pub fn list_eligible(&self) -> Vec<Arc<Pool>> {
        let mut pools: Vec<_> = self
            .lock()
            .values()
            .filter(|entry| entry.state == PoolState::Active)
            .map(|entry| Arc::clone(&entry.pool))
            .collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }

    /// Looks up a pool in any state
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.lock().get(name).map(|entry| Arc::clone(&entry.pool))
    }

    /// The pool whose blocks contain all of `cidrs`, in any state
    #[must_use]
    pub fn find_owner(&self, cidrs: &[IpNet]) -> Option<Arc<Pool>> {
        let entries = self.lock();
        let mut owners: Vec<_> = entries.values().filter(|entry| entry.pool.owns(cidrs)).collect();
        owners.sort_by(|a, b| a.pool.name().cmp(b.pool.name()));
        owners.first().map(|entry| Arc::clone(&entry.pool))
    }

    /// Nodes holding ranges from the pool
    #[must_use]
    pub fn associations(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(|entry| entry.associations)
    }

    /// Names of every registered pool
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Whether deletion of the pool was requested
    #[cfg(test)]
    pub fn is_terminating(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|entry| entry.state == PoolState::Terminating)
    }

    /// Number of registered pools
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no pool is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

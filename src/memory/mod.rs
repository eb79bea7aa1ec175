//! Hybrid memory manager
//!
//! Small requests are served from a fixed slab pool, larger ones from the
//! system heap. Every allocation is tracked in a liveness map; handles reach
//! their bytes through registered slots so the pool can be compacted.
//!
//! # Architecture
//!
//! ```text
//! MemoryManager (one per device, cloned into every collaborator)
//!   ├─→ SlabPool            size ≤ block_size        [■■□■□□□□]
//!   ├─→ SystemAllocator     block_size < size ≤ large_threshold
//!   │                       size > large_threshold → capability-tagged
//!   ├─→ IndirectionRegistry slot → current address (rewritten on compaction)
//!   └─→ LivenessMap         address → in_use        (swept by the collector)
//! ```
//!
//! Allocation never retries more than once: a full pool is compacted a
//! single time and the request either fits afterwards or fails with
//! `PoolExhausted`.

pub mod address;
pub mod collector;
pub mod compactor;
pub mod handle;
pub mod liveness;
pub mod pool;
pub mod registry;
pub mod system;

#[cfg(test)]
mod scenario_tests;

pub use address::{Address, MemoryCapability, RawAllocation, Region};
pub use collector::SweepReport;
pub use compactor::CompactionReport;
pub use handle::Handle;
pub use liveness::{LivenessEntry, LivenessMap, Owner};
pub use pool::{Relocation, SlabPool};
pub use registry::{Indirection, IndirectionRegistry, SlotId};
pub use system::{HostAllocator, SystemAllocator};

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of the manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub pool_capacity: usize,
    pub block_size: usize,
    pub blocks_total: usize,
    pub blocks_in_use: usize,
    pub pool_free_bytes: usize,
    pub heap_capacity: usize,
    pub heap_in_use: usize,
    pub heap_free_bytes: usize,
    /// Registered slots (handles plus external indirections)
    pub live_slots: usize,
    /// Tracked allocations, in use or pending reclaim
    pub tracked_allocations: usize,
    pub pending_reclaim: usize,
    pub pending_reclaim_bytes: usize,
    pub compactions: u64,
    pub sweeps: u64,
}

pub(crate) struct ManagerState {
    config: MemoryConfig,
    pool: SlabPool,
    system: Box<dyn SystemAllocator>,
    registry: IndirectionRegistry,
    liveness: LivenessMap,
    compactions: u64,
    sweeps: u64,
}

impl ManagerState {
    fn route(&self, size: usize) -> Region {
        if size <= self.config.block_size {
            Region::Pool
        } else if size > self.config.large_threshold {
            Region::Capability(self.config.capability)
        } else {
            Region::System
        }
    }

    fn allocate(&mut self, size: usize, owner: Owner) -> Result<RawAllocation> {
        if size == 0 {
            return Err(Error::InvalidArgument("cannot allocate zero bytes".to_string()));
        }

        let region = self.route(size);
        let address = match region {
            Region::Pool => self.allocate_block()?,
            Region::System => self.allocate_system(size, None)?,
            Region::Capability(cap) => self.allocate_system(size, Some(cap))?,
        };

        self.liveness.insert(address, size, region, owner);
        metrics::record_allocation(region);
        self.publish_gauges();

        let allocation = RawAllocation {
            address,
            len: size,
            region,
        };
        debug!(%allocation, "Allocated");
        Ok(allocation)
    }

    /// First-fit from the pool, compacting once if it is full
    fn allocate_block(&mut self) -> Result<Address> {
        if let Some(address) = self.pool.allocate() {
            return Ok(address);
        }

        debug!(blocks = self.pool.block_count(), "Slab pool full, compacting before retry");
        compactor::compact(self);

        match self.pool.allocate() {
            Some(address) => Ok(address),
            None => {
                metrics::record_allocation_failure("pool_exhausted");
                warn!(
                    block_size = self.pool.block_size(),
                    blocks = self.pool.block_count(),
                    "Slab pool exhausted after compaction"
                );
                Err(Error::PoolExhausted {
                    block_size: self.pool.block_size(),
                })
            }
        }
    }

    fn allocate_system(
        &mut self,
        size: usize,
        capability: Option<MemoryCapability>,
    ) -> Result<Address> {
        self.system.allocate(size, capability).ok_or_else(|| {
            metrics::record_allocation_failure("heap_exhausted");
            warn!(size, ?capability, free = self.system.free_bytes(), "System heap exhausted");
            Error::HeapExhausted { size }
        })
    }

    /// Give storage back, dispatching on which range the address falls in
    fn release_storage(&mut self, allocation: RawAllocation) -> Result<()> {
        if self.pool.contains(allocation.address) {
            return self.pool.free(allocation.address);
        }

        let capability = match allocation.region {
            Region::Capability(cap) => Some(cap),
            Region::System => None,
            Region::Pool => {
                return Err(Error::InvalidAddress(format!(
                    "{} is tagged as a pool block but lies outside the pool",
                    allocation.address
                )))
            }
        };
        // SAFETY: the liveness map only holds addresses this allocator
        // produced, with the requested length, and each is released once
        // because its entry was removed before this call.
        unsafe {
            self.system
                .deallocate(allocation.address, allocation.len, capability)
        };
        Ok(())
    }

    fn free(&mut self, allocation: RawAllocation) -> Result<()> {
        let entry = *self.liveness.get(allocation.address).ok_or_else(|| {
            Error::InvalidAddress(format!(
                "{} is not a tracked allocation (double free?)",
                allocation.address
            ))
        })?;

        // Handle-owned storage is only ever freed by the collector
        if entry.owner == Owner::Handle {
            let state = if entry.in_use { "a live" } else { "a released" };
            return Err(Error::InvalidArgument(format!(
                "{} is owned by {} handle",
                allocation.address, state
            )));
        }

        self.liveness.remove(allocation.address);
        self.release_storage(RawAllocation {
            address: allocation.address,
            len: entry.len,
            region: entry.region,
        })?;
        self.publish_gauges();
        debug!(address = %allocation.address, "Freed");
        Ok(())
    }

    /// Live bytes of a tracked allocation
    fn bytes(&self, address: Address) -> Result<&[u8]> {
        let entry = self.live_entry(address)?;
        if entry.region.is_pool() {
            Ok(&self.pool.block_at(address)?[..entry.len])
        } else {
            // SAFETY: a live entry outside the pool is a system allocation of
            // exactly `entry.len` bytes that has not been released.
            Ok(unsafe { std::slice::from_raw_parts(address.as_usize() as *const u8, entry.len) })
        }
    }

    fn bytes_mut(&mut self, address: Address) -> Result<&mut [u8]> {
        let entry = *self.live_entry(address)?;
        if entry.region.is_pool() {
            Ok(&mut self.pool.block_at_mut(address)?[..entry.len])
        } else {
            // SAFETY: as in `bytes`; the state lock gives exclusive access.
            Ok(unsafe {
                std::slice::from_raw_parts_mut(address.as_usize() as *mut u8, entry.len)
            })
        }
    }

    fn live_entry(&self, address: Address) -> Result<&LivenessEntry> {
        match self.liveness.get(address) {
            Some(entry) if entry.in_use => Ok(entry),
            Some(_) => Err(Error::InvalidAddress(format!(
                "{} has been released and awaits collection",
                address
            ))),
            None => Err(Error::InvalidAddress(format!(
                "{} is not a tracked allocation",
                address
            ))),
        }
    }

    fn slot_address(&self, slot: SlotId) -> Result<Address> {
        self.registry
            .get(slot)
            .ok_or_else(|| Error::InvalidAddress(format!("{} is not registered", slot)))
    }

    fn stats(&self) -> MemoryStats {
        MemoryStats {
            pool_capacity: self.pool.capacity(),
            block_size: self.pool.block_size(),
            blocks_total: self.pool.block_count(),
            blocks_in_use: self.pool.blocks_in_use(),
            pool_free_bytes: self.pool.free_blocks() * self.pool.block_size(),
            heap_capacity: self.system.capacity(),
            heap_in_use: self.system.bytes_in_use(),
            heap_free_bytes: self.system.free_bytes(),
            live_slots: self.registry.len(),
            tracked_allocations: self.liveness.len(),
            pending_reclaim: self.liveness.pending_count(),
            pending_reclaim_bytes: self.liveness.pending_bytes(),
            compactions: self.compactions,
            sweeps: self.sweeps,
        }
    }

    fn publish_gauges(&self) {
        metrics::update_memory_gauges(
            self.pool.blocks_in_use(),
            self.system.bytes_in_use(),
            self.liveness.pending_count(),
        );
    }
}

impl Drop for ManagerState {
    fn drop(&mut self) {
        let outstanding: Vec<_> = self.liveness.drain().collect();
        for (address, entry) in outstanding {
            if !entry.region.is_pool() {
                let allocation = RawAllocation {
                    address,
                    len: entry.len,
                    region: entry.region,
                };
                if let Err(e) = self.release_storage(allocation) {
                    warn!(%allocation, error = %e, "Failed to release allocation at shutdown");
                }
            }
        }
    }
}

fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

/// Memory manager context
///
/// Cheap to clone; all clones share one pool, heap, registry and liveness
/// map. Operations are serialized by a single lock that is never held across
/// an await point.
#[derive(Clone)]
pub struct MemoryManager {
    state: Arc<Mutex<ManagerState>>,
}

impl MemoryManager {
    /// Create a manager backed by the host allocator
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let system = HostAllocator::new(config.heap_capacity, config.alignment);
        Self::with_allocator(config, Box::new(system))
    }

    /// Create a manager with a custom system allocator
    pub fn with_allocator(config: MemoryConfig, system: Box<dyn SystemAllocator>) -> Result<Self> {
        config.validate()?;
        let pool = SlabPool::new(config.pool_capacity, config.block_size)?;

        info!(
            pool_capacity = config.pool_capacity,
            block_size = config.block_size,
            blocks = pool.block_count(),
            large_threshold = config.large_threshold,
            heap_capacity = system.capacity(),
            capability = %config.capability,
            "Initializing memory manager"
        );

        Ok(Self {
            state: Arc::new(Mutex::new(ManagerState {
                config,
                pool,
                system,
                registry: IndirectionRegistry::new(),
                liveness: LivenessMap::new(),
                compactions: 0,
                sweeps: 0,
            })),
        })
    }

    /// Where a request of `size` bytes would be served from
    pub fn route(&self, size: usize) -> Region {
        self.state.lock().route(size)
    }

    /// Allocate `size` bytes. The caller owns the result and must `free` it.
    pub fn allocate(&self, size: usize) -> Result<RawAllocation> {
        self.state.lock().allocate(size, Owner::Raw)
    }

    /// Free a raw allocation, dispatching on its address range
    pub fn free(&self, allocation: RawAllocation) -> Result<()> {
        self.state.lock().free(allocation)
    }

    /// Allocate `size` bytes behind a reference-counted, compaction-safe handle
    pub fn allocate_handle(&self, size: usize) -> Result<Handle> {
        let (slot, allocation) = {
            let mut state = self.state.lock();
            let allocation = state.allocate(size, Owner::Handle)?;
            let slot = state.registry.register(allocation.address);
            (slot, allocation)
        };
        Ok(Handle::new(self.clone(), slot, allocation.len, allocation.region))
    }

    /// Register a long-lived holder of `address` so compaction can update it
    pub fn register_indirection(&self, address: Address) -> Result<Indirection> {
        let slot = {
            let mut state = self.state.lock();
            if state.liveness.get(address).is_none() {
                return Err(Error::InvalidAddress(format!(
                    "{} is not a tracked allocation",
                    address
                )));
            }
            state.registry.register(address)
        };
        Ok(Indirection::new(self.clone(), slot))
    }

    /// Free every allocation whose liveness flag is clear. Called by the
    /// scheduler on its collection period.
    pub fn run_collector_sweep(&self) -> SweepReport {
        let mut state = self.state.lock();
        let report = collector::sweep(&mut state);
        state.publish_gauges();
        report
    }

    /// Compact the slab pool. `allocate` runs this on its own when the pool
    /// is full; callers normally never need to.
    pub fn run_compaction(&self) -> CompactionReport {
        compactor::compact(&mut self.state.lock())
    }

    /// Bounds-checked read from a raw allocation
    pub fn read_raw(&self, address: Address, offset: usize, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let bytes = state.bytes(address)?;
        check_bounds(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    /// Bounds-checked write into a raw allocation
    pub fn write_raw(&self, address: Address, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let bytes = state.bytes_mut(address)?;
        check_bounds(offset, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Bytes that could be served right now for a request of `size`
    pub fn available_for(&self, size: usize) -> usize {
        let state = self.state.lock();
        match state.route(size) {
            Region::Pool => state.pool.free_blocks() * state.pool.block_size(),
            Region::System | Region::Capability(_) => state.system.free_bytes(),
        }
    }

    /// Fail with `InsufficientMemory` unless `size` bytes can be served
    pub fn ensure_available(&self, size: usize) -> Result<()> {
        let available = self.available_for(size);
        if size > available {
            return Err(Error::InsufficientMemory {
                required: size,
                available,
            });
        }
        Ok(())
    }

    /// Liveness flag of a tracked address (false if untracked)
    pub fn is_in_use(&self, address: Address) -> bool {
        self.state
            .lock()
            .liveness
            .get(address)
            .map(|e| e.in_use)
            .unwrap_or(false)
    }

    /// Whether the liveness map tracks `address` at all
    pub fn is_tracked(&self, address: Address) -> bool {
        self.state.lock().liveness.get(address).is_some()
    }

    pub fn pool_base(&self) -> Address {
        self.state.lock().pool.base()
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats()
    }

    pub fn config(&self) -> MemoryConfig {
        self.state.lock().config.clone()
    }

    pub(crate) fn slot_address(&self, slot: SlotId) -> Option<Address> {
        self.state.lock().registry.get(slot)
    }

    /// Pin the block behind `slot` so compaction never moves it
    pub(crate) fn pin_slot(&self, slot: SlotId) -> Result<Address> {
        let mut state = self.state.lock();
        let address = state.slot_address(slot)?;
        if state.pool.contains(address) {
            state.pool.pin(address)?;
        }
        debug!(%slot, %address, "Pinned allocation");
        Ok(address)
    }

    pub(crate) fn deregister_slot(&self, slot: SlotId) {
        self.state.lock().registry.deregister(slot);
    }

    /// Last reference gone: clear the flag, leave the freeing to the collector
    pub(crate) fn release_handle(&self, slot: SlotId) {
        let mut state = self.state.lock();
        match state.registry.deregister(slot) {
            Some(address) => {
                state.liveness.mark_released(address);
                state.publish_gauges();
                debug!(%slot, %address, "Handle released, pending collection");
            }
            None => warn!(%slot, "Released handle had no registered slot"),
        }
    }

    pub(crate) fn read_slot(&self, slot: SlotId, offset: usize, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let bytes = state.bytes(state.slot_address(slot)?)?;
        check_bounds(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    pub(crate) fn write_slot(&self, slot: SlotId, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let address = state.slot_address(slot)?;
        let bytes = state.bytes_mut(address)?;
        check_bounds(offset, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("stats", &self.stats())
            .finish()
    }
}

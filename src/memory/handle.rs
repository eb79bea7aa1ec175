//! Reference-counted allocation handle
//!
//! Cloning a `Handle` shares the allocation; dropping the last clone clears
//! its liveness flag and deregisters its slot. Bytes are reached through the
//! slot, so a handle keeps working after compaction moves its block.

use super::address::{Address, Region};
use super::registry::SlotId;
use super::MemoryManager;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    manager: MemoryManager,
    slot: SlotId,
    len: usize,
    region: Region,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.manager.release_handle(self.slot);
    }
}

impl Handle {
    pub(crate) fn new(manager: MemoryManager, slot: SlotId, len: usize, region: Region) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                manager,
                slot,
                len,
                region,
            }),
        }
    }

    /// Current address of the allocation
    pub fn address(&self) -> Result<Address> {
        self.inner
            .manager
            .slot_address(self.inner.slot)
            .ok_or_else(|| Error::InvalidAddress(format!("{} is not registered", self.inner.slot)))
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn region(&self) -> Region {
        self.inner.region
    }

    pub fn slot(&self) -> SlotId {
        self.inner.slot
    }

    /// Number of live clones sharing this allocation
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn read_byte(&self, index: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read(index, &mut byte)?;
        Ok(byte[0])
    }

    pub fn write_byte(&self, index: usize, value: u8) -> Result<()> {
        self.write(index, &[value])
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the allocation
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.manager.read_slot(self.inner.slot, offset, buf)
    }

    /// Copy `data` into the allocation starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.inner.manager.write_slot(self.inner.slot, offset, data)
    }

    pub fn fill(&self, value: u8) -> Result<()> {
        self.write(0, &vec![value; self.len()])
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.len()];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Drop this reference explicitly
    pub fn release(self) {}

    /// Give up the allocation for the rest of uptime: the reference count
    /// never reaches zero, so the collector never frees it, and its block is
    /// pinned so compaction never moves it.
    pub(crate) fn leak(self) -> Result<Address> {
        let address = self.inner.manager.pin_slot(self.inner.slot)?;
        std::mem::forget(self);
        Ok(address)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("slot", &self.inner.slot)
            .field("address", &self.inner.manager.slot_address(self.inner.slot))
            .field("len", &self.inner.len)
            .field("region", &self.inner.region)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MemoryConfig;
    use crate::error::Error;
    use crate::memory::{MemoryManager, Region};

    fn manager() -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            pool_capacity: 1024,
            ..MemoryConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_clone_shares_count() {
        let mm = manager();
        let h1 = mm.allocate_handle(64).unwrap();
        assert_eq!(h1.ref_count(), 1);

        let h2 = h1.clone();
        assert_eq!(h1.ref_count(), 2);
        assert_eq!(h1.address().unwrap(), h2.address().unwrap());

        drop(h2);
        assert_eq!(h1.ref_count(), 1);
    }

    #[test]
    fn test_bounds_checked_access() {
        let mm = manager();
        let handle = mm.allocate_handle(10).unwrap();

        handle.write(0, b"0123456789").unwrap();
        assert_eq!(handle.read_byte(9).unwrap(), b'9');

        // Block is 64 bytes but the handle only owns 10
        assert!(matches!(
            handle.read_byte(10),
            Err(Error::OutOfBounds { offset: 10, len: 1, capacity: 10 })
        ));
        assert!(matches!(
            handle.write(8, b"xyz"),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            handle.write(usize::MAX, b"x"),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_fill_and_to_vec_on_system_region() {
        let mm = manager();
        let handle = mm.allocate_handle(100).unwrap();
        assert_eq!(handle.region(), Region::System);

        handle.fill(0x5A).unwrap();
        assert_eq!(handle.to_vec().unwrap(), vec![0x5A; 100]);
    }

    #[test]
    fn test_assignment_releases_previous_allocation() {
        let mm = manager();
        let a = mm.allocate_handle(32).unwrap();
        let mut b = mm.allocate_handle(32).unwrap();
        let old = b.address().unwrap();

        b = a.clone();
        assert_eq!(b.address().unwrap(), a.address().unwrap());
        assert_eq!(a.ref_count(), 2);
        assert!(!mm.is_in_use(old));
    }

    #[test]
    fn test_leaked_pool_block_stays_put() {
        let mm = manager();
        let gap = mm.allocate_handle(64).unwrap();
        let payload = mm.allocate_handle(48).unwrap();
        payload.fill(0xC3).unwrap();
        let entry = payload.leak().unwrap();

        drop(gap);
        mm.run_collector_sweep();
        let report = mm.run_compaction();

        assert_eq!(report.moved, 0);
        assert!(mm.is_in_use(entry));
        let mut buf = [0u8; 48];
        mm.read_raw(entry, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xC3; 48]);

        // The freed gap in front of it is still usable
        let next = mm.allocate(16).unwrap();
        assert_eq!(next.address, mm.pool_base());
    }
}

//! Fallback path to the system allocator
//!
//! Requests that do not fit a slab block are delegated here, either to the
//! plain heap or to a capability-tagged heap (e.g. DMA-capable memory).
//! The allocator does not remember sizes: callers pass them back on free.

use super::address::{Address, MemoryCapability};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use tracing::{debug, warn};

/// System allocator seam
pub trait SystemAllocator: Send {
    /// Allocate `size` zeroed bytes, optionally from a capability-tagged region
    fn allocate(&mut self, size: usize, capability: Option<MemoryCapability>) -> Option<Address>;

    /// Release an allocation
    ///
    /// # Safety
    /// `address` must come from `allocate` on this allocator with the same
    /// `size` and `capability`, and must not have been released already.
    unsafe fn deallocate(
        &mut self,
        address: Address,
        size: usize,
        capability: Option<MemoryCapability>,
    );

    /// Total bytes this allocator may hand out
    fn capacity(&self) -> usize;

    /// Bytes currently handed out
    fn bytes_in_use(&self) -> usize;

    fn free_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.bytes_in_use())
    }
}

/// Host implementation over `std::alloc`, limited to a fixed byte budget
/// so heap exhaustion behaves like it does on the device.
#[derive(Debug)]
pub struct HostAllocator {
    capacity: usize,
    alignment: usize,
    in_use: usize,
    by_capability: HashMap<MemoryCapability, usize>,
}

impl HostAllocator {
    pub fn new(capacity: usize, alignment: usize) -> Self {
        Self {
            capacity,
            alignment: alignment.max(1),
            in_use: 0,
            by_capability: HashMap::new(),
        }
    }

    /// Bytes currently handed out from a capability-tagged region
    pub fn capability_bytes(&self, capability: MemoryCapability) -> usize {
        self.by_capability.get(&capability).copied().unwrap_or(0)
    }

    fn layout(&self, size: usize) -> Option<Layout> {
        Layout::from_size_align(size, self.alignment).ok()
    }
}

impl SystemAllocator for HostAllocator {
    fn allocate(&mut self, size: usize, capability: Option<MemoryCapability>) -> Option<Address> {
        if size == 0 || size > self.free_bytes() {
            debug!(size, free = self.free_bytes(), "System heap budget exceeded");
            return None;
        }
        let layout = self.layout(size)?;

        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            warn!(size, "Host allocator returned null");
            return None;
        }

        self.in_use += size;
        if let Some(cap) = capability {
            *self.by_capability.entry(cap).or_insert(0) += size;
        }
        Some(Address(ptr as usize))
    }

    unsafe fn deallocate(
        &mut self,
        address: Address,
        size: usize,
        capability: Option<MemoryCapability>,
    ) {
        let Some(layout) = self.layout(size) else {
            return;
        };
        alloc::dealloc(address.as_usize() as *mut u8, layout);

        self.in_use = self.in_use.saturating_sub(size);
        if let Some(cap) = capability {
            if let Some(bytes) = self.by_capability.get_mut(&cap) {
                *bytes = bytes.saturating_sub(size);
            }
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_enforced() {
        let mut heap = HostAllocator::new(1024, 8);

        let a = heap.allocate(600, None).unwrap();
        assert_eq!(heap.bytes_in_use(), 600);
        assert!(heap.allocate(600, None).is_none());

        unsafe { heap.deallocate(a, 600, None) };
        assert_eq!(heap.free_bytes(), 1024);
        let b = heap.allocate(600, None).unwrap();
        unsafe { heap.deallocate(b, 600, None) };
    }

    #[test]
    fn test_capability_accounting() {
        let mut heap = HostAllocator::new(4096, 8);

        let a = heap.allocate(256, Some(MemoryCapability::Dma)).unwrap();
        let b = heap.allocate(128, None).unwrap();
        assert_eq!(heap.capability_bytes(MemoryCapability::Dma), 256);
        assert_eq!(heap.capability_bytes(MemoryCapability::External), 0);
        assert_eq!(heap.bytes_in_use(), 384);

        unsafe {
            heap.deallocate(a, 256, Some(MemoryCapability::Dma));
            heap.deallocate(b, 128, None);
        }
        assert_eq!(heap.capability_bytes(MemoryCapability::Dma), 0);
        assert_eq!(heap.bytes_in_use(), 0);
    }

    #[test]
    fn test_allocations_are_aligned_and_zeroed() {
        let mut heap = HostAllocator::new(4096, 16);
        let a = heap.allocate(100, None).unwrap();
        assert_eq!(a.as_usize() % 16, 0);

        let bytes = unsafe { std::slice::from_raw_parts(a.as_usize() as *const u8, 100) };
        assert!(bytes.iter().all(|&b| b == 0));

        unsafe { heap.deallocate(a, 100, None) };
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut heap = HostAllocator::new(4096, 8);
        assert!(heap.allocate(0, None).is_none());
    }
}

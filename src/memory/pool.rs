//! Fixed-capacity slab pool
//!
//! One contiguous byte region split into equal blocks, with a parallel
//! bitmap of allocated/free state. Allocation is first-fit from the left.

use super::address::Address;
use crate::error::{Error, Result};
use tracing::debug;

/// A block that moved during compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from: Address,
    pub to: Address,
}

/// Slab pool of `block_count` blocks of `block_size` bytes
#[derive(Debug)]
pub struct SlabPool {
    /// Backing bytes; never reallocated, so block addresses are stable
    storage: Box<[u8]>,
    block_size: usize,
    /// Allocated flag per block
    allocated: Vec<bool>,
    /// Blocks compaction must not move
    pinned: Vec<bool>,
    /// Number of blocks marked allocated
    in_use: usize,
    /// Every block below this index is allocated
    lowest_free: usize,
}

impl SlabPool {
    /// Create a pool; `capacity` must be a non-zero multiple of `block_size`
    pub fn new(capacity: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 || capacity == 0 || capacity % block_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "pool capacity {} is not a non-zero multiple of block size {}",
                capacity, block_size
            )));
        }

        let block_count = capacity / block_size;
        Ok(Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            block_size,
            allocated: vec![false; block_count],
            pinned: vec![false; block_count],
            in_use: 0,
            lowest_free: 0,
        })
    }

    /// Address of block 0
    pub fn base(&self) -> Address {
        Address(self.storage.as_ptr() as usize)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn blocks_in_use(&self) -> usize {
        self.in_use
    }

    pub fn free_blocks(&self) -> usize {
        self.block_count() - self.in_use
    }

    /// Whether `address` falls inside the pool's byte range
    pub fn contains(&self, address: Address) -> bool {
        let base = self.base().as_usize();
        let addr = address.as_usize();
        addr >= base && addr < base + self.capacity()
    }

    pub fn address_of(&self, index: usize) -> Address {
        self.base().offset(index * self.block_size)
    }

    /// Block index for a block-aligned address inside the pool
    pub fn index_of(&self, address: Address) -> Result<usize> {
        if !self.contains(address) {
            return Err(Error::InvalidAddress(format!("{} is outside the slab pool", address)));
        }
        let offset = address.as_usize() - self.base().as_usize();
        if offset % self.block_size != 0 {
            return Err(Error::InvalidAddress(format!(
                "{} is not aligned to a {}-byte block",
                address, self.block_size
            )));
        }
        Ok(offset / self.block_size)
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.allocated.get(index).copied().unwrap_or(false)
    }

    pub fn is_pinned(&self, index: usize) -> bool {
        self.pinned.get(index).copied().unwrap_or(false)
    }

    /// Keep an allocated block at its address for as long as it stays allocated
    pub fn pin(&mut self, address: Address) -> Result<()> {
        let index = self.index_of(address)?;
        if !self.allocated[index] {
            return Err(Error::InvalidAddress(format!(
                "cannot pin free slab block {} at {}",
                index, address
            )));
        }
        self.pinned[index] = true;
        debug!(index, %address, "Pinned slab block");
        Ok(())
    }

    /// Take the first free block, zeroed. `None` when every block is in use.
    pub fn allocate(&mut self) -> Option<Address> {
        let index = (self.lowest_free..self.block_count()).find(|&i| !self.allocated[i])?;

        self.allocated[index] = true;
        self.in_use += 1;
        self.lowest_free = index + 1;
        self.block_mut(index).fill(0);

        let address = self.address_of(index);
        debug!(index, %address, "Allocated slab block");
        Some(address)
    }

    /// Return a block to the pool
    pub fn free(&mut self, address: Address) -> Result<()> {
        let index = self.index_of(address)?;
        if !self.allocated[index] {
            return Err(Error::InvalidAddress(format!(
                "double free of slab block {} at {}",
                index, address
            )));
        }

        self.allocated[index] = false;
        self.pinned[index] = false;
        self.in_use -= 1;
        // Next scan starts at the lowest hole
        self.lowest_free = self.lowest_free.min(index);

        debug!(index, %address, "Freed slab block");
        Ok(())
    }

    /// Bytes of the block containing `address`
    pub fn block_at(&self, address: Address) -> Result<&[u8]> {
        let index = self.index_of(address)?;
        Ok(self.block(index))
    }

    /// Mutable bytes of the block containing `address`
    pub fn block_at_mut(&mut self, address: Address) -> Result<&mut [u8]> {
        let index = self.index_of(address)?;
        Ok(self.block_mut(index))
    }

    fn block(&self, index: usize) -> &[u8] {
        let start = index * self.block_size;
        &self.storage[start..start + self.block_size]
    }

    fn block_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.block_size;
        &mut self.storage[start..start + self.block_size]
    }

    /// Slide every unpinned allocated block toward index 0, preserving order.
    ///
    /// Single pass with a write cursor: each movable block is copied down
    /// into the lowest free block before it. Pinned blocks stay where they
    /// are and the cursor steps over them. Returns the moves in the order
    /// they happened.
    pub fn compact(&mut self) -> Vec<Relocation> {
        let mut cursor = 0;
        let mut moved = Vec::new();

        for index in 0..self.block_count() {
            if !self.allocated[index] || self.pinned[index] {
                continue;
            }
            while cursor < index && self.allocated[cursor] {
                cursor += 1;
            }
            if cursor < index {
                let src = index * self.block_size;
                self.storage
                    .copy_within(src..src + self.block_size, cursor * self.block_size);
                self.allocated[index] = false;
                self.allocated[cursor] = true;
                moved.push(Relocation {
                    from: self.address_of(index),
                    to: self.address_of(cursor),
                });
            }
        }

        self.lowest_free = self
            .allocated
            .iter()
            .position(|&allocated| !allocated)
            .unwrap_or(self.block_count());
        moved
    }
}

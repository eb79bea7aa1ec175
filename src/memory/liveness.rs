//! Liveness map: allocation address → in-use flag
//!
//! Every allocation has an entry from the moment it is handed out until it
//! is freed. The flag is cleared only when a handle's last reference goes
//! away; the collector frees entries whose flag is clear.

use super::address::{Address, Region};
use super::pool::Relocation;
use std::collections::HashMap;

/// Who is responsible for an allocation's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Raw caller of `allocate`; freed explicitly
    Raw,
    /// A reference-counted handle; freed by the collector
    Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessEntry {
    pub in_use: bool,
    /// Requested length in bytes
    pub len: usize,
    pub region: Region,
    pub owner: Owner,
}

#[derive(Debug, Default)]
pub struct LivenessMap {
    entries: HashMap<Address, LivenessEntry>,
}

impl LivenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh allocation as in use
    pub fn insert(&mut self, address: Address, len: usize, region: Region, owner: Owner) {
        self.entries.insert(
            address,
            LivenessEntry {
                in_use: true,
                len,
                region,
                owner,
            },
        );
    }

    pub fn get(&self, address: Address) -> Option<&LivenessEntry> {
        self.entries.get(&address)
    }

    /// Clear the in-use flag. Returns false if the address is unknown.
    pub fn mark_released(&mut self, address: Address) -> bool {
        match self.entries.get_mut(&address) {
            Some(entry) => {
                entry.in_use = false;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: Address) -> Option<LivenessEntry> {
        self.entries.remove(&address)
    }

    /// Follow blocks moved by compaction, in move order
    pub fn apply_relocations(&mut self, relocations: &[Relocation]) {
        for relocation in relocations {
            if let Some(entry) = self.entries.remove(&relocation.from) {
                self.entries.insert(relocation.to, entry);
            }
        }
    }

    /// Entries whose flag is clear
    pub fn reclaimable(&self) -> Vec<(Address, LivenessEntry)> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.in_use)
            .map(|(&address, &entry)| (address, entry))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.in_use).count()
    }

    pub fn pending_bytes(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !e.in_use)
            .map(|e| e.len)
            .sum()
    }

    /// Remove every entry, e.g. when the manager shuts down
    pub fn drain(&mut self) -> impl Iterator<Item = (Address, LivenessEntry)> + '_ {
        self.entries.drain()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

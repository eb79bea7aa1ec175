//! Indirection registry
//!
//! Holds non-owning back-references ("slots") to the current address of an
//! allocation. The compactor rewrites slots when it moves a block; nothing
//! here keeps an allocation alive.

use super::address::Address;
use super::pool::Relocation;
use super::MemoryManager;
use std::collections::HashMap;
use std::fmt;

/// Identifier of one registered slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

#[derive(Debug, Default)]
pub struct IndirectionRegistry {
    slots: HashMap<SlotId, Address>,
    next_id: u64,
}

impl IndirectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: Address) -> SlotId {
        let slot = SlotId(self.next_id);
        self.next_id += 1;
        self.slots.insert(slot, address);
        slot
    }

    /// Drop a slot, returning the address it last held
    pub fn deregister(&mut self, slot: SlotId) -> Option<Address> {
        self.slots.remove(&slot)
    }

    pub fn get(&self, slot: SlotId) -> Option<Address> {
        self.slots.get(&slot).copied()
    }

    /// Point every slot holding a moved address at its new home.
    /// Returns how many slots were rewritten.
    pub fn apply_relocations(&mut self, relocations: &[Relocation]) -> usize {
        if relocations.is_empty() {
            return 0;
        }
        let moves: HashMap<Address, Address> =
            relocations.iter().map(|r| (r.from, r.to)).collect();

        let mut rewritten = 0;
        for address in self.slots.values_mut() {
            if let Some(&to) = moves.get(address) {
                *address = to;
                rewritten += 1;
            }
        }
        rewritten
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Registration of a long-lived raw address that must survive compaction.
///
/// Dropping the guard deregisters the slot, so a registration can never
/// outlive its holder.
pub struct Indirection {
    manager: MemoryManager,
    slot: SlotId,
}

impl Indirection {
    pub(crate) fn new(manager: MemoryManager, slot: SlotId) -> Self {
        Self { manager, slot }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Current address of the registered allocation
    pub fn address(&self) -> Option<Address> {
        self.manager.slot_address(self.slot)
    }

    /// Deregister explicitly; same as dropping the guard
    pub fn deregister(self) {}
}

impl Drop for Indirection {
    fn drop(&mut self) {
        self.manager.deregister_slot(self.slot);
    }
}

impl fmt::Debug for Indirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indirection")
            .field("slot", &self.slot)
            .field("address", &self.address())
            .finish()
    }
}

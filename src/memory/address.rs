//! Addresses, regions and raw allocation records

use serde::{Deserialize, Serialize};
use std::fmt;

/// A machine address handed out by the memory manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub usize);

impl Address {
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Address `bytes` past this one
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Capability tag for region-constrained system allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCapability {
    /// DMA-capable memory
    Dma,
    /// Internal SRAM
    Internal,
    /// External PSRAM
    External,
}

impl fmt::Display for MemoryCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryCapability::Dma => "dma",
            MemoryCapability::Internal => "internal",
            MemoryCapability::External => "external",
        };
        f.write_str(name)
    }
}

/// Where an allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    /// One slab block
    Pool,
    /// Plain system heap
    System,
    /// Capability-tagged system heap
    Capability(MemoryCapability),
}

impl Region {
    pub fn is_pool(&self) -> bool {
        matches!(self, Region::Pool)
    }

    /// Label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Region::Pool => "pool",
            Region::System => "system",
            Region::Capability(_) => "capability",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Capability(cap) => write!(f, "capability({})", cap),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of a raw `allocate`; the caller keeps it to free later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawAllocation {
    pub address: Address,
    /// Requested length in bytes
    pub len: usize,
    pub region: Region,
}

impl fmt::Display for RawAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Allocation({} @ {}, {} bytes)", self.region, self.address, self.len)
    }
}

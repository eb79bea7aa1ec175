//! Deterministic allocation workload
//!
//! Drives allocate, release, sweep and compaction rounds across all three
//! routing tiers so pool behavior can be inspected from the CLI. Raw pool
//! blocks are held through an `Indirection` because every round compacts.

use crate::error::{Error, Result};
use crate::memory::{Handle, Indirection, MemoryManager, MemoryStats, RawAllocation};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of a workload run
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub rounds: usize,
    /// Allocations refused during the run
    pub failures: usize,
    /// Snapshot after the last round, before teardown
    pub stats: MemoryStats,
    /// Snapshot after everything was released and swept
    pub remaining: MemoryStats,
}

/// Raw allocation plus the registered slot that follows it through compaction
struct RawBlock {
    allocation: RawAllocation,
    indirection: Indirection,
    marker: u8,
}

impl RawBlock {
    fn free(self, manager: &MemoryManager) -> Result<()> {
        let address = self.indirection.address().ok_or_else(|| {
            Error::InvalidAddress(format!("{} lost its slot", self.indirection.slot()))
        })?;

        let mut first = [0u8; 1];
        manager.read_raw(address, 0, &mut first)?;
        if first[0] != self.marker {
            return Err(Error::InvalidAddress(format!(
                "raw block at {} holds {:#04x}, expected {:#04x}",
                address, first[0], self.marker
            )));
        }

        self.indirection.deregister();
        manager.free(RawAllocation {
            address,
            ..self.allocation
        })
    }
}

/// Run `rounds` rounds against `manager`, then release everything
pub fn run_workload(manager: &MemoryManager, rounds: usize) -> Result<WorkloadReport> {
    let config = manager.config();
    let block_size = config.block_size;
    let sizes = [
        (block_size / 2).max(1),
        block_size,
        block_size + 1,
        config.large_threshold + 1,
    ];

    let mut handles: Vec<Handle> = Vec::new();
    let mut raw: Vec<RawBlock> = Vec::new();
    let mut failures = 0usize;

    for round in 0..rounds {
        for (i, size) in sizes.iter().copied().enumerate() {
            match manager.allocate_handle(size) {
                Ok(handle) => {
                    handle.fill((round + i) as u8)?;
                    handles.push(handle);
                }
                Err(e) => {
                    failures += 1;
                    warn!(round, size, error = %e, "Simulated allocation failed");
                }
            }
        }

        match manager.allocate(block_size) {
            Ok(allocation) => {
                let marker = round as u8;
                manager.write_raw(allocation.address, 0, &[marker])?;
                let indirection = manager.register_indirection(allocation.address)?;
                raw.push(RawBlock {
                    allocation,
                    indirection,
                    marker,
                });
            }
            Err(e) => {
                failures += 1;
                debug!(round, error = %e, "Simulated raw allocation failed");
            }
        }

        // Release every other handle and the oldest raw block
        let mut index = 0;
        handles.retain(|_| {
            index += 1;
            index % 2 == 0
        });
        if round % 2 == 1 && !raw.is_empty() {
            raw.remove(0).free(manager)?;
        }

        let sweep = manager.run_collector_sweep();
        let compaction = manager.run_compaction();
        info!(
            round,
            freed = sweep.freed,
            moved = compaction.moved,
            live = handles.len() + raw.len(),
            "Simulation round"
        );
    }

    let stats = manager.stats();

    drop(handles);
    for block in raw {
        block.free(manager)?;
    }
    manager.run_collector_sweep();

    Ok(WorkloadReport {
        rounds,
        failures,
        stats,
        remaining: manager.stats(),
    })
}

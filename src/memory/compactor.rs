//! Pool compaction
//!
//! Runs when the slab pool is full, or on request. Live blocks slide toward the front
//! in one stable pass; every registered slot and liveness entry that named a
//! moved block is rewritten in the same pass. System allocations never move.

use super::ManagerState;
use crate::metrics;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Blocks copied to a lower index
    pub moved: usize,
    /// Registered slots rewritten
    pub slots_rewritten: usize,
    /// Allocated blocks after the pass (all at indices `0..live_blocks`)
    pub live_blocks: usize,
}

pub(super) fn compact(state: &mut ManagerState) -> CompactionReport {
    let relocations = state.pool.compact();
    let slots_rewritten = state.registry.apply_relocations(&relocations);
    state.liveness.apply_relocations(&relocations);
    state.compactions += 1;

    let report = CompactionReport {
        moved: relocations.len(),
        slots_rewritten,
        live_blocks: state.pool.blocks_in_use(),
    };

    metrics::record_compaction(report.moved);
    info!(
        moved = report.moved,
        slots_rewritten = report.slots_rewritten,
        live_blocks = report.live_blocks,
        "Compacted slab pool"
    );
    report
}

//! Deferred collector
//!
//! A handle whose last reference is dropped only clears its liveness flag.
//! The sweep, run on the scheduler's period, frees every entry with a clear
//! flag and leaves everything else alone. It never looks at reference
//! counts, so an allocation is held for at most one period after death.

use super::address::RawAllocation;
use super::ManagerState;
use crate::metrics;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Allocations freed by this sweep
    pub freed: usize,
    pub freed_bytes: usize,
    /// Entries still marked in use
    pub retained: usize,
}

pub(super) fn sweep(state: &mut ManagerState) -> SweepReport {
    let mut report = SweepReport::default();

    for (address, entry) in state.liveness.reclaimable() {
        state.liveness.remove(address);
        let allocation = RawAllocation {
            address,
            len: entry.len,
            region: entry.region,
        };
        match state.release_storage(allocation) {
            Ok(()) => {
                report.freed += 1;
                report.freed_bytes += entry.len;
            }
            Err(e) => warn!(%allocation, error = %e, "Collector failed to free allocation"),
        }
    }

    report.retained = state.liveness.len();
    state.sweeps += 1;

    metrics::record_sweep(report.freed);
    debug!(
        freed = report.freed,
        freed_bytes = report.freed_bytes,
        retained = report.retained,
        "Collector sweep complete"
    );
    report
}

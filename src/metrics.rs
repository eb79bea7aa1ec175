//! Prometheus metrics for the memory manager and loader
//!
//! Features:
//! - Allocation metrics (by region, failures by reason)
//! - Compaction and collection metrics
//! - Occupancy gauges (pool blocks, heap bytes, pending reclaim)
//! - Payload staging metrics

use crate::memory::Region;
use prometheus::{
    core::{AtomicU64, GenericCounter, GenericGauge},
    Encoder, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Allocation metrics
    pub static ref ALLOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("firmheap_allocations_total", "Allocations served"),
        &["region"]
    ).unwrap();

    pub static ref ALLOCATION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("firmheap_allocation_failures_total", "Allocations that failed"),
        &["reason"]
    ).unwrap();

    // Compaction / collection metrics
    pub static ref COMPACTIONS_TOTAL: GenericCounter<AtomicU64> = GenericCounter::new(
        "firmheap_compactions_total",
        "Slab pool compaction passes"
    ).unwrap();

    pub static ref BLOCKS_MOVED_TOTAL: GenericCounter<AtomicU64> = GenericCounter::new(
        "firmheap_blocks_moved_total",
        "Slab blocks relocated by compaction"
    ).unwrap();

    pub static ref SWEEPS_TOTAL: GenericCounter<AtomicU64> = GenericCounter::new(
        "firmheap_collector_sweeps_total",
        "Collector sweeps run"
    ).unwrap();

    pub static ref RECLAIMED_TOTAL: GenericCounter<AtomicU64> = GenericCounter::new(
        "firmheap_reclaimed_allocations_total",
        "Allocations freed by the collector"
    ).unwrap();

    // Occupancy
    pub static ref POOL_BLOCKS_IN_USE: GenericGauge<AtomicU64> = GenericGauge::new(
        "firmheap_pool_blocks_in_use",
        "Slab blocks currently allocated"
    ).unwrap();

    pub static ref HEAP_BYTES_IN_USE: GenericGauge<AtomicU64> = GenericGauge::new(
        "firmheap_heap_bytes_in_use",
        "System heap bytes currently allocated"
    ).unwrap();

    pub static ref PENDING_RECLAIM: GenericGauge<AtomicU64> = GenericGauge::new(
        "firmheap_pending_reclaim",
        "Released allocations awaiting the next sweep"
    ).unwrap();

    // Loader metrics
    pub static ref PAYLOAD_BYTES_STAGED: GenericCounter<AtomicU64> = GenericCounter::new(
        "firmheap_payload_bytes_staged_total",
        "Payload bytes copied into managed memory"
    ).unwrap();

    pub static ref PAYLOAD_LOADS: IntCounterVec = IntCounterVec::new(
        Opts::new("firmheap_payload_loads_total", "Payload load attempts"),
        &["status"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry (idempotent)
pub fn init_metrics() {
    INIT.call_once(|| {
        info!("Initializing Prometheus metrics");

        METRICS_REGISTRY.register(Box::new(ALLOCATIONS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(ALLOCATION_FAILURES.clone())).ok();

        METRICS_REGISTRY.register(Box::new(COMPACTIONS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(BLOCKS_MOVED_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(SWEEPS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(RECLAIMED_TOTAL.clone())).ok();

        METRICS_REGISTRY.register(Box::new(POOL_BLOCKS_IN_USE.clone())).ok();
        METRICS_REGISTRY.register(Box::new(HEAP_BYTES_IN_USE.clone())).ok();
        METRICS_REGISTRY.register(Box::new(PENDING_RECLAIM.clone())).ok();

        METRICS_REGISTRY.register(Box::new(PAYLOAD_BYTES_STAGED.clone())).ok();
        METRICS_REGISTRY.register(Box::new(PAYLOAD_LOADS.clone())).ok();
    });
}

pub fn record_allocation(region: Region) {
    ALLOCATIONS_TOTAL.with_label_values(&[region.label()]).inc();
}

pub fn record_allocation_failure(reason: &str) {
    ALLOCATION_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_compaction(moved: usize) {
    COMPACTIONS_TOTAL.inc();
    BLOCKS_MOVED_TOTAL.inc_by(moved as u64);
}

pub fn record_sweep(freed: usize) {
    SWEEPS_TOTAL.inc();
    RECLAIMED_TOTAL.inc_by(freed as u64);
}

pub fn update_memory_gauges(pool_blocks: usize, heap_bytes: usize, pending: usize) {
    POOL_BLOCKS_IN_USE.set(pool_blocks as u64);
    HEAP_BYTES_IN_USE.set(heap_bytes as u64);
    PENDING_RECLAIM.set(pending as u64);
}

pub fn record_payload_bytes(bytes: usize) {
    PAYLOAD_BYTES_STAGED.inc_by(bytes as u64);
}

pub fn record_payload_load(status: &str) {
    PAYLOAD_LOADS.with_label_values(&[status]).inc();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCapability;

    #[test]
    fn test_init_metrics_twice() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_record_allocation_by_region() {
        let before = ALLOCATIONS_TOTAL.with_label_values(&["capability"]).get();
        record_allocation(Region::Capability(MemoryCapability::Dma));
        assert!(ALLOCATIONS_TOTAL.with_label_values(&["capability"]).get() > before);
    }

    #[test]
    fn test_export_metrics() {
        init_metrics();
        record_compaction(2);
        record_payload_load("staged");

        let output = export_metrics();
        assert!(output.contains("firmheap_compactions_total"));
        assert!(output.contains("firmheap_payload_loads_total"));
    }
}

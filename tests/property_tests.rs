//! Property tests for pool bookkeeping, compaction and collection

use firmheap::config::MemoryConfig;
use firmheap::memory::{Handle, MemoryCapability, MemoryManager, Region, SlabPool};
use proptest::prelude::*;

fn config() -> MemoryConfig {
    MemoryConfig {
        pool_capacity: 1024,
        block_size: 64,
        large_threshold: 128,
        heap_capacity: 64 * 1024,
        alignment: 8,
        capability: MemoryCapability::Dma,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Allocate), any::<usize>().prop_map(Op::Free)]
}

// PROPERTY: allocated block count always stays within 0..=N and matches the
// number of outstanding allocations
proptest! {
    #[test]
    fn test_property_pool_capacity(ops in prop::collection::vec(op(), 0..200)) {
        let mut pool = SlabPool::new(1024, 64).unwrap();
        let mut live = Vec::new();

        for op in ops {
            match op {
                Op::Allocate => {
                    if let Some(address) = pool.allocate() {
                        live.push(address);
                    } else {
                        prop_assert_eq!(live.len(), pool.block_count());
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let address = live.swap_remove(i % live.len());
                    pool.free(address).unwrap();
                }
                Op::Free(_) => {}
            }
            prop_assert!(pool.blocks_in_use() <= pool.block_count());
            prop_assert_eq!(pool.blocks_in_use(), live.len());
        }
    }
}

// PROPERTY: after compaction, k live blocks occupy indices 0..k in their
// original order with their original bytes
proptest! {
    #[test]
    fn test_property_compaction_packs_in_order(keep in prop::collection::vec(any::<bool>(), 16)) {
        let mut pool = SlabPool::new(1024, 64).unwrap();
        let addresses: Vec<_> = (0..16).map(|_| pool.allocate().unwrap()).collect();
        for (i, address) in addresses.iter().enumerate() {
            pool.block_at_mut(*address).unwrap().fill(i as u8);
        }
        for (address, kept) in addresses.iter().zip(&keep) {
            if !kept {
                pool.free(*address).unwrap();
            }
        }

        pool.compact();

        let survivors: Vec<u8> = (0..16u8).filter(|i| keep[*i as usize]).collect();
        for (index, fill) in survivors.iter().enumerate() {
            let address = pool.address_of(index);
            prop_assert!(pool.is_allocated(index));
            prop_assert!(pool.block_at(address).unwrap().iter().all(|b| b == fill));
        }
        for index in survivors.len()..16 {
            prop_assert!(!pool.is_allocated(index));
        }
    }
}

// PROPERTY: handles keep their bytes across any sequence of releases,
// sweeps and compactions, and the collector never frees a live handle
proptest! {
    #[test]
    fn test_property_handles_survive_compaction(
        sizes in prop::collection::vec(1usize..300, 1..24),
        drop_mask in prop::collection::vec(any::<bool>(), 24),
    ) {
        let mm = MemoryManager::new(config()).unwrap();
        let mut held: Vec<(u8, Handle)> = Vec::new();

        for (i, size) in sizes.iter().enumerate() {
            let Ok(handle) = mm.allocate_handle(*size) else { continue };
            handle.fill(i as u8).unwrap();
            held.push((i as u8, handle));
        }

        let mut index = 0;
        held.retain(|_| {
            let keep = !drop_mask[index % drop_mask.len()];
            index += 1;
            keep
        });

        mm.run_collector_sweep();
        mm.run_compaction();
        mm.run_collector_sweep();

        for (fill, handle) in &held {
            prop_assert!(mm.is_in_use(handle.address().unwrap()));
            prop_assert!(handle.to_vec().unwrap().iter().all(|b| b == fill));
        }
        let pool_handles = held.iter().filter(|(_, h)| h.region() == Region::Pool).count();
        prop_assert_eq!(mm.stats().blocks_in_use, pool_handles);
        prop_assert_eq!(mm.stats().pending_reclaim, 0);
    }
}

// PROPERTY: routing follows the thresholds for every size
proptest! {
    #[test]
    fn test_property_routing(size in 1usize..1024) {
        let mm = MemoryManager::new(config()).unwrap();
        let expected = if size <= 64 {
            Region::Pool
        } else if size > 128 {
            Region::Capability(MemoryCapability::Dma)
        } else {
            Region::System
        };
        prop_assert_eq!(mm.route(size), expected);
    }
}

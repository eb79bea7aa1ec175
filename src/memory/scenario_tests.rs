//! Scenario tests for the memory manager
//!
//! These walk whole allocation lifecycles through the public API the way
//! the loader and scheduler drive it on the device.

#[cfg(test)]
mod scenarios {
    use crate::config::MemoryConfig;
    use crate::error::{Error, Result};
    use crate::memory::{MemoryCapability, MemoryManager, Region};

    fn device_config() -> MemoryConfig {
        MemoryConfig {
            pool_capacity: 1024,
            block_size: 64,
            large_threshold: 128,
            heap_capacity: 64 * 1024,
            alignment: 8,
            capability: MemoryCapability::Dma,
        }
    }

    #[test]
    fn test_fill_exhaust_reuse_and_fallback() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;
        let base = mm.pool_base();

        let blocks: Vec<_> = (0..16).map(|_| mm.allocate(64)).collect::<Result<_>>()?;
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.region, Region::Pool);
            assert_eq!(block.address, base.offset(i * 64));
        }

        // 17th request: one no-op compaction, then failure
        assert!(matches!(
            mm.allocate(64),
            Err(Error::PoolExhausted { block_size: 64 })
        ));
        assert_eq!(mm.stats().compactions, 1);
        assert_eq!(mm.stats().blocks_in_use, 16);

        mm.free(blocks[3])?;
        let reused = mm.allocate(64)?;
        assert_eq!(reused.address, blocks[3].address);

        let large = mm.allocate(200)?;
        assert_eq!(large.region, Region::Capability(MemoryCapability::Dma));
        assert!(!blocks.iter().any(|b| b.address == large.address));
        assert_eq!(mm.stats().blocks_in_use, 16);

        Ok(())
    }

    #[test]
    fn test_threshold_boundaries() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;

        let at_block = mm.allocate(64)?;
        let above_block = mm.allocate(65)?;
        let at_large = mm.allocate(128)?;
        let above_large = mm.allocate(129)?;

        assert_eq!(at_block.region, Region::Pool);
        assert_eq!(above_block.region, Region::System);
        assert_eq!(at_large.region, Region::System);
        assert_eq!(above_large.region, Region::Capability(MemoryCapability::Dma));

        for allocation in [at_block, above_block, at_large, above_large] {
            mm.free(allocation)?;
        }
        assert_eq!(mm.stats().heap_in_use, 0);
        Ok(())
    }

    #[test]
    fn test_reference_counting_defers_release() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;

        let h1 = mm.allocate_handle(64)?;
        h1.write(0, b"firmware")?;
        let h2 = h1.clone();
        let address = h1.address()?;

        drop(h1);
        assert!(mm.is_in_use(address));
        let mut buf = [0u8; 8];
        h2.read(0, &mut buf)?;
        assert_eq!(&buf, b"firmware");
        h2.write_byte(0, b'F')?;

        // Dropping the last clone flips the flag; the bytes stay until a sweep
        drop(h2);
        assert!(!mm.is_in_use(address));
        assert!(mm.is_tracked(address));
        assert_eq!(mm.stats().blocks_in_use, 1);

        let report = mm.run_collector_sweep();
        assert_eq!(report.freed, 1);
        assert!(!mm.is_tracked(address));
        assert_eq!(mm.stats().blocks_in_use, 0);
        Ok(())
    }

    #[test]
    fn test_collector_never_frees_live_allocations() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;

        let live: Vec<_> = (0..4).map(|_| mm.allocate_handle(48)).collect::<Result<_>>()?;
        let raw = mm.allocate(300)?;
        let dead = mm.allocate_handle(90)?;
        let dead_address = dead.address()?;
        drop(dead);

        let report = mm.run_collector_sweep();
        assert_eq!(report.freed, 1);
        assert_eq!(report.freed_bytes, 90);
        assert_eq!(report.retained, 5);

        for handle in &live {
            assert!(mm.is_in_use(handle.address()?));
        }
        assert!(mm.is_in_use(raw.address));
        assert!(!mm.is_tracked(dead_address));

        // A second sweep with nothing pending is a no-op
        assert_eq!(mm.run_collector_sweep().freed, 0);
        Ok(())
    }

    #[test]
    fn test_compaction_keeps_handles_valid() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;
        let base = mm.pool_base();

        let handles: Vec<_> = (0..8).map(|_| mm.allocate_handle(64)).collect::<Result<_>>()?;
        for (i, handle) in handles.iter().enumerate() {
            handle.fill(i as u8)?;
        }

        let mut survivors = Vec::new();
        for (i, handle) in handles.into_iter().enumerate() {
            if i % 2 == 0 {
                survivors.push((i as u8, handle));
            }
        }
        mm.run_collector_sweep();
        assert_eq!(mm.stats().blocks_in_use, 4);

        let report = mm.run_compaction();
        assert_eq!(report.moved, 3);
        assert_eq!(report.live_blocks, 4);

        for (index, (fill, handle)) in survivors.iter().enumerate() {
            assert_eq!(handle.address()?, base.offset(index * 64));
            assert_eq!(handle.to_vec()?, vec![*fill; 64]);
        }
        Ok(())
    }

    #[test]
    fn test_compaction_moves_pending_garbage_and_collector_follows() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;
        let base = mm.pool_base();

        let hole = mm.allocate(64)?;
        let pending = mm.allocate_handle(64)?;
        let keeper = mm.allocate_handle(64)?;
        keeper.fill(0xEE)?;
        drop(pending);

        mm.free(hole)?;
        let report = mm.run_compaction();
        assert_eq!(report.moved, 2);

        // The released block moved to index 0 and is still awaiting collection
        assert!(mm.is_tracked(base));
        assert!(!mm.is_in_use(base));
        assert_eq!(keeper.address()?, base.offset(64));

        let swept = mm.run_collector_sweep();
        assert_eq!(swept.freed, 1);
        assert_eq!(mm.stats().blocks_in_use, 1);
        assert_eq!(keeper.to_vec()?, vec![0xEE; 64]);
        Ok(())
    }

    #[test]
    fn test_system_allocations_never_move() -> Result<()> {
        let mm = MemoryManager::new(device_config())?;

        let gap = mm.allocate_handle(16)?;
        let small = mm.allocate_handle(16)?;
        let big = mm.allocate_handle(512)?;
        let big_address = big.address()?;
        drop(gap);
        mm.run_collector_sweep();

        let report = mm.run_compaction();
        assert_eq!(report.moved, 1);
        assert_eq!(small.address()?, mm.pool_base());
        assert_eq!(big.address()?, big_address);
        Ok(())
    }
}

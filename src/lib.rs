// firmheap - Hybrid memory manager for single-board firmware
// Slab pool + system fallback + compacting, reference-counted handles

#![warn(rust_2018_idioms)]

pub mod config;
pub mod loader;
pub mod memory;
pub mod metrics;
pub mod scheduler;
pub mod simulation;

// Re-exports for convenience
pub use config::Settings;
pub use loader::{FirmwareLoader, HostLauncher, Launcher, StagedPayload, VerifiedPayload};
pub use memory::{
    Address, Handle, Indirection, MemoryCapability, MemoryManager, MemoryStats, RawAllocation,
    Region,
};
pub use scheduler::{PeriodicTask, Scheduler, Watchdog};

/// firmheap error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Slab pool exhausted: no free {block_size}-byte block after compaction")]
        PoolExhausted { block_size: usize },

        #[error("Heap exhausted: could not allocate {size} bytes")]
        HeapExhausted { size: usize },

        #[error("Out of bounds: offset {offset} + {len} exceeds allocation of {capacity} bytes")]
        OutOfBounds {
            offset: usize,
            len: usize,
            capacity: usize,
        },

        #[error("Invalid address: {0}")]
        InvalidAddress(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Insufficient memory: need {required} bytes, {available} available")]
        InsufficientMemory { required: usize, available: usize },

        #[error("Loader error: {0}")]
        Loader(String),

        #[error("Verification failed: expected sha256 {expected}, got {actual}")]
        VerificationFailed { expected: String, actual: String },

        #[error("Watchdog expired: no heartbeat for {elapsed_ms} ms (timeout {timeout_ms} ms)")]
        WatchdogExpired { elapsed_ms: u64, timeout_ms: u64 },

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl Error {
        /// Errors after which the dispatcher must stop.
        pub fn is_fatal(&self) -> bool {
            matches!(self, Error::WatchdogExpired { .. })
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_only_watchdog_is_fatal() {
        let expired = Error::WatchdogExpired {
            elapsed_ms: 6000,
            timeout_ms: 5000,
        };
        assert!(expired.is_fatal());
        assert!(!Error::PoolExhausted { block_size: 64 }.is_fatal());
        assert!(!Error::Loader("truncated".to_string()).is_fatal());
    }
}

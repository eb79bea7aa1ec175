//! Layered configuration
//!
//! Settings are resolved in three layers, later layers winning:
//!
//! ```text
//! built-in defaults
//!   └─→ TOML file (--config / FIRMHEAP_CONFIG)
//!        └─→ environment: FIRMHEAP__<SECTION>__<KEY>
//! ```
//!
//! Example: `FIRMHEAP__MEMORY__BLOCK_SIZE=128` overrides `[memory] block_size`.

use crate::error::{Error, Result};
use crate::memory::MemoryCapability;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FIRMHEAP";

/// Complete runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub memory: MemoryConfig,
    pub loader: LoaderConfig,
    pub scheduler: SchedulerConfig,
}

/// Memory manager sizing and routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total slab pool size in bytes (multiple of `block_size`)
    pub pool_capacity: usize,
    /// Size of one slab block; requests up to this size use the pool
    pub block_size: usize,
    /// Requests above this size go to the capability-tagged allocator
    pub large_threshold: usize,
    /// Byte budget of the system heap shared by both fallback paths
    pub heap_capacity: usize,
    /// Alignment used for system allocations
    pub alignment: usize,
    /// Capability tag for large allocations
    pub capability: MemoryCapability,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 8 * 1024,
            block_size: 64,
            large_threshold: 128,
            heap_capacity: 256 * 1024,
            alignment: 8,
            capability: MemoryCapability::Dma,
        }
    }
}

impl MemoryConfig {
    /// Number of blocks in the slab pool
    pub fn block_count(&self) -> usize {
        if self.block_size == 0 {
            0
        } else {
            self.pool_capacity / self.block_size
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("memory.block_size must be > 0".to_string()));
        }
        if self.pool_capacity == 0 || self.pool_capacity % self.block_size != 0 {
            return Err(Error::Config(format!(
                "memory.pool_capacity ({}) must be a non-zero multiple of block_size ({})",
                self.pool_capacity, self.block_size
            )));
        }
        if self.large_threshold < self.block_size {
            return Err(Error::Config(format!(
                "memory.large_threshold ({}) must be >= block_size ({})",
                self.large_threshold, self.block_size
            )));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::Config(format!(
                "memory.alignment ({}) must be a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Firmware loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Bytes read from the source per cooperative step
    pub chunk_size: usize,
    /// Refuse to launch payloads without an expected digest
    pub require_digest: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            require_digest: true,
        }
    }
}

/// Dispatcher periods (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Dispatcher tick; period of "immediate-rate" tasks
    pub tick_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub health_interval_ms: u64,
    pub collector_interval_ms: u64,
    /// Hardware watchdog window the heartbeat must beat
    pub watchdog_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            heartbeat_interval_ms: 1000,
            health_interval_ms: 1000,
            collector_interval_ms: 5000,
            watchdog_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_millis(self.collector_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(Error::Config("scheduler.tick_ms must be > 0".to_string()));
        }
        if self.watchdog_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::Config(format!(
                "scheduler.watchdog_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.watchdog_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                File::new(&path.to_string_lossy(), FileFormat::Toml).required(true),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        settings.validate()?;
        debug!(?settings, "Configuration resolved");
        Ok(settings)
    }

    /// Parse settings from a TOML string (no environment layer)
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        self.scheduler.validate()?;
        if self.loader.chunk_size == 0 {
            return Err(Error::Config("loader.chunk_size must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.memory.block_count(), 128);
        assert_eq!(settings.scheduler.collector_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            [memory]
            pool_capacity = 1024
            block_size = 64

            [loader]
            chunk_size = 128
            "#,
        )
        .unwrap();

        assert_eq!(settings.memory.block_count(), 16);
        assert_eq!(settings.memory.large_threshold, 128);
        assert_eq!(settings.memory.capability, MemoryCapability::Dma);
        assert_eq!(settings.loader.chunk_size, 128);
        assert!(settings.loader.require_digest);
    }

    #[test]
    fn test_rejects_misaligned_pool() {
        let err = Settings::from_toml("[memory]\npool_capacity = 1000\nblock_size = 64\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_threshold_below_block() {
        let mut memory = MemoryConfig::default();
        memory.large_threshold = 32;
        assert!(memory.validate().is_err());
    }

    #[test]
    fn test_rejects_watchdog_shorter_than_heartbeat() {
        let scheduler = SchedulerConfig {
            watchdog_timeout_ms: 500,
            ..SchedulerConfig::default()
        };
        assert!(scheduler.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("firmheap_cfg_{}.toml", std::process::id()));
        std::fs::write(&path, "[memory]\ncapability = \"internal\"\nheap_capacity = 4096\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.memory.capability, MemoryCapability::Internal);
        assert_eq!(settings.memory.heap_capacity, 4096);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let text = Settings::default().to_toml().unwrap();
        assert!(text.contains("[memory]"));
        assert_eq!(Settings::from_toml(&text).unwrap(), Settings::default());
    }
}

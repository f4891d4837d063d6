//! Typed configuration consumed when constructing an [`Engine`].
//!
//! Every option a collaborator can set is represented here; parsing from a
//! configuration file or command line belongs to the embedding server, not
//! to this crate.
//!
//! [`Engine`]: crate::engine::Engine

use std::time::Duration;

use crate::codec::CodecKind;
use crate::governor::AdjustmentMode;
use crate::migrate::MigrationMode;
use crate::region::RegionFormat;


/// Top-level configuration for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub compression: CompressionConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub governor: GovernorConfig,
}

/// Codec selection and behavior of the compression service.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Primary compression algorithm for chunk payloads.
    pub algorithm: CodecKind,
    /// Requested compression level, clamped to the algorithm's range.
    pub level: u32,
    /// Retry a failed compression with the fallback codec.
    pub fallback_enabled: bool,
    /// Re-encode chunks stored with a non-primary codec when they are next
    /// saved after a load.
    pub recompress_on_load: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CodecKind::Zstd,
            level: 3,
            fallback_enabled: true,
            recompress_on_load: false,
        }
    }
}

/// Preferred on-disk format for newly written regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageFormat {
    /// Keep whatever format a region already uses, write Linear for new ones.
    #[default]
    Auto,
    Linear,
    Anvil,
}

impl StorageFormat {

    /// Resolve the format to use for a region currently stored as `existing`.
    pub fn resolve(self, existing: Option<RegionFormat>) -> RegionFormat {
        match self {
            Self::Auto => existing.unwrap_or(RegionFormat::Linear),
            Self::Linear => RegionFormat::Linear,
            Self::Anvil => RegionFormat::Anvil,
        }
    }

}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub format: StorageFormat,
    pub conversion_mode: MigrationMode,
    /// Keep a copy of original `.mca` files when migrating.
    pub backup_original: bool,
    pub cache: CacheConfig,
    pub pools: PoolsConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            format: StorageFormat::Auto,
            conversion_mode: MigrationMode::Manual,
            backup_original: true,
            cache: CacheConfig::default(),
            pools: PoolsConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_bytes: u64,
    /// Entries older than this are dropped on lookup.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 256 * 1024 * 1024,
            ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Worker count for one of the storage pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolSize {
    /// Let the governor derive the size from the hardware profile.
    #[default]
    Auto,
    Fixed(usize),
}

impl PoolSize {

    pub fn resolve(self, auto: usize) -> usize {
        match self {
            Self::Auto => auto,
            Self::Fixed(n) => n.max(1),
        }
    }

}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolsConfig {
    pub load: PoolSize,
    pub write: PoolSize,
    pub compress: PoolSize,
    pub decompress: PoolSize,
}

impl PoolsConfig {

    /// True when every pool is left to the governor.
    pub fn all_auto(&self) -> bool {
        [self.load, self.write, self.compress, self.decompress]
            .iter()
            .all(|size| *size == PoolSize::Auto)
    }

}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global bound on running tasks, `None` lets the governor derive it.
    pub max_concurrent: Option<usize>,
    /// Maximum concurrently running prefetch tasks.
    pub prefetch_cap: usize,
    /// Maximum concurrently running background generation tasks.
    pub background_cap: usize,
    /// Queue depth above which background submissions are refused.
    pub background_watermark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            prefetch_cap: 2,
            background_cap: 4,
            background_watermark: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub mode: AdjustmentMode,
    pub adjust_interval: Duration,
    /// Memory budget reported by the default hardware provider. Collaborators
    /// embedding the engine usually know the JVM-equivalent heap ceiling of
    /// their deployment better than the OS does.
    pub max_memory: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            mode: AdjustmentMode::Adaptive,
            adjust_interval: Duration::from_secs(30),
            max_memory: 4 * 1024 * 1024 * 1024,
        }
    }
}

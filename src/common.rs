//! Common types and error definitions for spinel
//!
//! Configuration, the crate-wide error enum, and the handful of layout
//! constants shared by the log, index, and checkpoint machinery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alignment of records inside a log page, in bytes. Every record size is
/// rounded up to a multiple of this, so record headers are always 8-byte
/// aligned and a chain address never points mid-word.
pub const RECORD_ALIGN: u32 = 8;

/// Cache line size assumed for index buckets and epoch slots.
pub const CACHE_LINE_BYTES: usize = 64;

/// Default page size for the hybrid log: 32MB pages.
pub const DEFAULT_PAGE_SIZE: u32 = 32 * 1024 * 1024;

/// Synchronization mode for durability vs performance trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// No explicit sync - rely on OS page cache (fastest, least durable)
    None,
    /// Sync to disk from a periodic background task (balanced)
    Periodic,
    /// Sync after every commit (slowest, most durable)
    Always,
}

/// Options governing the append-only operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AofConfig {
    /// Whether the AOF is maintained at all.
    pub enabled: bool,
    /// Keep the AOF on an in-memory device (main-memory replication mode).
    pub main_memory: bool,
    /// Permit replicas to attach behind the truncation point. A lossy AOF
    /// trades replay completeness for unbounded truncation.
    pub lossy: bool,
    /// Granularity of AOF prefix truncation, in bytes. Power of two.
    pub page_size: u32,
    /// Interval of the group-commit task when `sync_mode` is `Periodic`.
    pub commit_interval_ms: u64,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            main_memory: false,
            lossy: false,
            page_size: 4096,
            commit_interval_ms: 50,
        }
    }
}

/// Configuration for a spinel store instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Size of the in-memory portion of the hybrid log (in bytes).
    /// Must be a power-of-two multiple of `page_size`.
    pub memory_size: u64,
    /// Page size for the hybrid log. Power of two.
    pub page_size: u32,
    /// Directory for log segments, checkpoints, and the AOF.
    pub storage_dir: String,
    /// Number of hash index buckets. Power of two.
    pub index_buckets: u64,
    /// Fraction of the in-memory window kept mutable; the maintenance task
    /// shifts the read-only address when the mutable region outgrows it.
    pub mutable_fraction: f64,
    /// Maximum number of evicted pages kept in the allocator's reuse pool.
    pub page_pool_size: usize,
    /// Sector size the backing device is aligned to.
    pub sector_size: u32,
    /// Size of each on-disk log segment.
    pub segment_size: u64,
    /// Largest accepted key, in bytes.
    pub max_key_size: usize,
    /// Largest accepted value, in bytes.
    pub max_value_size: usize,
    /// Whether to run periodic fold-over checkpoints.
    pub enable_checkpointing: bool,
    /// Checkpoint interval in milliseconds.
    pub checkpoint_interval_ms: u64,
    /// Whether to run the background log-maintenance task.
    pub enable_maintenance: bool,
    /// Maintenance interval in milliseconds.
    pub maintenance_interval_ms: u64,
    /// Maximum number of background tasks.
    pub max_background_threads: usize,
    /// Use a single memory-mapped file for the main log instead of
    /// segmented files.
    pub use_mmap: bool,
    /// Sync mode for the main log and AOF devices.
    pub sync_mode: SyncMode,
    /// Append-only-file settings.
    pub aof: AofConfig,
}

impl Config {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 1024 {
            return Err(SpinelError::InvalidConfig {
                message: "Page size must be at least 1KB".to_string(),
            });
        }
        if !self.page_size.is_power_of_two() {
            return Err(SpinelError::InvalidConfig {
                message: "Page size must be a power of 2".to_string(),
            });
        }
        if self.memory_size < 2 * self.page_size as u64 {
            return Err(SpinelError::InvalidConfig {
                message: "Memory size must hold at least two pages".to_string(),
            });
        }
        let frames = self.memory_size / self.page_size as u64;
        if !frames.is_power_of_two() {
            return Err(SpinelError::InvalidConfig {
                message: "Memory size must be a power-of-two multiple of the page size"
                    .to_string(),
            });
        }
        if !self.index_buckets.is_power_of_two() {
            return Err(SpinelError::InvalidConfig {
                message: "Index bucket count must be a power of 2".to_string(),
            });
        }
        if !(0.05..=0.95).contains(&self.mutable_fraction) {
            return Err(SpinelError::InvalidConfig {
                message: "Mutable fraction must be within [0.05, 0.95]".to_string(),
            });
        }
        if !self.sector_size.is_power_of_two() || self.sector_size > self.page_size {
            return Err(SpinelError::InvalidConfig {
                message: "Sector size must be a power of 2 no larger than the page size"
                    .to_string(),
            });
        }
        if self.segment_size % self.page_size as u64 != 0 {
            return Err(SpinelError::InvalidConfig {
                message: "Segment size must be a multiple of the page size".to_string(),
            });
        }
        if self.storage_dir.is_empty() {
            return Err(SpinelError::InvalidConfig {
                message: "Storage directory cannot be empty".to_string(),
            });
        }
        if self.max_key_size + self.max_value_size + 64 > self.page_size as usize {
            return Err(SpinelError::InvalidConfig {
                message: "A maximum-size record must fit in one page".to_string(),
            });
        }
        if self.enable_checkpointing && self.checkpoint_interval_ms < 100 {
            return Err(SpinelError::InvalidConfig {
                message: "Checkpoint interval must be at least 100ms".to_string(),
            });
        }
        if self.max_background_threads == 0 || self.max_background_threads > 32 {
            return Err(SpinelError::InvalidConfig {
                message: "Background threads must be between 1 and 32".to_string(),
            });
        }
        if self.aof.enabled && !self.aof.page_size.is_power_of_two() {
            return Err(SpinelError::InvalidConfig {
                message: "AOF page size must be a power of 2".to_string(),
            });
        }
        if self.maintenance_interval_ms < 10 {
            log::warn!(
                "Maintenance interval of {}ms is aggressive; expect flush churn",
                self.maintenance_interval_ms
            );
        }
        Ok(())
    }

    /// A configuration sized for tests and constrained hosts.
    pub fn low_memory() -> Self {
        Self {
            memory_size: 8 * 1024 * 1024,
            page_size: 1024 * 1024,
            checkpoint_interval_ms: 2000,
            maintenance_interval_ms: 100,
            max_background_threads: 2,
            ..Default::default()
        }
    }

    /// A configuration tuned for throughput on large hosts.
    pub fn high_performance() -> Self {
        Self {
            memory_size: 4 * 1024 * 1024 * 1024,
            page_size: 64 * 1024 * 1024,
            index_buckets: 1 << 24,
            checkpoint_interval_ms: 30_000,
            max_background_threads: 8,
            ..Default::default()
        }
    }

    /// Number of page frames in the in-memory window.
    pub fn buffer_frames(&self) -> u32 {
        (self.memory_size / self.page_size as u64) as u32
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_size: 1024 * 1024 * 1024,
            page_size: DEFAULT_PAGE_SIZE,
            storage_dir: "./spinel_data".to_string(),
            index_buckets: 1 << 20,
            mutable_fraction: 0.5,
            page_pool_size: 4,
            sector_size: 512,
            segment_size: 1024 * 1024 * 1024,
            max_key_size: 4096,
            max_value_size: 32 * 1024,
            enable_checkpointing: false,
            checkpoint_interval_ms: 5000,
            enable_maintenance: false,
            maintenance_interval_ms: 500,
            max_background_threads: 4,
            use_mmap: false,
            sync_mode: SyncMode::Periodic,
            aof: AofConfig::default(),
        }
    }
}

/// Error types for spinel operations
#[derive(Error, Debug)]
pub enum SpinelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// No mutable log capacity right now; retry after an epoch drain.
    #[error("Log mutable region is full")]
    RegionFull,

    /// The store was shut down while the operation was in flight.
    #[error("Operation canceled")]
    Canceled,

    /// A replica asked to start behind the AOF truncation point.
    #[error(
        "Replica start address {start_address:#x} is behind the truncation point {truncated_until:#x}"
    )]
    ReplicaTooFarBehind {
        start_address: u64,
        truncated_until: u64,
    },

    #[error("Checkpoint operation failed: {message}")]
    CheckpointFailed { message: String },

    #[error("Recovery operation failed: {message}")]
    RecoveryFailed { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Key size {size} bytes exceeds maximum allowed size {max_size} bytes")]
    KeyTooLarge { size: usize, max_size: usize },

    #[error("Value size {size} bytes exceeds maximum allowed size {max_size} bytes")]
    ValueTooLarge { size: usize, max_size: usize },

    #[error("Storage device error: {message}")]
    Storage { message: String },

    #[error("Data corruption detected: {message}")]
    Corruption { message: String },

    #[error("Operation timed out after {duration_ms} ms")]
    Timeout { duration_ms: u64 },

    /// A structural invariant was violated; the store is faulted.
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SpinelError {
    /// Check if this error is transient and worth retrying locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpinelError::RegionFull
                | SpinelError::Timeout { .. }
                | SpinelError::Io(_)
                | SpinelError::Storage { .. }
        )
    }

    /// Check if this error faults the whole store.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpinelError::InvariantViolation { .. } | SpinelError::Corruption { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SpinelError::Io(_) => "io",
            SpinelError::Serialization(_) => "serialization",
            SpinelError::RegionFull => "allocation",
            SpinelError::Canceled => "canceled",
            SpinelError::ReplicaTooFarBehind { .. } => "replication",
            SpinelError::CheckpointFailed { .. } => "checkpoint",
            SpinelError::RecoveryFailed { .. } => "recovery",
            SpinelError::InvalidConfig { .. } => "configuration",
            SpinelError::KeyTooLarge { .. } | SpinelError::ValueTooLarge { .. } => "size_limit",
            SpinelError::Storage { .. } => "storage",
            SpinelError::Corruption { .. } => "corruption",
            SpinelError::Timeout { .. } => "timeout",
            SpinelError::InvariantViolation { .. } => "invariant",
            SpinelError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for spinel operations
pub type Result<T> = std::result::Result<T, SpinelError>;

//! # spinel: a log-structured hybrid key-value engine
//!
//! `spinel` is the storage core of a Redis-compatible in-memory data store.
//! It pairs a memory-plus-disk record log with a concurrent hash index and
//! supports point operations, read-modify-write, snapshot and fold-over
//! checkpoints, and append-only-file (AOF) tail-sync for replicas.
//!
//! ## Core pieces
//!
//! - **Hybrid log**: a monotonic logical address space over a circular
//!   in-memory page window backed by a segmented on-disk log
//! - **Hash index**: cache-line-sized open-addressing buckets with overflow
//!   chains, updated by CAS
//! - **Epoch protection**: slot-table epochs with version-keyed drain
//!   actions for safe page eviction and reclamation
//! - **Operation engine**: Read/Upsert/RMW/Delete state machines with
//!   pending-I/O continuations for records that have left memory
//! - **AOF tail-sync**: an append-only operation log streamed to replica
//!   cursors, with safe prefix truncation
//!
//! ## Example
//!
//! ```rust,ignore
//! use spinel::{Config, SpinelStore, RawStoreFunctions, ReadOutcome};
//!
//! fn main() -> spinel::Result<()> {
//!     let config = Config::default();
//!     let store = SpinelStore::open(config, RawStoreFunctions)?;
//!
//!     store.upsert(b"hello", b"world")?;
//!     match store.read(b"hello")? {
//!         ReadOutcome::Found(value) => println!("{:?}", value),
//!         _ => unreachable!(),
//!     }
//!     store.close()?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod address;
pub mod alloc;
pub mod aof;
pub mod background;
pub mod checkpoint;
pub mod common;
pub mod device;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod locking;
pub mod record;
pub mod scan;
pub mod status;
pub mod store;

#[cfg(test)]
mod engine_tests;

pub use address::{Address, AtomicAddress, PageGeometry};
pub use aof::{AofLog, AofOp, AofStats, ReplicaClient, ReplicaCursor};
pub use background::{BackgroundTaskManager, BackgroundTaskStats, EngineHandle};
pub use checkpoint::{CheckpointKind, CheckpointManager, CheckpointMetadata, CheckpointStats};
pub use common::{AofConfig, Config, Result, SpinelError, SyncMode};
pub use epoch::{EpochGuard, EpochManager};
pub use hlog::HybridLog;
pub use index::KeyHash;
pub use locking::{LockKind, LockRequest, LockSet, LockTable};
pub use record::RecordInfo;
pub use scan::{BufferingMode, LogIterator, ScanEntry};
pub use status::{CompletedOp, DeleteOutcome, ReadOutcome, UpdateOutcome};
pub use store::{
    BincodeCodec, Codec, RawStoreFunctions, Spinel, SpinelStore, StoreFunctions, StoreStats,
};

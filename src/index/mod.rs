//! The hash index: a fixed table of cache-line-sized buckets mapping key
//! hashes to record-chain head addresses, with overflow chaining and
//! CAS-only writers.

pub mod hash_bucket;
pub mod key_hash;
pub mod mem_index;

pub use hash_bucket::{AtomicHashBucketEntry, HashBucket, HashBucketEntry};
pub use key_hash::KeyHash;
pub use mem_index::{EntryContext, MemIndex};

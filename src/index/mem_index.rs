//! The in-memory hash index.
//!
//! A fixed power-of-two table of [`HashBucket`]s plus a pool of overflow
//! buckets. Readers are wait-free; writers claim slots with a two-phase
//! tentative insert and swing entry addresses by CAS. Overflow buckets
//! are never unlinked; a bucket whose link CAS loses is recycled through
//! the pool's free list, and everything is released at teardown.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::address::Address;
use crate::common::{Result, SpinelError};
use crate::index::hash_bucket::{
    AtomicHashBucketEntry, HashBucket, HashBucketEntry, ENTRIES_PER_BUCKET,
};
use crate::index::key_hash::KeyHash;

const CHUNK_BUCKETS: usize = 64;
const MAX_CHUNKS: usize = 4096;

/// Allocator for overflow buckets. Buckets live in fixed chunks whose
/// addresses never move, so references handed out stay valid for the life
/// of the index.
struct OverflowPool {
    chunks: Box<[AtomicPtr<HashBucket>]>,
    grow_lock: Mutex<()>,
    next_id: AtomicU64,
    recycled: Mutex<Vec<u64>>,
}

impl OverflowPool {
    fn new() -> Self {
        let mut chunks = Vec::with_capacity(MAX_CHUNKS);
        for _ in 0..MAX_CHUNKS {
            chunks.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Self {
            chunks: chunks.into_boxed_slice(),
            grow_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            recycled: Mutex::new(Vec::new()),
        }
    }

    fn allocate(&self) -> Result<u64> {
        if let Some(id) = self.recycled.lock().pop() {
            return Ok(id);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let chunk_idx = ((id - 1) as usize) / CHUNK_BUCKETS;
        if chunk_idx >= MAX_CHUNKS {
            return Err(SpinelError::Internal {
                message: "overflow bucket pool exhausted".to_string(),
            });
        }
        if self.chunks[chunk_idx].load(Ordering::Acquire).is_null() {
            let _grow = self.grow_lock.lock();
            if self.chunks[chunk_idx].load(Ordering::Acquire).is_null() {
                let mut chunk: Vec<HashBucket> = Vec::with_capacity(CHUNK_BUCKETS);
                chunk.resize_with(CHUNK_BUCKETS, HashBucket::default);
                let raw = Box::into_raw(chunk.into_boxed_slice()) as *mut HashBucket;
                self.chunks[chunk_idx].store(raw, Ordering::Release);
            }
        }
        Ok(id)
    }

    /// Returns a bucket allocated by `allocate` but never linked.
    fn recycle(&self, id: u64) {
        self.recycled.lock().push(id);
    }

    fn get(&self, id: u64) -> &HashBucket {
        debug_assert!(id >= 1);
        let chunk_idx = ((id - 1) as usize) / CHUNK_BUCKETS;
        let within = ((id - 1) as usize) % CHUNK_BUCKETS;
        let base = self.chunks[chunk_idx].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { &*base.add(within) }
    }
}

impl Drop for OverflowPool {
    fn drop(&mut self) {
        for slot in self.chunks.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                let chunk = std::ptr::slice_from_raw_parts_mut(ptr, CHUNK_BUCKETS);
                unsafe { drop(Box::from_raw(chunk)) };
            }
        }
    }
}

/// Where a lookup landed: the matching (or claimed) entry and the slot
/// that holds it, for the subsequent CAS.
pub struct EntryContext {
    pub hash: KeyHash,
    pub entry: HashBucketEntry,
    slot: *const AtomicHashBucketEntry,
}

impl EntryContext {
    /// Head address of the record chain; `NULL` for a fresh entry.
    pub fn address(&self) -> Address {
        self.entry.address()
    }

    fn slot(&self) -> &AtomicHashBucketEntry {
        unsafe { &*self.slot }
    }
}

enum ScanOutcome {
    Found {
        entry: HashBucketEntry,
        slot: *const AtomicHashBucketEntry,
    },
    End {
        free_slot: Option<*const AtomicHashBucketEntry>,
        last_bucket: *const HashBucket,
    },
}

/// The hash index.
pub struct MemIndex {
    buckets: Box<[HashBucket]>,
    table_size: u64,
    overflow: OverflowPool,
}

impl MemIndex {
    pub fn new(table_size: u64) -> Self {
        debug_assert!(table_size.is_power_of_two());
        let mut buckets = Vec::with_capacity(table_size as usize);
        buckets.resize_with(table_size as usize, HashBucket::default);
        Self {
            buckets: buckets.into_boxed_slice(),
            table_size,
            overflow: OverflowPool::new(),
        }
    }

    #[inline]
    pub fn table_size(&self) -> u64 {
        self.table_size
    }

    /// Bucket index for a hash; also the lock-table index for that key.
    #[inline]
    pub fn bucket_index(&self, hash: KeyHash) -> u64 {
        hash.table_index(self.table_size)
    }

    fn scan_chain(&self, hash: KeyHash) -> ScanOutcome {
        let tag = hash.tag();
        let mut bucket: &HashBucket = &self.buckets[self.bucket_index(hash) as usize];
        let mut free_slot: Option<*const AtomicHashBucketEntry> = None;
        loop {
            for slot in &bucket.entries {
                let entry = slot.load();
                if entry.unused() {
                    if free_slot.is_none() {
                        free_slot = Some(slot as *const AtomicHashBucketEntry);
                    }
                    continue;
                }
                if entry.tag() == tag && !entry.tentative() {
                    return ScanOutcome::Found {
                        entry,
                        slot: slot as *const AtomicHashBucketEntry,
                    };
                }
            }
            let overflow = bucket.overflow_id();
            if overflow == 0 {
                return ScanOutcome::End {
                    free_slot,
                    last_bucket: bucket as *const HashBucket,
                };
            }
            bucket = self.overflow.get(overflow);
        }
    }

    /// Looks up an existing entry. Callers must hold epoch protection.
    pub fn find_entry(&self, hash: KeyHash) -> Option<EntryContext> {
        match self.scan_chain(hash) {
            ScanOutcome::Found { entry, slot } => Some(EntryContext { hash, entry, slot }),
            ScanOutcome::End { .. } => None,
        }
    }

    /// Looks up or claims an entry for `hash`. A claimed slot is first
    /// marked tentative; it is finalized only after a re-scan of the whole
    /// chain shows no second entry with the same tag, so two racing
    /// inserters of one key can never both finalize.
    pub fn find_or_create_entry(&self, hash: KeyHash) -> Result<EntryContext> {
        let tag = hash.tag();
        loop {
            let (free_slot, last_bucket) = match self.scan_chain(hash) {
                ScanOutcome::Found { entry, slot } => {
                    return Ok(EntryContext { hash, entry, slot })
                }
                ScanOutcome::End {
                    free_slot,
                    last_bucket,
                } => (free_slot, last_bucket),
            };

            let slot_ptr = match free_slot {
                Some(ptr) => ptr,
                None => {
                    // Chain is full; extend it with an overflow bucket.
                    let id = self.overflow.allocate()?;
                    let new_bucket = self.overflow.get(id);
                    if unsafe { &*last_bucket }.try_link_overflow(id) {
                        &new_bucket.entries[0] as *const AtomicHashBucketEntry
                    } else {
                        // Another thread linked first; re-walk into it.
                        self.overflow.recycle(id);
                        continue;
                    }
                }
            };

            let slot = unsafe { &*slot_ptr };
            let tentative = HashBucketEntry::new(Address::NULL, tag, true);
            if slot
                .compare_exchange(HashBucketEntry::default(), tentative)
                .is_err()
            {
                continue;
            }
            if self.has_conflicting_entry(hash, slot_ptr) {
                slot.store(HashBucketEntry::default());
                continue;
            }
            let entry = HashBucketEntry::new(Address::NULL, tag, false);
            slot.store(entry);
            return Ok(EntryContext {
                hash,
                entry,
                slot: slot_ptr,
            });
        }
    }

    /// Whether any other slot in the chain carries this tag (tentative
    /// entries included: when two claimers see each other, both retreat
    /// and retry).
    fn has_conflicting_entry(
        &self,
        hash: KeyHash,
        exclude: *const AtomicHashBucketEntry,
    ) -> bool {
        let tag = hash.tag();
        let mut bucket: &HashBucket = &self.buckets[self.bucket_index(hash) as usize];
        loop {
            for slot in &bucket.entries {
                if std::ptr::eq(slot as *const AtomicHashBucketEntry, exclude) {
                    continue;
                }
                let entry = slot.load();
                if !entry.unused() && entry.tag() == tag {
                    return true;
                }
            }
            let overflow = bucket.overflow_id();
            if overflow == 0 {
                return false;
            }
            bucket = self.overflow.get(overflow);
        }
    }

    /// Single-word CAS swinging the entry from the snapshot in `context`
    /// to `new_address`. Failure means another writer won; the caller
    /// restarts from lookup.
    pub fn try_update_entry(&self, context: &EntryContext, new_address: Address) -> bool {
        let desired = HashBucketEntry::new(new_address, context.hash.tag(), false);
        context.slot().compare_exchange(context.entry, desired).is_ok()
    }

    /// Visits every live entry in one bucket's chain. For management
    /// operations (compaction planning, diagnostics).
    pub fn for_each_in_bucket(&self, bucket_idx: u64, mut f: impl FnMut(HashBucketEntry)) {
        let mut bucket: &HashBucket = &self.buckets[bucket_idx as usize];
        loop {
            for slot in &bucket.entries {
                let entry = slot.load();
                if !entry.unused() && !entry.tentative() {
                    f(entry);
                }
            }
            let overflow = bucket.overflow_id();
            if overflow == 0 {
                return;
            }
            bucket = self.overflow.get(overflow);
        }
    }

    /// Visits every live entry as `(bucket_index, entry)`.
    pub fn for_each_entry(&self, mut f: impl FnMut(u64, HashBucketEntry)) {
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let mut bucket: &HashBucket = bucket;
            loop {
                for slot in &bucket.entries {
                    let entry = slot.load();
                    if !entry.unused() && !entry.tentative() {
                        f(idx as u64, entry);
                    }
                }
                let overflow = bucket.overflow_id();
                if overflow == 0 {
                    break;
                }
                bucket = self.overflow.get(overflow);
            }
        }
    }

    /// Number of live entries. Linear; used for stats and tests.
    pub fn entry_count(&self) -> usize {
        let mut count = 0;
        self.for_each_entry(|_, _| count += 1);
        count
    }

    /// Dumps live entries for an index snapshot.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        self.for_each_entry(|bucket, entry| out.push((bucket, entry.control())));
        out
    }

    /// Loads a snapshot produced by [`MemIndex::snapshot`]. Single-writer:
    /// recovery runs before the store accepts operations.
    pub fn restore(&self, entries: &[(u64, u64)]) -> Result<()> {
        for &(bucket_idx, control) in entries {
            if bucket_idx >= self.table_size {
                return Err(SpinelError::RecoveryFailed {
                    message: format!(
                        "index snapshot bucket {} exceeds table size {}",
                        bucket_idx, self.table_size
                    ),
                });
            }
            self.place_entry(bucket_idx, HashBucketEntry::from_control(control))?;
        }
        Ok(())
    }

    fn place_entry(&self, bucket_idx: u64, entry: HashBucketEntry) -> Result<()> {
        let mut bucket: &HashBucket = &self.buckets[bucket_idx as usize];
        loop {
            for slot in &bucket.entries {
                if slot.load().unused() {
                    slot.store(entry);
                    return Ok(());
                }
            }
            let overflow = bucket.overflow_id();
            if overflow != 0 {
                bucket = self.overflow.get(overflow);
                continue;
            }
            let id = self.overflow.allocate()?;
            let linked = bucket.try_link_overflow(id);
            debug_assert!(linked, "single-writer restore saw a concurrent link");
            bucket = self.overflow.get(id);
        }
    }
}

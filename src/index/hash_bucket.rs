//! Hash bucket layout.
//!
//! A bucket is exactly one cache line: seven packed entries plus an
//! overflow link to a chained bucket in the overflow pool. An entry packs
//! `[address:48][tag:14][tentative:1][valid:1]`; the valid bit guarantees
//! a live entry's control word is never zero, so zero always means an
//! unused slot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::common::CACHE_LINE_BYTES;
use crate::index::key_hash::KeyHash;

/// Number of record entries per bucket.
pub const ENTRIES_PER_BUCKET: usize = 7;

/// Entry stored in a hash bucket, packed into 8 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    const ADDRESS_BITS: u32 = 48;
    const ADDRESS_MASK: u64 = (1 << Self::ADDRESS_BITS) - 1;
    const TAG_SHIFT: u32 = Self::ADDRESS_BITS;
    const TAG_MASK: u64 = (1 << KeyHash::TAG_BITS) - 1;
    const TENTATIVE_SHIFT: u32 = Self::TAG_SHIFT + KeyHash::TAG_BITS;
    const VALID_SHIFT: u32 = Self::TENTATIVE_SHIFT + 1;

    pub fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & Self::ADDRESS_MASK;
        control |= (tag as u64 & Self::TAG_MASK) << Self::TAG_SHIFT;
        if tentative {
            control |= 1 << Self::TENTATIVE_SHIFT;
        }
        control |= 1 << Self::VALID_SHIFT;
        HashBucketEntry(control)
    }

    #[inline]
    pub fn from_control(control: u64) -> Self {
        HashBucketEntry(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn unused(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn address(&self) -> Address {
        Address::from_control(self.0 & Self::ADDRESS_MASK)
    }

    #[inline]
    pub fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }

    #[inline]
    pub fn tentative(&self) -> bool {
        (self.0 >> Self::TENTATIVE_SHIFT) & 1 != 0
    }
}

/// Atomic hash-bucket entry.
#[derive(Default)]
#[repr(transparent)]
pub struct AtomicHashBucketEntry(AtomicU64);

impl AtomicHashBucketEntry {
    #[inline]
    pub fn load(&self) -> HashBucketEntry {
        HashBucketEntry(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, desired: HashBucketEntry) {
        self.0.store(desired.control(), Ordering::Release)
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketEntry,
        new: HashBucketEntry,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        match self.0.compare_exchange(
            current.control(),
            new.control(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(v) => Ok(HashBucketEntry(v)),
            Err(v) => Err(HashBucketEntry(v)),
        }
    }
}

/// A bucket: seven entries plus an overflow link (a 1-based id into the
/// overflow pool; 0 means end of chain). Fits in a cache line.
#[derive(Default)]
#[repr(align(64))]
pub struct HashBucket {
    pub entries: [AtomicHashBucketEntry; ENTRIES_PER_BUCKET],
    pub overflow: AtomicU64,
}

impl HashBucket {
    #[inline]
    pub fn overflow_id(&self) -> u64 {
        self.overflow.load(Ordering::Acquire)
    }

    #[inline]
    pub fn try_link_overflow(&self, id: u64) -> bool {
        self.overflow
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

static_assertions::assert_eq_size!(HashBucket, [u8; CACHE_LINE_BYTES]);

//! Bucket latching.
//!
//! Each index bucket has one latch word packing a shared-reader count, an
//! exclusive bit, and a pending-exclusive bit that stops new readers from
//! starving a waiting writer. Transient latches guard a single in-place
//! record update; manual locks span multi-key atomic sequences. Manual
//! acquisition sorts keys by `(bucket, hash)` and takes each bucket once,
//! which makes deadlock between lock sets structurally impossible, and a
//! failed `try_lock` rolls back everything it acquired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::common::{Result, SpinelError};
use crate::index::KeyHash;

/// Kind of lock requested for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// One key in a manual lock request.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub hash: KeyHash,
    pub kind: LockKind,
}

impl LockRequest {
    pub fn shared(key: &[u8]) -> Self {
        Self {
            hash: KeyHash::of(key),
            kind: LockKind::Shared,
        }
    }

    pub fn exclusive(key: &[u8]) -> Self {
        Self {
            hash: KeyHash::of(key),
            kind: LockKind::Exclusive,
        }
    }
}

/// Latch word: `[shared_count:32][exclusive:1][pending_exclusive:1][..]`.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct BucketLatch(AtomicU64);

impl BucketLatch {
    const SHARED_SHIFT: u32 = 32;
    const SHARED_UNIT: u64 = 1 << Self::SHARED_SHIFT;
    const EXCLUSIVE_BIT: u64 = 1 << 31;
    const PENDING_BIT: u64 = 1 << 30;

    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn try_lock_shared(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & (Self::EXCLUSIVE_BIT | Self::PENDING_BIT) != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + Self::SHARED_UNIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn try_lock_exclusive(&self) -> bool {
        // Claims from idle or pending-only state.
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & !Self::PENDING_BIT != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                Self::EXCLUSIVE_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unlock_shared(&self) {
        let previous = self.0.fetch_sub(Self::SHARED_UNIT, Ordering::Release);
        debug_assert!(previous >> Self::SHARED_SHIFT > 0, "shared unlock underflow");
    }

    pub fn unlock_exclusive(&self) {
        let previous = self.0.fetch_and(!Self::EXCLUSIVE_BIT, Ordering::Release);
        debug_assert!(previous & Self::EXCLUSIVE_BIT != 0, "exclusive unlock without lock");
    }

    /// Blocking shared acquire with an optional deadline.
    pub fn lock_shared(&self, deadline: Option<Instant>) -> bool {
        let mut spins = 0u32;
        loop {
            if self.try_lock_shared() {
                return true;
            }
            if !Self::backoff(&mut spins, deadline) {
                return false;
            }
        }
    }

    /// Blocking exclusive acquire with an optional deadline. Announces
    /// intent through the pending bit so readers drain.
    pub fn lock_exclusive(&self, deadline: Option<Instant>) -> bool {
        let mut spins = 0u32;
        loop {
            self.0.fetch_or(Self::PENDING_BIT, Ordering::AcqRel);
            if self.try_lock_exclusive() {
                return true;
            }
            if !Self::backoff(&mut spins, deadline) {
                self.0.fetch_and(!Self::PENDING_BIT, Ordering::AcqRel);
                return false;
            }
        }
    }

    /// Upgrades the caller's single shared hold to exclusive. On timeout
    /// the shared hold is retained.
    pub fn try_promote(&self, deadline: Option<Instant>) -> bool {
        let mut spins = 0u32;
        loop {
            self.0.fetch_or(Self::PENDING_BIT, Ordering::AcqRel);
            let current = self.0.load(Ordering::Acquire);
            let shared = current >> Self::SHARED_SHIFT;
            if shared == 1 && current & Self::EXCLUSIVE_BIT == 0 {
                if self
                    .0
                    .compare_exchange(
                        current,
                        Self::EXCLUSIVE_BIT,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return true;
                }
            }
            if !Self::backoff(&mut spins, deadline) {
                self.0.fetch_and(!Self::PENDING_BIT, Ordering::AcqRel);
                return false;
            }
        }
    }

    fn backoff(spins: &mut u32, deadline: Option<Instant>) -> bool {
        *spins += 1;
        if *spins % 64 == 0 {
            std::thread::yield_now();
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
        } else {
            std::hint::spin_loop();
        }
        true
    }

    pub fn shared_count(&self) -> u32 {
        (self.0.load(Ordering::Acquire) >> Self::SHARED_SHIFT) as u32
    }

    pub fn is_exclusively_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) & Self::EXCLUSIVE_BIT != 0
    }

    pub fn is_locked(&self) -> bool {
        let current = self.0.load(Ordering::Acquire);
        current & Self::EXCLUSIVE_BIT != 0 || current >> Self::SHARED_SHIFT > 0
    }
}

/// Per-bucket latch table, sized to the index table.
pub struct LockTable {
    latches: Box<[BucketLatch]>,
    table_size: u64,
}

impl LockTable {
    pub fn new(table_size: u64) -> Self {
        debug_assert!(table_size.is_power_of_two());
        let mut latches = Vec::with_capacity(table_size as usize);
        latches.resize_with(table_size as usize, BucketLatch::new);
        Self {
            latches: latches.into_boxed_slice(),
            table_size,
        }
    }

    #[inline]
    pub fn bucket_of(&self, hash: KeyHash) -> u64 {
        hash.table_index(self.table_size)
    }

    #[inline]
    pub fn latch(&self, bucket: u64) -> &BucketLatch {
        &self.latches[bucket as usize]
    }

    /// Transient exclusive latch for one in-place record update.
    pub fn exclusive(&self, hash: KeyHash) -> ExclusiveGuard<'_> {
        let bucket = self.bucket_of(hash);
        self.latch(bucket).lock_exclusive(None);
        ExclusiveGuard {
            latch: self.latch(bucket),
        }
    }

    /// Transient shared latch.
    pub fn shared(&self, hash: KeyHash) -> SharedGuard<'_> {
        let bucket = self.bucket_of(hash);
        self.latch(bucket).lock_shared(None);
        SharedGuard {
            latch: self.latch(bucket),
        }
    }

    /// Manual multi-key lock; blocks until all buckets are held.
    pub fn lock(&self, requests: &[LockRequest]) -> LockSet<'_> {
        self.acquire(requests, None)
            .expect("untimed manual lock cannot time out")
    }

    /// Manual multi-key lock with a timeout. On failure every bucket
    /// acquired so far is released.
    pub fn try_lock(&self, requests: &[LockRequest], timeout: Duration) -> Result<LockSet<'_>> {
        self.acquire(requests, Some(Instant::now() + timeout))
            .ok_or(SpinelError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })
    }

    fn acquire(&self, requests: &[LockRequest], deadline: Option<Instant>) -> Option<LockSet<'_>> {
        // Sort by (bucket, hash) and collapse duplicate buckets, keeping
        // the stronger kind; a fixed order prevents deadlock, one-acquire-
        // per-bucket prevents self-deadlock.
        let mut plan: Vec<(u64, KeyHash, LockKind)> = requests
            .iter()
            .map(|r| (self.bucket_of(r.hash), r.hash, r.kind))
            .collect();
        plan.sort_by(|a, b| (a.0, a.1.control()).cmp(&(b.0, b.1.control())));

        let mut merged: Vec<(u64, LockKind)> = Vec::with_capacity(plan.len());
        for (bucket, _, kind) in plan {
            match merged.last_mut() {
                Some((last, last_kind)) if *last == bucket => {
                    if kind == LockKind::Exclusive {
                        *last_kind = LockKind::Exclusive;
                    }
                }
                _ => merged.push((bucket, kind)),
            }
        }

        let mut held: Vec<(u64, LockKind)> = Vec::with_capacity(merged.len());
        for &(bucket, kind) in &merged {
            let ok = match kind {
                LockKind::Shared => self.latch(bucket).lock_shared(deadline),
                LockKind::Exclusive => self.latch(bucket).lock_exclusive(deadline),
            };
            if !ok {
                for &(bucket, kind) in held.iter().rev() {
                    self.release(bucket, kind);
                }
                return None;
            }
            held.push((bucket, kind));
        }
        Some(LockSet { table: self, held })
    }

    fn release(&self, bucket: u64, kind: LockKind) {
        match kind {
            LockKind::Shared => self.latch(bucket).unlock_shared(),
            LockKind::Exclusive => self.latch(bucket).unlock_exclusive(),
        }
    }
}

/// RAII transient exclusive latch.
pub struct ExclusiveGuard<'a> {
    latch: &'a BucketLatch,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.latch.unlock_exclusive();
    }
}

/// RAII transient shared latch.
pub struct SharedGuard<'a> {
    latch: &'a BucketLatch,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.latch.unlock_shared();
    }
}

/// A held manual lock set. Dropping releases in reverse acquisition
/// order.
pub struct LockSet<'a> {
    table: &'a LockTable,
    held: Vec<(u64, LockKind)>,
}

impl LockSet<'_> {
    /// Upgrades the hold on `key`'s bucket from shared to exclusive.
    /// Returns `Timeout` (keeping the shared hold) if another reader or
    /// writer stays in the way.
    pub fn promote_shared_to_exclusive(
        &mut self,
        hash: KeyHash,
        timeout: Duration,
    ) -> Result<()> {
        let bucket = self.table.bucket_of(hash);
        let slot = self
            .held
            .iter_mut()
            .find(|(b, _)| *b == bucket)
            .ok_or_else(|| SpinelError::Internal {
                message: format!("bucket {} is not part of this lock set", bucket),
            })?;
        match slot.1 {
            LockKind::Exclusive => Ok(()),
            LockKind::Shared => {
                let deadline = Instant::now() + timeout;
                if self.table.latch(bucket).try_promote(Some(deadline)) {
                    slot.1 = LockKind::Exclusive;
                    Ok(())
                } else {
                    Err(SpinelError::Timeout {
                        duration_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Whether this set holds `key`'s bucket at least at `kind`.
    pub fn covers(&self, hash: KeyHash, kind: LockKind) -> bool {
        let bucket = self.table.bucket_of(hash);
        self.held.iter().any(|&(b, held_kind)| {
            b == bucket && (held_kind == LockKind::Exclusive || kind == LockKind::Shared)
        })
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        for &(bucket, kind) in self.held.iter().rev() {
            self.table.release(bucket, kind);
        }
    }
}

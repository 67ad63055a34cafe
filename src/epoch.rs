//! Epoch protection and safe memory reclamation.
//!
//! Every operation enters the epoch before touching log memory or hash
//! buckets and leaves before blocking. Writers that need to reclaim memory
//! (page eviction, threshold shifts) register a drain action against the
//! current version via [`EpochManager::bump_version`]; the action runs
//! exactly once, after every thread that was active at that version has
//! left or advanced past it.
//!
//! The manager keeps a fixed table of cache-line-sized slots. A thread
//! claims a free slot on `enter`, publishes its observed version there,
//! and clears the slot on `leave`. The safe version is the minimum over
//! occupied slots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Maximum number of concurrently protected threads.
const MAX_ACTIVE_THREADS: usize = 128;

/// A reclamation action deferred until a version is safe.
type DrainAction = Box<dyn FnOnce() + Send>;

#[repr(align(64))]
struct EpochSlot {
    /// 0 = free; otherwise the version the occupying thread entered at.
    version: AtomicU64,
}

/// Epoch manager owned by a store instance.
pub struct EpochManager {
    current: AtomicU64,
    slots: Box<[EpochSlot]>,
    drain_list: Mutex<Vec<(u64, DrainAction)>>,
    drain_pending: AtomicUsize,
}

impl EpochManager {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_ACTIVE_THREADS);
        for _ in 0..MAX_ACTIVE_THREADS {
            slots.push(EpochSlot {
                version: AtomicU64::new(0),
            });
        }
        Self {
            current: AtomicU64::new(1),
            slots: slots.into_boxed_slice(),
            drain_list: Mutex::new(Vec::new()),
            drain_pending: AtomicUsize::new(0),
        }
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Publishes the calling thread's presence and returns a guard. Any
    /// page pointer or bucket reference obtained while the guard lives
    /// stays valid until the guard drops.
    pub fn enter(&self) -> EpochGuard<'_> {
        loop {
            let version = self.current.load(Ordering::SeqCst);
            for (idx, slot) in self.slots.iter().enumerate() {
                if slot.version.load(Ordering::Relaxed) != 0 {
                    continue;
                }
                if slot
                    .version
                    .compare_exchange(0, version, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return EpochGuard { epoch: self, slot: idx };
                }
            }
            // Table full: more live guards than slots. Yield and retry.
            std::thread::yield_now();
        }
    }

    /// Advances the version. If an action is supplied it is registered
    /// against the version being left behind and will run once every slot
    /// has moved past it. Returns the new version.
    pub fn bump_version(&self, action: Option<DrainAction>) -> u64 {
        let old = self.current.fetch_add(1, Ordering::SeqCst);
        if let Some(action) = action {
            self.drain_list.lock().push((old, action));
            self.drain_pending.fetch_add(1, Ordering::Release);
        }
        self.try_drain();
        old + 1
    }

    /// Runs every registered action whose version is below the minimum
    /// version of all active threads. Cheap no-op when nothing is queued.
    pub fn try_drain(&self) {
        if self.drain_pending.load(Ordering::Acquire) == 0 {
            return;
        }
        let safe = self.safe_version();
        let ready: Vec<DrainAction> = {
            let mut list = self.drain_list.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < list.len() {
                if list[i].0 < safe {
                    let (_, action) = list.swap_remove(i);
                    ready.push(action);
                } else {
                    i += 1;
                }
            }
            ready
        };
        if !ready.is_empty() {
            self.drain_pending.fetch_sub(ready.len(), Ordering::Release);
            log::trace!("epoch drain: running {} actions (safe < {})", ready.len(), safe);
            for action in ready {
                action();
            }
        }
    }

    /// Blocks until every registered drain action has run. Used on
    /// shutdown and by `flush_and_evict(wait = true)`.
    pub fn drain_blocking(&self) {
        while self.drain_pending.load(Ordering::Acquire) != 0 {
            self.try_drain();
            std::thread::yield_now();
        }
    }

    /// The minimum version any active thread may still be observing.
    fn safe_version(&self) -> u64 {
        let mut safe = u64::MAX;
        for slot in self.slots.iter() {
            let v = slot.version.load(Ordering::SeqCst);
            if v != 0 && v < safe {
                safe = v;
            }
        }
        if safe == u64::MAX {
            self.current.load(Ordering::SeqCst)
        } else {
            safe
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // All guards are gone by now (they borrow the manager), so every
        // queued action is runnable.
        self.drain_blocking();
    }
}

/// RAII protection token. Dropping it leaves the epoch.
pub struct EpochGuard<'a> {
    epoch: &'a EpochManager,
    slot: usize,
}

impl<'a> EpochGuard<'a> {
    /// Re-publishes the thread at the latest version, letting older
    /// versions drain. Long-running operations call this between retries.
    pub fn refresh(&self) {
        let version = self.epoch.current.load(Ordering::SeqCst);
        self.epoch.slots[self.slot]
            .version
            .store(version, Ordering::SeqCst);
        self.epoch.try_drain();
    }

    /// Version this guard currently protects.
    pub fn version(&self) -> u64 {
        self.epoch.slots[self.slot].version.load(Ordering::Relaxed)
    }

    /// Drops protection across a blocking point. The returned token
    /// re-enters on [`SuspendedGuard::resume`].
    pub fn suspend(self) -> SuspendedGuard<'a> {
        let epoch = self.epoch;
        drop(self);
        SuspendedGuard { epoch }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.slots[self.slot].version.store(0, Ordering::SeqCst);
        self.epoch.try_drain();
    }
}

/// Token for a thread that has cooperatively yielded its protection.
pub struct SuspendedGuard<'a> {
    epoch: &'a EpochManager,
}

impl<'a> SuspendedGuard<'a> {
    pub fn resume(self) -> EpochGuard<'a> {
        self.epoch.enter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_enter_leave() {
        let epoch = EpochManager::new();
        let guard = epoch.enter();
        assert!(guard.version() >= 1);
        drop(guard);
    }

    #[test]
    fn test_action_runs_when_no_thread_is_active() {
        let epoch = EpochManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        epoch.bump_version(Some(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        })));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_action_waits_for_active_guard() {
        let epoch = EpochManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let guard = epoch.enter();
        epoch.bump_version(Some(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        })));
        // The guard still protects the old version.
        assert!(!ran.load(Ordering::SeqCst));

        drop(guard);
        epoch.try_drain();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_refresh_releases_old_version() {
        let epoch = EpochManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let guard = epoch.enter();
        epoch.bump_version(Some(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        })));
        assert!(!ran.load(Ordering::SeqCst));

        // Moving this thread to the new version makes the old one safe.
        guard.refresh();
        assert!(ran.load(Ordering::SeqCst));
        drop(guard);
    }

    #[test]
    fn test_suspend_resume() {
        let epoch = EpochManager::new();
        let guard = epoch.enter();
        let suspended = guard.suspend();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        epoch.bump_version(Some(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        })));
        // No protection held across the suspension point.
        assert!(ran.load(Ordering::SeqCst));
        let guard = suspended.resume();
        drop(guard);
    }

    #[test]
    fn test_concurrent_guards() {
        let epoch = Arc::new(EpochManager::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let epoch = epoch.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let guard = epoch.enter();
                    guard.refresh();
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        epoch.drain_blocking();
    }
}

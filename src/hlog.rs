//! The hybrid log: a monotonic logical address space over a circular
//! in-memory page window backed by a storage device.
//!
//! Address regions, separated by monotonically advancing thresholds:
//!
//! - `[begin, head)`: on disk only
//! - `[head, read_only)`: in memory, immutable, flushed or being flushed
//! - `[read_only, tail)`: in memory, mutable, in-place updates permitted
//!
//! Allocation bumps the tail atomically. When an allocation would cross a
//! page boundary, the winning thread seals the remainder of the page with
//! a filler record and opens the next page; a record therefore never
//! straddles pages. Threshold shifts ride the epoch: the *safe* thresholds
//! advance, pages flush, and frames evict only from drain actions, after
//! every thread that could hold a pointer into the affected region has
//! moved on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress, PageGeometry};
use crate::alloc::PageAllocator;
use crate::common::{Result, SpinelError};
use crate::device::{read_blocking, write_blocking, StorageDevice};
use crate::epoch::{EpochGuard, EpochManager};
use crate::record::write_filler;

/// Packed (page, offset) tail pointer. The offset field absorbs transient
/// overshoot past the page size while a boundary crossing is resolved.
struct AtomicPageOffset(AtomicU64);

#[derive(Clone, Copy)]
struct PageOffset {
    page: u32,
    offset: u64,
}

impl AtomicPageOffset {
    const OFFSET_BITS: u32 = 32;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    fn new(page: u32, offset: u32) -> Self {
        Self(AtomicU64::new(Self::pack(page, offset as u64)))
    }

    fn pack(page: u32, offset: u64) -> u64 {
        ((page as u64) << Self::OFFSET_BITS) | offset
    }

    fn unpack(value: u64) -> PageOffset {
        PageOffset {
            page: (value >> Self::OFFSET_BITS) as u32,
            offset: value & Self::OFFSET_MASK,
        }
    }

    fn load(&self) -> PageOffset {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    /// Reserves `size` bytes, returning the pre-increment position.
    fn reserve(&self, size: u32) -> PageOffset {
        Self::unpack(self.0.fetch_add(size as u64, Ordering::AcqRel))
    }

    /// Rewrites the pointer while it still sits on `expected_page`,
    /// discarding any overshoot other threads added. Their reservations
    /// were unusable and they retry.
    fn settle(&self, expected_page: u32, new_page: u32, new_offset: u64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if Self::unpack(current).page != expected_page {
                return;
            }
            match self.0.compare_exchange(
                current,
                Self::pack(new_page, new_offset),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// The hybrid log.
pub struct HybridLog {
    geometry: PageGeometry,
    allocator: PageAllocator,
    device: Arc<dyn StorageDevice>,
    epoch: Arc<EpochManager>,

    begin_address: AtomicAddress,
    head_address: AtomicAddress,
    safe_head_address: AtomicAddress,
    read_only_address: AtomicAddress,
    safe_read_only_address: AtomicAddress,
    flushed_until_address: AtomicAddress,
    tail_page_offset: AtomicPageOffset,

    /// Serializes flush passes; flushed_until advances linearly.
    flush_lock: Mutex<()>,
}

impl HybridLog {
    pub fn new(
        page_size: u32,
        memory_size: u64,
        pool_pages: usize,
        device: Arc<dyn StorageDevice>,
        epoch: Arc<EpochManager>,
    ) -> Result<Arc<Self>> {
        let frames = (memory_size / page_size as u64) as u32;
        if frames < 2 || !frames.is_power_of_two() {
            return Err(SpinelError::InvalidConfig {
                message: "log window must be a power-of-two number of pages, at least two"
                    .to_string(),
            });
        }
        let geometry = PageGeometry::new(page_size, frames);
        let allocator = PageAllocator::new(geometry, device.sector_size() as usize, pool_pages);

        let start = Address::START;
        let log = Arc::new(Self {
            geometry,
            allocator,
            device,
            epoch,
            begin_address: AtomicAddress::new(start),
            head_address: AtomicAddress::new(start),
            safe_head_address: AtomicAddress::new(start),
            read_only_address: AtomicAddress::new(start),
            safe_read_only_address: AtomicAddress::new(start),
            flushed_until_address: AtomicAddress::new(start),
            tail_page_offset: AtomicPageOffset::new(0, start.control() as u32),
            flush_lock: Mutex::new(()),
        });
        log.allocator.allocate_page(0)?;
        Ok(log)
    }

    #[inline]
    pub fn geometry(&self) -> &PageGeometry {
        &self.geometry
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.geometry.page_size()
    }

    pub fn device(&self) -> &Arc<dyn StorageDevice> {
        &self.device
    }

    pub fn epoch(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    // --- thresholds ---

    pub fn begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    pub fn head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    pub fn safe_head_address(&self) -> Address {
        self.safe_head_address.load(Ordering::Acquire)
    }

    pub fn read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only_address.load(Ordering::Acquire)
    }

    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    pub fn tail_address(&self) -> Address {
        let tail = self.tail_page_offset.load();
        let offset = tail.offset.min(self.page_size() as u64);
        Address::from_control(((tail.page as u64) << self.geometry.page_bits()) | offset)
    }

    // --- allocation ---

    /// Reserves space for one record. On success the returned address is
    /// in the mutable region and the backing frame is resident; the caller
    /// writes payload first and publishes the header last.
    ///
    /// Fails with `RegionFull` when the next page's frame is still
    /// occupied by an un-evicted page; the caller should make room (flush
    /// and shift the head) and retry.
    pub fn try_allocate(&self, size: u32, _guard: &EpochGuard<'_>) -> Result<Address> {
        let page_size = self.page_size() as u64;
        if size == 0 || size as u64 > page_size {
            return Err(SpinelError::Internal {
                message: format!("record of {} bytes cannot fit a page", size),
            });
        }

        let mut spins = 0u32;
        loop {
            let old = self.tail_page_offset.reserve(size);
            let new_offset = old.offset + size as u64;

            if new_offset <= page_size {
                return Ok(Address::from_control(
                    ((old.page as u64) << self.geometry.page_bits()) | old.offset,
                ));
            }

            if old.offset <= page_size {
                // This thread crossed the boundary and resolves it.
                if old.offset < page_size {
                    let seal_addr = self
                        .geometry
                        .page_start(old.page as u64)
                        + old.offset;
                    if let Some(ptr) = self.allocator.physical(seal_addr) {
                        write_filler(ptr);
                    }
                }
                let next_page = old.page as u64 + 1;
                if !self.allocator.frame_is_free(next_page) {
                    // Park the tail at the page boundary so a later caller
                    // becomes the crossing winner again.
                    self.tail_page_offset.settle(old.page, old.page, page_size);
                    return Err(SpinelError::RegionFull);
                }
                self.allocator.allocate_page(next_page)?;
                self.tail_page_offset
                    .settle(old.page, next_page as u32, size as u64);
                return Ok(self.geometry.page_start(next_page));
            }

            // Another thread is resolving the crossing; wait for the page
            // to move, giving up after a bounded wait.
            spins += 1;
            if spins > 4096 {
                return Err(SpinelError::RegionFull);
            }
            std::hint::spin_loop();
            if spins % 64 == 0 {
                std::thread::yield_now();
            }
        }
    }

    // --- memory access ---

    /// Immutable view of `len` bytes at `address`. `None` if the frame is
    /// not resident or the range crosses the page end.
    pub fn get_slice<'g>(
        &self,
        address: Address,
        len: usize,
        _guard: &'g EpochGuard<'_>,
    ) -> Option<&'g [u8]> {
        if address < self.safe_head_address() {
            return None;
        }
        let remaining = self.page_size() - self.geometry.offset(address);
        if len > remaining as usize {
            return None;
        }
        let ptr = self.allocator.physical(address)?;
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// View from `address` to the end of its page; what record parsing
    /// walks over.
    pub fn page_tail_slice<'g>(
        &self,
        address: Address,
        guard: &'g EpochGuard<'_>,
    ) -> Option<&'g [u8]> {
        let remaining = self.page_size() - self.geometry.offset(address);
        self.get_slice(address, remaining as usize, guard)
    }

    /// Mutable view of `len` bytes at `address`. Callers must hold the
    /// record's bucket latch exclusively and the address must be in the
    /// mutable region.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut_slice<'g>(
        &self,
        address: Address,
        len: usize,
        _guard: &'g EpochGuard<'_>,
    ) -> Option<&'g mut [u8]> {
        if address < self.safe_head_address() {
            return None;
        }
        let remaining = self.page_size() - self.geometry.offset(address);
        if len > remaining as usize {
            return None;
        }
        let ptr = self.allocator.physical(address)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Raw header pointer for atomic in-place flag updates.
    pub fn header_ptr(&self, address: Address, _guard: &EpochGuard<'_>) -> Option<*mut u8> {
        if address < self.safe_head_address() {
            return None;
        }
        self.allocator.physical(address)
    }

    // --- threshold shifts ---

    /// Raises the read-only boundary. Once the epoch drains, the safe
    /// boundary follows and the newly immutable pages flush to the device.
    pub fn shift_read_only(self: &Arc<Self>, new_read_only: Address) {
        let new_read_only = new_read_only.min(self.tail_address());
        let old = self.read_only_address.advance_to(new_read_only);
        if old >= new_read_only {
            return;
        }
        log::debug!(
            "shifting read-only address {} -> {}",
            old,
            new_read_only
        );
        let log = Arc::clone(self);
        self.epoch.bump_version(Some(Box::new(move || {
            log.safe_read_only_address.advance_to(new_read_only);
            if let Err(e) = log.flush_until(new_read_only) {
                log::warn!("flush to {} failed: {}", new_read_only, e);
            }
        })));
    }

    /// Raises the head boundary, clamped to the flushed prefix. Frames
    /// fully below the new head are evicted once the epoch drains.
    pub fn shift_head(self: &Arc<Self>, new_head: Address) {
        let new_head = new_head
            .min(self.flushed_until_address())
            .min(self.read_only_address());
        let old = self.head_address.advance_to(new_head);
        if old >= new_head {
            return;
        }
        log::debug!("shifting head address {} -> {}", old, new_head);
        let log = Arc::clone(self);
        self.epoch.bump_version(Some(Box::new(move || {
            log.safe_head_address.advance_to(new_head);
            let first = log.geometry.page(old);
            let limit = log.geometry.page(new_head);
            for page in first..limit {
                log.allocator.free_page(page);
            }
        })));
    }

    /// Raises the begin boundary and truncates the on-disk prefix.
    pub fn shift_begin(self: &Arc<Self>, new_begin: Address) {
        let new_begin = new_begin.min(self.head_address());
        let old = self.begin_address.advance_to(new_begin);
        if old >= new_begin {
            return;
        }
        let log = Arc::clone(self);
        self.epoch.bump_version(Some(Box::new(move || {
            match log.device.truncate_until(new_begin.control()) {
                Ok(cut) => log::info!(
                    "advanced begin address {} -> {}, device truncated to {:#x}",
                    old,
                    new_begin,
                    cut
                ),
                Err(e) => log::warn!("device truncation at {} failed: {}", new_begin, e),
            }
        })));
    }

    /// Flushes everything and evicts the whole window. With `wait`, blocks
    /// until `head == tail`. The caller must not hold an epoch guard.
    pub fn flush_and_evict(self: &Arc<Self>, wait: bool) -> Result<()> {
        let tail = self.tail_address();
        self.shift_read_only(tail);
        if wait {
            self.epoch.drain_blocking();
        }
        self.shift_head(self.flushed_until_address());
        if wait {
            self.epoch.drain_blocking();
            if self.head_address() < tail {
                return Err(SpinelError::Internal {
                    message: format!(
                        "flush_and_evict stalled: head {} tail {}",
                        self.head_address(),
                        tail
                    ),
                });
            }
        }
        Ok(())
    }

    /// Writes `[flushed_until, until)` to the device. Runs from drain
    /// actions and from checkpoints; serialized by the flush lock.
    pub fn flush_until(&self, until: Address) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let from = self.flushed_until_address();
        if until <= from {
            return Ok(());
        }
        let sector = self.device.sector_size() as u64;
        let page_size = self.page_size() as u64;

        let mut cursor = from.control() / sector * sector;
        while cursor < until.control() {
            let page = cursor >> self.geometry.page_bits();
            let page_end = (page + 1) * page_size;
            let chunk_end = until.control().min(page_end);
            // Round the chunk end up to a sector; the slack is resident
            // page memory and rewrites identical or unpublished bytes.
            let write_end = chunk_end.div_ceil(sector) * sector;
            let base = self
                .allocator
                .physical(Address::from_control(cursor))
                .ok_or_else(|| SpinelError::Internal {
                    message: format!("flush source page {} not resident", page),
                })?;
            let bytes =
                unsafe { std::slice::from_raw_parts(base, (write_end - cursor) as usize) };
            write_blocking(self.device.as_ref(), cursor, bytes)?;
            cursor = page_end.min(write_end.max(chunk_end));
            if cursor % page_size == 0 {
                log::trace!("flushed through page {}", page);
            }
        }

        self.device.flush()?;
        self.flushed_until_address.advance_to(until);
        log::debug!("flushed log to {}", until);
        Ok(())
    }

    /// Restores thresholds after recovery: everything up to `tail` lives
    /// on the device, nothing is resident except the partial tail page,
    /// which is re-read from disk so later flushes do not clobber it.
    pub fn restore(&self, begin: Address, tail: Address) -> Result<()> {
        self.begin_address.store(begin, Ordering::Release);
        self.head_address.store(tail, Ordering::Release);
        self.safe_head_address.store(tail, Ordering::Release);
        self.read_only_address.store(tail, Ordering::Release);
        self.safe_read_only_address.store(tail, Ordering::Release);
        self.flushed_until_address.store(tail, Ordering::Release);

        let tail_page = self.geometry.page(tail);
        let tail_offset = self.geometry.offset(tail);
        self.allocator.free_page(0);
        self.allocator.allocate_page(tail_page)?;
        if tail_offset > 0 {
            let page_start = self.geometry.page_start(tail_page);
            let bytes = read_blocking(self.device.as_ref(), page_start.control(), tail_offset)?;
            let base = self
                .allocator
                .physical(page_start)
                .ok_or_else(|| SpinelError::Internal {
                    message: "tail page not resident after restore".to_string(),
                })?;
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, bytes.len()) };
        }
        self.tail_page_offset.0.store(
            AtomicPageOffset::pack(tail_page as u32, tail_offset as u64),
            Ordering::Release,
        );
        log::info!("log restored: begin {}, tail {}", begin, tail);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::record::{required_size, write_record, RecordView};

    fn test_log() -> (Arc<HybridLog>, Arc<EpochManager>, Arc<dyn StorageDevice>) {
        let epoch = Arc::new(EpochManager::new());
        let device: Arc<dyn StorageDevice> = Arc::new(MemoryDevice::default());
        let log = HybridLog::new(1024, 4 * 1024, 2, device.clone(), epoch.clone()).unwrap();
        (log, epoch, device)
    }

    fn append(log: &Arc<HybridLog>, key: &[u8], value: &[u8]) -> Address {
        let guard = log.epoch().enter();
        let size = required_size(key.len(), value.len(), false);
        let addr = log.try_allocate(size, &guard).unwrap();
        let buf = log.get_mut_slice(addr, size as usize, &guard).unwrap();
        write_record(buf, 0, Address::NULL, 1, key, None, value);
        addr
    }

    #[test]
    fn test_initial_addresses() {
        let (log, _, _) = test_log();
        assert_eq!(log.begin_address(), Address::START);
        assert_eq!(log.head_address(), Address::START);
        assert_eq!(log.read_only_address(), Address::START);
        assert_eq!(log.tail_address(), Address::START);
    }

    #[test]
    fn test_allocation_is_monotonic() {
        let (log, epoch, _) = test_log();
        let guard = epoch.enter();
        let a = log.try_allocate(64, &guard).unwrap();
        let b = log.try_allocate(128, &guard).unwrap();
        assert!(b > a);
        assert_eq!(b - a, 64);
        assert_eq!(log.tail_address() - b, 128);
    }

    #[test]
    fn test_page_crossing_inserts_filler() {
        let (log, epoch, _) = test_log();
        let guard = epoch.enter();
        // Leave 24 bytes of slack at the end of page 0.
        let first = log.try_allocate(1024 - 8 - 24, &guard).unwrap();
        assert_eq!(log.geometry().page(first), 0);

        let second = log.try_allocate(64, &guard).unwrap();
        assert_eq!(log.geometry().page(second), 1);
        assert_eq!(log.geometry().offset(second), 0);

        // The slack was sealed with a filler record.
        let seal = Address::from_control(1024 - 24);
        let slice = log.page_tail_slice(seal, &guard).unwrap();
        let view = RecordView::parse(slice).unwrap().unwrap();
        assert!(view.info.filler());
    }

    #[test]
    fn test_record_never_straddles_pages() {
        let (log, epoch, _) = test_log();
        let guard = epoch.enter();
        for _ in 0..20 {
            let addr = log.try_allocate(104, &guard).unwrap();
            let geo = log.geometry();
            assert_eq!(geo.page(addr), geo.page(addr + 103));
        }
    }

    #[test]
    fn test_region_full_without_eviction() {
        let (log, epoch, _) = test_log();
        let guard = epoch.enter();
        // Window is 4 frames of 1KB; fill them all.
        let mut last = Err(SpinelError::RegionFull);
        for _ in 0..5 {
            last = log.try_allocate(1000, &guard);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(SpinelError::RegionFull)));
    }

    #[test]
    fn test_flush_writes_records_to_device() {
        let (log, _, device) = test_log();
        let addr = append(&log, b"k1", b"flushed-value");
        log.flush_and_evict(true).unwrap();
        assert_eq!(log.head_address(), log.tail_address());

        let bytes = read_blocking(device.as_ref(), addr.control(), 128).unwrap();
        let view = RecordView::parse(&bytes).unwrap().unwrap();
        assert_eq!(view.key, b"k1");
        assert_eq!(view.value, b"flushed-value");
    }

    #[test]
    fn test_eviction_frees_frames_after_drain() {
        let (log, epoch, _) = test_log();
        let addr = append(&log, b"k", b"v");
        log.flush_and_evict(true).unwrap();

        let guard = epoch.enter();
        assert!(log.get_slice(addr, 16, &guard).is_none());
    }

    #[test]
    fn test_allocation_succeeds_after_making_room() {
        let (log, epoch, _) = test_log();
        {
            let guard = epoch.enter();
            loop {
                if log.try_allocate(1000, &guard).is_err() {
                    break;
                }
            }
        }
        log.flush_and_evict(true).unwrap();
        let guard = epoch.enter();
        log.try_allocate(1000, &guard).unwrap();
    }

    #[test]
    fn test_thresholds_never_decrease() {
        let (log, _, _) = test_log();
        append(&log, b"a", b"1");
        let ro_before = log.read_only_address();
        log.shift_read_only(Address::START);
        assert!(log.read_only_address() >= ro_before);

        log.flush_and_evict(true).unwrap();
        let head = log.head_address();
        log.shift_head(Address::START);
        assert_eq!(log.head_address(), head);
    }

    #[test]
    fn test_shift_begin_truncates_device() {
        let (log, _, device) = test_log();
        for i in 0..10 {
            append(&log, format!("key{}", i).as_bytes(), &[0u8; 64]);
        }
        let tail = log.tail_address();
        log.flush_and_evict(true).unwrap();
        log.shift_begin(tail);
        log.epoch().drain_blocking();
        assert_eq!(log.begin_address(), tail);
        assert!(device.truncated_until() <= tail.control());
    }

    #[test]
    fn test_restore_rehydrates_tail_page() {
        let (log, epoch, device) = test_log();
        let addr = append(&log, b"key", b"survivor");
        let tail = log.tail_address();
        log.flush_and_evict(true).unwrap();

        let fresh_epoch = Arc::new(EpochManager::new());
        let log2 = HybridLog::new(1024, 4 * 1024, 2, device, fresh_epoch.clone()).unwrap();
        log2.restore(Address::START, tail).unwrap();
        assert_eq!(log2.tail_address(), tail);

        // The partial tail page is resident again with its old contents.
        let guard = fresh_epoch.enter();
        let slice = log2.page_tail_slice(addr, &guard);
        // addr is below head after restore, so direct access is refused...
        assert!(slice.is_none());
        drop(guard);
        drop(epoch);

        // ...but new appends continue from the restored tail.
        let next = append(&log2, b"key2", b"after-restore");
        assert!(next >= tail);
        let guard = log2.epoch().enter();
        let slice = log2.page_tail_slice(next, &guard).unwrap();
        let view = RecordView::parse(slice).unwrap().unwrap();
        assert_eq!(view.key, b"key2");
    }
}

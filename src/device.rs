//! Storage device abstraction.
//!
//! A device is a segmented byte store addressed by log offset. The log and
//! AOF drive it through sector-aligned asynchronous reads and writes that
//! report through completion callbacks; `truncate_until` drops the prefix
//! below an offset. The implementations here complete their I/O before
//! invoking the callback, which satisfies the same contract, and callers
//! that need to block use the `write_blocking`/`read_blocking` adapters.
//!
//! Callers must not issue overlapping writes to the same region; the
//! devices do not serialize them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Condvar, Mutex};

use crate::common::{Result, SpinelError};

/// Completion callback for a write.
pub type WriteCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// Completion callback for a read; receives the bytes on success.
pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

/// A segmented byte store with sector-aligned asynchronous I/O.
pub trait StorageDevice: Send + Sync {
    /// Alignment unit for offsets and lengths of page I/O.
    fn sector_size(&self) -> u32 {
        512
    }

    /// Size of one on-disk segment.
    fn segment_size(&self) -> u64;

    /// One past the highest offset ever written.
    fn size(&self) -> u64;

    /// Offset below which the prefix has been truncated away.
    fn truncated_until(&self) -> u64;

    fn write_async(&self, offset: u64, data: &[u8], done: WriteCompletion);

    fn read_async(&self, offset: u64, len: u32, done: ReadCompletion);

    /// Commits buffered writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// Drops the prefix below `offset` (rounded down to the device's
    /// natural granularity). Returns the new truncation point.
    fn truncate_until(&self, offset: u64) -> Result<u64>;
}

/// Blocks on a `write_async` call.
pub fn write_blocking(device: &dyn StorageDevice, offset: u64, data: &[u8]) -> Result<()> {
    let latch = Arc::new(IoLatch::new());
    let signal = latch.clone();
    device.write_async(offset, data, Box::new(move |result| signal.complete(result)));
    latch.wait()
}

/// Blocks on a `read_async` call.
pub fn read_blocking(device: &dyn StorageDevice, offset: u64, len: u32) -> Result<Vec<u8>> {
    let latch = Arc::new(IoLatch::new());
    let signal = latch.clone();
    device.read_async(offset, len, Box::new(move |result| signal.complete(result)));
    latch.wait()
}

/// One-shot completion latch bridging callback-style I/O to blocking calls.
pub struct IoLatch<T> {
    slot: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> IoLatch<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn complete(&self, result: Result<T>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cv.notify_all();
    }

    pub fn wait(&self) -> Result<T> {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.cv.wait(&mut slot);
        }
        slot.take().unwrap()
    }
}

impl<T> Default for IoLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Segmented file device
// ---------------------------------------------------------------------------

/// Directory of fixed-size segment files. Offsets map linearly onto
/// segments; truncation deletes whole segment files below the cut.
pub struct SegmentedFileDevice {
    dir: PathBuf,
    base_name: String,
    segment_size: u64,
    sector_size: u32,
    segments: Mutex<HashMap<u64, File>>,
    end: AtomicU64,
    begin: AtomicU64,
}

impl SegmentedFileDevice {
    pub fn new<P: AsRef<Path>>(
        dir: P,
        base_name: &str,
        segment_size: u64,
        sector_size: u32,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let device = Self {
            dir,
            base_name: base_name.to_string(),
            segment_size,
            sector_size,
            segments: Mutex::new(HashMap::new()),
            end: AtomicU64::new(0),
            begin: AtomicU64::new(0),
        };
        device.scan_existing()?;
        Ok(device)
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base_name, segment))
    }

    /// Picks up segments left by a previous run so `size`/`truncated_until`
    /// reflect on-disk state after restart.
    fn scan_existing(&self) -> Result<()> {
        let mut min_seg: Option<u64> = None;
        let mut max_end: u64 = 0;
        let prefix = format!("{}.", self.base_name);
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(seg) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
                let len = entry.metadata()?.len();
                min_seg = Some(min_seg.map_or(seg, |m: u64| m.min(seg)));
                max_end = max_end.max(seg * self.segment_size + len);
            }
        }
        if let Some(seg) = min_seg {
            self.begin.store(seg * self.segment_size, Ordering::Release);
            self.end.store(max_end, Ordering::Release);
        }
        Ok(())
    }

    fn with_segment<R>(&self, segment: u64, f: impl FnOnce(&mut File) -> std::io::Result<R>) -> Result<R> {
        let mut segments = self.segments.lock();
        if !segments.contains_key(&segment) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.segment_path(segment))?;
            segments.insert(segment, file);
        }
        let file = segments.get_mut(&segment).unwrap();
        Ok(f(file)?)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut offset = offset;
        let mut data = data;
        while !data.is_empty() {
            let segment = offset / self.segment_size;
            let within = offset % self.segment_size;
            let chunk = data.len().min((self.segment_size - within) as usize);
            self.with_segment(segment, |file| {
                file.seek(SeekFrom::Start(within))?;
                file.write_all(&data[..chunk])
            })?;
            offset += chunk as u64;
            data = &data[chunk..];
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if offset < self.begin.load(Ordering::Acquire) {
            return Err(SpinelError::Storage {
                message: format!("read at {:#x} is below the truncation point", offset),
            });
        }
        let mut out = vec![0u8; len as usize];
        let mut offset = offset;
        let mut filled = 0usize;
        while filled < out.len() {
            let segment = offset / self.segment_size;
            let within = offset % self.segment_size;
            let chunk = (out.len() - filled).min((self.segment_size - within) as usize);
            let read = self.with_segment(segment, |file| {
                file.seek(SeekFrom::Start(within))?;
                file.read(&mut out[filled..filled + chunk])
            })?;
            if read == 0 {
                // Reading past the written end yields zeros, like a sparse
                // region of a preallocated log file.
                break;
            }
            filled += read;
            offset += read as u64;
        }
        Ok(out)
    }
}

impl StorageDevice for SegmentedFileDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn size(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    fn truncated_until(&self) -> u64 {
        self.begin.load(Ordering::Acquire)
    }

    fn write_async(&self, offset: u64, data: &[u8], done: WriteCompletion) {
        let result = self.write_at(offset, data);
        if result.is_ok() {
            self.end.fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        }
        done(result);
    }

    fn read_async(&self, offset: u64, len: u32, done: ReadCompletion) {
        done(self.read_at(offset, len));
    }

    fn flush(&self) -> Result<()> {
        let segments = self.segments.lock();
        for file in segments.values() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn truncate_until(&self, offset: u64) -> Result<u64> {
        let cut_segment = offset / self.segment_size;
        let new_begin = cut_segment * self.segment_size;
        let old_begin = self.begin.fetch_max(new_begin, Ordering::AcqRel);
        if new_begin <= old_begin {
            return Ok(old_begin.max(new_begin));
        }
        let mut segments = self.segments.lock();
        for segment in (old_begin / self.segment_size)..cut_segment {
            segments.remove(&segment);
            let path = self.segment_path(segment);
            if path.exists() {
                std::fs::remove_file(&path)?;
                log::debug!("truncated log segment {}", path.display());
            }
        }
        Ok(new_begin)
    }
}

// ---------------------------------------------------------------------------
// Memory-mapped single-file device
// ---------------------------------------------------------------------------

struct MmapInner {
    file: File,
    mmap: Option<MmapMut>,
    size: u64,
    dirty: bool,
}

impl MmapInner {
    fn remap(&mut self, new_size: u64) -> Result<()> {
        if new_size != self.size {
            self.mmap = None;
            self.file.set_len(new_size)?;
            self.size = new_size;
        }
        if self.size > 0 && self.mmap.is_none() {
            let mmap = unsafe { MmapOptions::new().len(self.size as usize).map_mut(&self.file)? };
            self.mmap = Some(mmap);
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, offset: u64, len: usize) -> Result<()> {
        const GROWTH_CHUNK: u64 = 64 * 1024 * 1024;
        let required = offset + len as u64;
        if required > self.size {
            let new_size = required.div_ceil(GROWTH_CHUNK) * GROWTH_CHUNK;
            self.remap(new_size)?;
        } else if self.mmap.is_none() && self.size > 0 {
            self.remap(self.size)?;
        }
        Ok(())
    }
}

/// Single memory-mapped log file. Truncation only moves the logical begin
/// offset; the file is not shrunk from the front.
pub struct MmapLogDevice {
    inner: Mutex<MmapInner>,
    sector_size: u32,
    end: AtomicU64,
    begin: AtomicU64,
}

impl MmapLogDevice {
    pub fn new<P: AsRef<Path>>(path: P, sector_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        let mut inner = MmapInner {
            file,
            mmap: None,
            size,
            dirty: false,
        };
        if size > 0 {
            inner.remap(size)?;
        }
        Ok(Self {
            inner: Mutex::new(inner),
            sector_size,
            end: AtomicU64::new(size),
            begin: AtomicU64::new(0),
        })
    }
}

impl StorageDevice for MmapLogDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn segment_size(&self) -> u64 {
        u64::MAX
    }

    fn size(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    fn truncated_until(&self) -> u64 {
        self.begin.load(Ordering::Acquire)
    }

    fn write_async(&self, offset: u64, data: &[u8], done: WriteCompletion) {
        let result = (|| {
            let mut inner = self.inner.lock();
            inner.ensure_capacity(offset, data.len())?;
            let mmap = inner.mmap.as_mut().ok_or_else(|| SpinelError::Storage {
                message: "memory map unavailable".to_string(),
            })?;
            let start = offset as usize;
            mmap[start..start + data.len()].copy_from_slice(data);
            inner.dirty = true;
            Ok(())
        })();
        if result.is_ok() {
            self.end.fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        }
        done(result);
    }

    fn read_async(&self, offset: u64, len: u32, done: ReadCompletion) {
        let result = (|| {
            if offset < self.begin.load(Ordering::Acquire) {
                return Err(SpinelError::Storage {
                    message: format!("read at {:#x} is below the truncation point", offset),
                });
            }
            let inner = self.inner.lock();
            let mut out = vec![0u8; len as usize];
            if let Some(mmap) = inner.mmap.as_ref() {
                let start = (offset as usize).min(mmap.len());
                let end = (start + len as usize).min(mmap.len());
                out[..end - start].copy_from_slice(&mmap[start..end]);
            }
            Ok(out)
        })();
        done(result);
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            if let Some(mmap) = inner.mmap.as_ref() {
                mmap.flush()?;
            }
            inner.file.sync_all()?;
            inner.dirty = false;
        }
        Ok(())
    }

    fn truncate_until(&self, offset: u64) -> Result<u64> {
        // Front truncation of an mmap'd file would require hole punching;
        // the begin marker alone keeps reads honest.
        Ok(self.begin.fetch_max(offset, Ordering::AcqRel).max(offset))
    }
}

impl Drop for MmapLogDevice {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

// ---------------------------------------------------------------------------
// In-memory device
// ---------------------------------------------------------------------------

struct MemInner {
    begin: u64,
    data: Vec<u8>,
}

/// Fully in-memory device, used for main-memory AOF replication and tests.
/// Truncation really releases the prefix.
pub struct MemoryDevice {
    inner: Mutex<MemInner>,
    sector_size: u32,
}

impl MemoryDevice {
    pub fn new(sector_size: u32) -> Self {
        Self {
            inner: Mutex::new(MemInner {
                begin: 0,
                data: Vec::new(),
            }),
            sector_size,
        }
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new(512)
    }
}

impl StorageDevice for MemoryDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn segment_size(&self) -> u64 {
        u64::MAX
    }

    fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.begin + inner.data.len() as u64
    }

    fn truncated_until(&self) -> u64 {
        self.inner.lock().begin
    }

    fn write_async(&self, offset: u64, data: &[u8], done: WriteCompletion) {
        let result = (|| {
            let mut inner = self.inner.lock();
            if offset < inner.begin {
                return Err(SpinelError::Storage {
                    message: format!("write at {:#x} is below the truncation point", offset),
                });
            }
            let start = (offset - inner.begin) as usize;
            let end = start + data.len();
            if inner.data.len() < end {
                inner.data.resize(end, 0);
            }
            inner.data[start..end].copy_from_slice(data);
            Ok(())
        })();
        done(result);
    }

    fn read_async(&self, offset: u64, len: u32, done: ReadCompletion) {
        let result = (|| {
            let inner = self.inner.lock();
            if offset < inner.begin {
                return Err(SpinelError::Storage {
                    message: format!("read at {:#x} is below the truncation point", offset),
                });
            }
            let start = ((offset - inner.begin) as usize).min(inner.data.len());
            let end = (start + len as usize).min(inner.data.len());
            let mut out = vec![0u8; len as usize];
            out[..end - start].copy_from_slice(&inner.data[start..end]);
            Ok(out)
        })();
        done(result);
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate_until(&self, offset: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        if offset <= inner.begin {
            return Ok(inner.begin);
        }
        let drop_len = ((offset - inner.begin) as usize).min(inner.data.len());
        inner.data.drain(..drop_len);
        inner.begin = offset;
        Ok(offset)
    }
}

/// Device that discards writes and reads zeros. Stands in where durability
/// is disabled outright.
pub struct NullDevice;

impl StorageDevice for NullDevice {
    fn segment_size(&self) -> u64 {
        u64::MAX
    }

    fn size(&self) -> u64 {
        0
    }

    fn truncated_until(&self) -> u64 {
        0
    }

    fn write_async(&self, _offset: u64, _data: &[u8], done: WriteCompletion) {
        done(Ok(()));
    }

    fn read_async(&self, _offset: u64, len: u32, done: ReadCompletion) {
        done(Ok(vec![0u8; len as usize]));
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate_until(&self, offset: u64) -> Result<u64> {
        Ok(offset)
    }
}

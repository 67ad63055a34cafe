//! On-log record layout.
//!
//! Every record starts with a 16-byte header: one word packing the flag
//! byte and the 48-bit previous-address-in-chain, and one word holding the
//! writer's CAS tag (checkpoint version). The header is followed by a
//! varint-length-prefixed key, a varint value length, an optional 8-byte
//! expiration prefix, and the value bytes. Record sizes are rounded up to
//! [`RECORD_ALIGN`], and a record never straddles a page: the tail of a
//! page is sealed with a filler record instead.
//!
//! Wire layout of the first header word (little-endian):
//! byte 0 = flags, byte 1 = reserved, bytes 2..8 = previous address.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::common::{Result, SpinelError, RECORD_ALIGN};

/// Size of the packed record header in bytes.
pub const RECORD_HEADER_SIZE: u32 = 16;

/// Flag bits of the header's flag byte.
pub mod flags {
    /// The record deletes its key.
    pub const TOMBSTONE: u8 = 1 << 0;
    /// The record has been superseded; chain walks and scans skip it.
    pub const SEALED: u8 = 1 << 1;
    /// Pad-out record covering the tail of a page.
    pub const FILLER: u8 = 1 << 2;
    /// The record was mutated in place after being written.
    pub const MODIFIED: u8 = 1 << 3;
    /// Written after the current checkpoint's version bump.
    pub const IN_NEW_VERSION: u8 = 1 << 4;
    /// The full key is stored inline. Set on every non-filler record, which
    /// also guarantees a written header word is never zero.
    pub const HAS_FULL_KEY: u8 = 1 << 5;
    /// The value bytes are preceded by an 8-byte expiration timestamp.
    pub const HAS_EXPIRATION: u8 = 1 << 6;
}

/// First word of the record header: flag byte plus 48-bit previous address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct RecordInfo(u64);

impl RecordInfo {
    const PREVIOUS_SHIFT: u32 = 16;

    pub fn new(flags: u8, previous: Address) -> Self {
        RecordInfo((previous.control() << Self::PREVIOUS_SHIFT) | flags as u64)
    }

    #[inline]
    pub fn from_control(control: u64) -> Self {
        RecordInfo(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::from_control(self.0 >> Self::PREVIOUS_SHIFT)
    }

    #[inline]
    pub fn is_unwritten(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn tombstone(&self) -> bool {
        self.flags() & flags::TOMBSTONE != 0
    }

    #[inline]
    pub fn sealed(&self) -> bool {
        self.flags() & flags::SEALED != 0
    }

    #[inline]
    pub fn filler(&self) -> bool {
        self.flags() & flags::FILLER != 0
    }

    #[inline]
    pub fn modified(&self) -> bool {
        self.flags() & flags::MODIFIED != 0
    }

    #[inline]
    pub fn in_new_version(&self) -> bool {
        self.flags() & flags::IN_NEW_VERSION != 0
    }

    #[inline]
    pub fn has_expiration(&self) -> bool {
        self.flags() & flags::HAS_EXPIRATION != 0
    }

    pub fn with_flag(self, flag: u8) -> Self {
        RecordInfo(self.0 | flag as u64)
    }
}

/// Loads a record's first header word with acquire ordering.
///
/// # Safety
/// `ptr` must point at an 8-byte-aligned, live record header.
pub unsafe fn load_info(ptr: *const u8) -> RecordInfo {
    let word = unsafe { &*(ptr as *const AtomicU64) };
    RecordInfo::from_control(word.load(Ordering::Acquire))
}

/// Stores a record's first header word with release ordering. Publishing
/// the header word after the payload is what makes a freshly allocated
/// record observable.
///
/// # Safety
/// Same aliasing requirements as [`load_info`].
pub unsafe fn store_info(ptr: *mut u8, info: RecordInfo) {
    let word = unsafe { &*(ptr as *const AtomicU64) };
    word.store(info.control(), Ordering::Release);
}

/// Atomically ors `flag` into a record's flag byte. Used for in-place
/// tombstoning, sealing a CAS-defeated record, and the modified bit.
///
/// # Safety
/// Same aliasing requirements as [`load_info`].
pub unsafe fn set_flag(ptr: *mut u8, flag: u8) {
    let word = unsafe { &*(ptr as *const AtomicU64) };
    word.fetch_or(flag as u64, Ordering::AcqRel);
}

/// Loads the CAS-tag word of a record header.
///
/// # Safety
/// Same aliasing requirements as [`load_info`].
pub unsafe fn load_tag(ptr: *const u8) -> u64 {
    let word = unsafe { &*(ptr.add(8) as *const AtomicU64) };
    word.load(Ordering::Acquire)
}

fn varint_len(mut value: u32) -> u32 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn write_varint(buf: &mut [u8], mut value: u32) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8 & 0x7f) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

fn read_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 32 {
            return None;
        }
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

fn align_up(size: u32) -> u32 {
    (size + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// Total aligned on-log size of a record with the given key and value.
pub fn required_size(key_len: usize, value_len: usize, has_expiration: bool) -> u32 {
    let mut size = RECORD_HEADER_SIZE
        + varint_len(key_len as u32)
        + key_len as u32
        + varint_len(value_len as u32)
        + value_len as u32;
    if has_expiration {
        size += 8;
    }
    align_up(size)
}

/// Writes a complete record into `buf` (which must be `required_size`
/// bytes, 8-byte aligned, and zeroed). The payload and tag are written
/// first; the flag/previous word is release-stored last so concurrent
/// readers either see the whole record or an unwritten slot.
pub fn write_record(
    buf: &mut [u8],
    flag_bits: u8,
    previous: Address,
    tag: u64,
    key: &[u8],
    expiration: Option<u64>,
    value: &[u8],
) {
    let mut flag_bits = flag_bits | flags::HAS_FULL_KEY;
    if expiration.is_some() {
        flag_bits |= flags::HAS_EXPIRATION;
    }

    let mut pos = RECORD_HEADER_SIZE as usize;
    pos += write_varint(&mut buf[pos..], key.len() as u32);
    buf[pos..pos + key.len()].copy_from_slice(key);
    pos += key.len();
    pos += write_varint(&mut buf[pos..], value.len() as u32);
    if let Some(expires_at) = expiration {
        buf[pos..pos + 8].copy_from_slice(&expires_at.to_le_bytes());
        pos += 8;
    }
    buf[pos..pos + value.len()].copy_from_slice(value);

    buf[8..16].copy_from_slice(&tag.to_le_bytes());
    unsafe { store_info(buf.as_mut_ptr(), RecordInfo::new(flag_bits, previous)) };
}

/// Seals the tail of a page with a filler record so the next record starts
/// on a fresh page.
pub fn write_filler(ptr: *mut u8) {
    unsafe { store_info(ptr, RecordInfo::new(flags::FILLER, Address::NULL)) };
}

/// A decoded view over a record in a log page.
#[derive(Debug)]
pub struct RecordView<'a> {
    pub info: RecordInfo,
    pub tag: u64,
    pub key: &'a [u8],
    pub expiration: Option<u64>,
    pub value: &'a [u8],
    /// Offset of the value bytes from the record start.
    pub value_offset: u32,
    /// Aligned total record size.
    pub len: u32,
}

impl<'a> RecordView<'a> {
    /// Parses a record starting at `buf[0]`. `buf` extends at most to the
    /// end of the containing page. Returns `None` for unwritten space; a
    /// filler record parses to a key-less view with `info.filler()` set.
    pub fn parse(buf: &'a [u8]) -> Result<Option<RecordView<'a>>> {
        if buf.len() < RECORD_HEADER_SIZE as usize {
            return Ok(None);
        }
        let info = unsafe { load_info(buf.as_ptr()) };
        if info.is_unwritten() {
            return Ok(None);
        }
        if info.filler() {
            return Ok(Some(RecordView {
                info,
                tag: 0,
                key: &[],
                expiration: None,
                value: &[],
                value_offset: RECORD_HEADER_SIZE,
                len: RECORD_HEADER_SIZE,
            }));
        }
        let tag = unsafe { load_tag(buf.as_ptr()) };
        let mut pos = RECORD_HEADER_SIZE as usize;
        let (key_len, n) = read_varint(&buf[pos..]).ok_or_else(|| truncated(buf.len()))?;
        pos += n;
        let key = buf
            .get(pos..pos + key_len as usize)
            .ok_or_else(|| truncated(buf.len()))?;
        pos += key_len as usize;
        let (value_len, n) = read_varint(&buf[pos..]).ok_or_else(|| truncated(buf.len()))?;
        pos += n;
        let expiration = if info.has_expiration() {
            let bytes = buf
                .get(pos..pos + 8)
                .ok_or_else(|| truncated(buf.len()))?;
            pos += 8;
            Some(u64::from_le_bytes(bytes.try_into().unwrap()))
        } else {
            None
        };
        let value_offset = pos as u32;
        let value = buf
            .get(pos..pos + value_len as usize)
            .ok_or_else(|| truncated(buf.len()))?;
        pos += value_len as usize;

        Ok(Some(RecordView {
            info,
            tag,
            key,
            expiration,
            value,
            value_offset,
            len: align_up(pos as u32),
        }))
    }

    /// Whether the record is dead for readers at time `now_ms`.
    pub fn is_dead(&self, now_ms: u64) -> bool {
        if self.info.tombstone() || self.info.sealed() {
            return true;
        }
        match self.expiration {
            Some(expires_at) => expires_at <= now_ms,
            None => false,
        }
    }
}

fn truncated(len: usize) -> SpinelError {
    SpinelError::Corruption {
        message: format!("record extends past its page ({} bytes available)", len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_buf(key: &[u8], value: &[u8], expiration: Option<u64>) -> Vec<u8> {
        let size = required_size(key.len(), value.len(), expiration.is_some());
        let mut buf = vec![0u8; size as usize];
        write_record(
            &mut buf,
            0,
            Address::from_control(0x1234),
            7,
            key,
            expiration,
            value,
        );
        buf
    }

    #[test]
    fn test_roundtrip() {
        let buf = record_buf(b"key-1", b"value-payload", None);
        let view = RecordView::parse(&buf).unwrap().unwrap();
        assert_eq!(view.key, b"key-1");
        assert_eq!(view.value, b"value-payload");
        assert_eq!(view.tag, 7);
        assert_eq!(view.info.previous_address().control(), 0x1234);
        assert_eq!(view.len as usize, buf.len());
        assert!(view.expiration.is_none());
        assert!(!view.is_dead(0));
    }

    #[test]
    fn test_expiration_prefix() {
        let buf = record_buf(b"k", b"v", Some(5000));
        let view = RecordView::parse(&buf).unwrap().unwrap();
        assert_eq!(view.expiration, Some(5000));
        assert!(!view.is_dead(4999));
        assert!(view.is_dead(5000));
    }

    #[test]
    fn test_unwritten_space_parses_to_none() {
        let buf = vec![0u8; 64];
        assert!(RecordView::parse(&buf).unwrap().is_none());
    }

    #[test]
    fn test_filler() {
        let mut buf = vec![0u8; 32];
        write_filler(buf.as_mut_ptr());
        let view = RecordView::parse(&buf).unwrap().unwrap();
        assert!(view.info.filler());
        assert_eq!(view.len, RECORD_HEADER_SIZE);
    }

    #[test]
    fn test_header_word_is_never_zero_for_written_records() {
        let buf = record_buf(b"", b"", None);
        let info = unsafe { load_info(buf.as_ptr()) };
        assert!(!info.is_unwritten());
        assert_eq!(info.flags(), flags::HAS_FULL_KEY);
    }

    #[test]
    fn test_required_size_is_aligned() {
        for (k, v) in [(0usize, 0usize), (1, 1), (5, 800), (31, 64)] {
            let size = required_size(k, v, false);
            assert_eq!(size % RECORD_ALIGN, 0);
            assert!(size >= RECORD_HEADER_SIZE);
        }
    }

    #[test]
    fn test_varint_boundaries() {
        let mut buf = [0u8; 5];
        for value in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            let n = write_varint(&mut buf, value);
            let (decoded, consumed) = read_varint(&buf[..n]).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let buf = record_buf(b"key-1", b"a-long-enough-value", None);
        let cut = &buf[..buf.len() - 8];
        assert!(RecordView::parse(cut).is_err());
    }
}

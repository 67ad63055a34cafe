//! Logical addresses into the hybrid log.
//!
//! A logical address is a monotonically increasing 64-bit position in the
//! record log. The low bits are an offset within a page and the high bits
//! a page index; the split is configurable per store, so page math lives
//! in [`PageGeometry`] rather than on the address itself. Of the 64 bits,
//! 48 are usable by addresses; the upper 16 are reserved for the hash
//! index's tag and control bits.

use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::RECORD_ALIGN;

/// A logical address in the record log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    /// Usable address bits. The remaining 16 bits of a packed word belong
    /// to the hash index.
    pub const BITS: u32 = 48;
    pub const MAX: Address = Address((1 << Self::BITS) - 1);

    /// The chain terminator. No record is ever stored at address zero: the
    /// log begins at [`Address::START`].
    pub const NULL: Address = Address(0);

    /// First allocatable position. Keeping the first record off address 0
    /// preserves `NULL` as an unambiguous sentinel.
    pub const START: Address = Address(RECORD_ALIGN as u64);

    pub fn from_control(control: u64) -> Self {
        debug_assert!(
            control >> Self::BITS == 0,
            "address control word has reserved bits set: {:#x}",
            control
        );
        Address(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Address {
    fn from(control: u64) -> Self {
        Address::from_control(control)
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl Add<u64> for Address {
    type Output = Self;
    fn add(self, delta: u64) -> Self::Output {
        let control = self.0 + delta;
        debug_assert!(control >> Self::BITS == 0, "address overflow: {:#x}", control);
        Address(control)
    }
}

impl AddAssign<u64> for Address {
    fn add_assign(&mut self, delta: u64) {
        *self = *self + delta;
    }
}

impl Sub for Address {
    type Output = u64;
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Page/offset split for a particular page size, plus the mapping from log
/// pages to in-memory frames.
#[derive(Debug, Clone, Copy)]
pub struct PageGeometry {
    page_bits: u32,
    frame_mask: u64,
}

impl PageGeometry {
    /// `page_size` and `buffer_frames` must both be powers of two.
    pub fn new(page_size: u32, buffer_frames: u32) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(buffer_frames.is_power_of_two());
        Self {
            page_bits: page_size.trailing_zeros(),
            frame_mask: buffer_frames as u64 - 1,
        }
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        1 << self.page_bits
    }

    #[inline]
    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        (self.frame_mask + 1) as u32
    }

    /// Page index of an address.
    #[inline]
    pub fn page(&self, address: Address) -> u64 {
        address.control() >> self.page_bits
    }

    /// Offset of an address within its page.
    #[inline]
    pub fn offset(&self, address: Address) -> u32 {
        (address.control() & (self.page_size() as u64 - 1)) as u32
    }

    /// Address of the first byte of a page.
    #[inline]
    pub fn page_start(&self, page: u64) -> Address {
        Address::from_control(page << self.page_bits)
    }

    /// In-memory frame slot holding a page while it is resident.
    #[inline]
    pub fn frame_of(&self, page: u64) -> usize {
        (page & self.frame_mask) as usize
    }
}

/// Atomic logical address with monotonic advancement.
#[derive(Default, Debug)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    pub fn new(address: Address) -> Self {
        AtomicAddress(AtomicU64::new(address.control()))
    }

    pub fn load(&self, order: Ordering) -> Address {
        Address(self.0.load(order))
    }

    pub fn store(&self, value: Address, order: Ordering) {
        self.0.store(value.control(), order)
    }

    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<Address, Address> {
        match self.0.compare_exchange(current.0, new.0, success, failure) {
            Ok(v) => Ok(Address(v)),
            Err(v) => Err(Address(v)),
        }
    }

    /// Raise the address to `new` if it is larger; thresholds only ever
    /// move forward. Returns the previous value.
    pub fn advance_to(&self, new: Address) -> Address {
        Address(self.0.fetch_max(new.control(), Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offset_roundtrip() {
        let geo = PageGeometry::new(1024, 8);
        let addr = geo.page_start(5) + 136;
        assert_eq!(geo.page(addr), 5);
        assert_eq!(geo.offset(addr), 136);
        assert_eq!(geo.frame_of(5), 5);
        assert_eq!(geo.frame_of(13), 5);
    }

    #[test]
    fn test_null_and_start() {
        assert!(Address::NULL.is_null());
        assert!(!Address::START.is_null());
        assert!(Address::START > Address::NULL);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let addr = AtomicAddress::new(Address::from_control(100));
        assert_eq!(addr.advance_to(Address::from_control(200)).control(), 100);
        // A smaller value does not move the threshold backward.
        assert_eq!(addr.advance_to(Address::from_control(50)).control(), 200);
        assert_eq!(addr.load(Ordering::Acquire).control(), 200);
    }

    #[test]
    fn test_arithmetic() {
        let a = Address::from_control(4096);
        let b = a + 512;
        assert_eq!(b - a, 512);
    }
}

//! Key hashing for the hash index.
//!
//! The 64 bits of a key hash are split: the low bits select a bucket in
//! the table, and the top 14 bits act as the in-bucket tag discriminator.
//! The hasher is seeded with fixed keys because bucket tags are persisted
//! in index snapshots and must be reproducible across restarts.

use std::hash::{BuildHasher, Hash, Hasher};

/// Fixed seeds for a restart-stable `ahash` instance.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5149_5fb1_21ca_1d3e,
    0x9ae1_6a3b_2f90_404f,
    0x24f3_0ed1_18f0_6c52,
    0x8f5e_36a7_915c_a06b,
);

/// A raw 64-bit key hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct KeyHash(u64);

impl KeyHash {
    /// Number of tag bits; must agree with the bucket entry layout.
    pub const TAG_BITS: u32 = 14;
    const TAG_SHIFT: u32 = 64 - Self::TAG_BITS;

    pub fn of(key: &[u8]) -> Self {
        let state = ahash::RandomState::with_seeds(
            HASH_SEEDS.0,
            HASH_SEEDS.1,
            HASH_SEEDS.2,
            HASH_SEEDS.3,
        );
        let mut hasher = state.build_hasher();
        key.hash(&mut hasher);
        KeyHash(hasher.finish())
    }

    pub fn from_control(control: u64) -> Self {
        KeyHash(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    /// Bucket index in a table of `table_size` buckets (power of two).
    #[inline]
    pub fn table_index(&self, table_size: u64) -> u64 {
        debug_assert!(table_size.is_power_of_two());
        self.0 & (table_size - 1)
    }

    /// In-bucket discriminator.
    #[inline]
    pub fn tag(&self) -> u16 {
        (self.0 >> Self::TAG_SHIFT) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(KeyHash::of(b"alpha").control(), KeyHash::of(b"alpha").control());
        assert_ne!(KeyHash::of(b"alpha").control(), KeyHash::of(b"beta").control());
    }

    #[test]
    fn test_tag_fits_in_14_bits() {
        for i in 0..64u32 {
            let hash = KeyHash::of(&i.to_le_bytes());
            assert!(hash.tag() < (1 << KeyHash::TAG_BITS));
        }
    }

    #[test]
    fn test_table_index_respects_mask() {
        let hash = KeyHash::of(b"some-key");
        assert!(hash.table_index(1 << 10) < (1 << 10));
    }
}

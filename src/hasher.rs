use std::hash::Hasher;

use crate::layout::BUCKET_COUNT;

/// Initial state of the constmap hash.
pub const HASH_SEED: u32 = 5381;

/// Hashes `key` with the persisted constmap hash function.
///
/// Starting from [`HASH_SEED`], every byte is folded in as
/// `h = (h * 33) ^ byte` with wrapping 32-bit arithmetic. The values are
/// stored in slot tables, so this function must never change.
pub fn hash(key: &[u8]) -> u32 {
    let mut hasher = ConstMapHasher::new();
    hasher.write(key);
    hasher.value()
}

/// Selects the header bucket for a hash value.
pub fn bucket_index(hash: u32) -> usize {
    (hash % BUCKET_COUNT as u32) as usize
}

/// Slot visited by the `probe`-th step of linear probing within a bucket.
pub fn slot_index(hash: u32, slot_count: u32, probe: u32) -> u32 {
    debug_assert!(slot_count > 0);
    (((hash / BUCKET_COUNT as u32) as u64 + probe as u64) % slot_count as u64) as u32
}

/// Incremental form of [`hash`].
///
/// Feeding bytes through several `write` calls yields the same value as
/// hashing their concatenation at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstMapHasher(u32);

impl ConstMapHasher {
    pub fn new() -> Self {
        Self(HASH_SEED)
    }

    pub fn reset(&mut self) {
        self.0 = HASH_SEED;
    }

    /// Current 32-bit state.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Default for ConstMapHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for ConstMapHasher {
    fn finish(&self) -> u64 {
        self.0 as u64
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 = (self.0 << 5).wrapping_add(self.0) ^ byte as u32;
        }
    }
}

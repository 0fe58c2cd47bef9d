/// Cyclic polynomial rolling hash over a fixed-width byte window.
///
/// Supports O(1) sliding updates once the window is full: the oldest byte is
/// evicted and the new byte appended without rescanning the window. Hash
/// equality is necessary but not sufficient for block equality; callers must
/// confirm every probe with a strong checksum.
use std::collections::VecDeque;

/// Polynomial base.
pub const BASE: u64 = 257;
/// Modulus; keeps intermediate products inside u64.
pub const MODULUS: u64 = 1_000_000_007;

pub struct RollingHash {
    hash: u64,
    window: VecDeque<u8>,
    window_size: usize,
    // BASE^(window_size-1) mod MODULUS, for evicting the oldest byte.
    base_pow: u64,
}

impl RollingHash {
    pub fn new(window_size: usize) -> Self {
        let mut base_pow = 1u64;
        for _ in 0..window_size.saturating_sub(1) {
            base_pow = (base_pow * BASE) % MODULUS;
        }
        Self {
            hash: 0,
            window: VecDeque::with_capacity(window_size),
            window_size,
            base_pow,
        }
    }

    /// Append a byte, sliding the window if it is already full.
    pub fn push(&mut self, byte: u8) {
        if self.window.len() < self.window_size {
            self.window.push_back(byte);
            self.hash = (self.hash * BASE + u64::from(byte)) % MODULUS;
        } else {
            let oldest = self.window.pop_front().unwrap_or(0);
            self.window.push_back(byte);
            self.hash =
                (self.hash + MODULUS - (u64::from(oldest) * self.base_pow) % MODULUS) % MODULUS;
            self.hash = (self.hash * BASE + u64::from(byte)) % MODULUS;
        }
    }

    /// Current hash value.
    pub fn value(&self) -> u64 {
        self.hash
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.window_size
    }

    pub fn reset(&mut self) {
        self.hash = 0;
        self.window.clear();
    }
}

/// Bulk polynomial hash over a slice, starting from zero state. Equals the
/// value a window of `data.len()` bytes would reach after pushing `data`.
pub fn fast_hash(data: &[u8]) -> u64 {
    let mut hash = 0u64;
    for &byte in data {
        hash = (hash * BASE + u64::from(byte)) % MODULUS;
    }
    hash
}

//! Secure random number generation.
//!
//! Salts, padding lengths and padding bytes all come from the operating
//! system's entropy source.

use rand::Rng;
use rand_core::{OsRng, RngCore};

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate `len` random bytes.
    pub fn vec(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Uniform value in `low..=high`.
    pub fn in_range(low: usize, high: usize) -> usize {
        if low >= high {
            return low;
        }
        OsRng.gen_range(low..=high)
    }
}

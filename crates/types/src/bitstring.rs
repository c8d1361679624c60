//! Fixed-width 256-bit bitstrings used for `resolvedList` and per-requester
//! resolution tracking (spec §9 "Bitstring library" design note).
//!
//! The in-memory representation is a plain `[u8; 32]`; `compress`/`decompress`
//! apply a run-length encoding only at the store serialization boundary. The
//! encoding is an internal implementation detail — the only contract is that
//! the round trip is bit-exact.

use serde::{Deserialize, Serialize};

/// Number of bits tracked per batch (spec §9: fixed regardless of `maxTokenCount`).
pub const BITSTRING_BITS: usize = 256;
const BITSTRING_BYTES: usize = BITSTRING_BITS / 8;

/// A fixed-length 256-bit bitstring, one bit per token index in a batch.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitstring256([u8; BITSTRING_BYTES]);

impl Default for Bitstring256 {
    fn default() -> Self {
        Self([0u8; BITSTRING_BYTES])
    }
}

impl std::fmt::Debug for Bitstring256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitstring256({})", hex::encode(self.0))
    }
}

impl Bitstring256 {
    /// Is the bit at `index` set? Indices `>= 256` return `false`.
    pub fn get(&self, index: u8) -> bool {
        let byte = (index as usize) / 8;
        let bit = (index as usize) % 8;
        self.0[byte] & (1 << bit) != 0
    }

    /// Set the bit at `index`.
    pub fn set(&mut self, index: u8) {
        let byte = (index as usize) / 8;
        let bit = (index as usize) % 8;
        self.0[byte] |= 1 << bit;
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }

    /// Raw bytes, most-significant-bit-of-byte-0 is index 7, etc. (LSB-first per byte).
    pub fn as_bytes(&self) -> &[u8; BITSTRING_BYTES] {
        &self.0
    }

    /// Run-length encode: each run is a sequence of continuation bytes (`0xFF`
    /// meaning "256 more bits of the current value") terminated by a byte
    /// `< 0xFF` giving the remaining run length; runs alternate starting at
    /// bit value `0`.
    pub fn compress(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut current_value = false;
        let mut run_len: u32 = 0;
        for i in 0..BITSTRING_BITS {
            let bit = self.get(i as u8);
            if bit == current_value {
                run_len += 1;
            } else {
                push_run(&mut out, run_len);
                current_value = bit;
                run_len = 1;
            }
        }
        push_run(&mut out, run_len);
        out
    }

    /// Inverse of [`Self::compress`].
    pub fn decompress(bytes: &[u8]) -> Self {
        let mut result = Self::default();
        let mut index: usize = 0;
        let mut current_value = false;
        let mut pending: u32 = 0;
        for &byte in bytes {
            pending += byte as u32;
            if byte < 0xFF {
                if current_value {
                    for _ in 0..pending {
                        if index < BITSTRING_BITS {
                            result.set(index as u8);
                        }
                        index += 1;
                    }
                } else {
                    index += pending as usize;
                }
                pending = 0;
                current_value = !current_value;
            }
        }
        result
    }
}

fn push_run(out: &mut Vec<u8>, mut run_len: u32) {
    while run_len >= 0xFF {
        out.push(0xFF);
        run_len -= 0xFF;
    }
    out.push(run_len as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty() {
        let bits = Bitstring256::default();
        assert_eq!(Bitstring256::decompress(&bits.compress()), bits);
    }

    #[test]
    fn round_trips_sparse() {
        let mut bits = Bitstring256::default();
        bits.set(0);
        bits.set(5);
        bits.set(255);
        let compressed = bits.compress();
        assert_eq!(Bitstring256::decompress(&compressed), bits);
        assert_eq!(bits.count_ones(), 3);
    }

    #[test]
    fn round_trips_full() {
        let mut bits = Bitstring256::default();
        for i in 0..=255u8 {
            bits.set(i);
        }
        assert_eq!(bits.count_ones(), 256);
        assert_eq!(Bitstring256::decompress(&bits.compress()), bits);
    }

    #[test]
    fn round_trips_alternating() {
        let mut bits = Bitstring256::default();
        for i in (0..=255u8).step_by(2) {
            bits.set(i);
        }
        assert_eq!(Bitstring256::decompress(&bits.compress()), bits);
    }
}

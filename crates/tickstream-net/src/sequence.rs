//! Deterministic per-session value sequence.
//!
//! A session's values are never stored. The sequence is a pure function of
//! `(seed, length)`, where the seed is the first eight bytes of the session
//! identifier read big-endian. Resuming from offset `m` replays the generator
//! from position zero and discards the first `m` outputs, so a resume costs
//! O(length) regardless of how much remains.

use std::iter::FusedIterator;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::store::SessionId;

/// Derive the generator seed from a session identifier.
///
/// Identifiers shorter than eight bytes are zero-padded on the right.
pub fn seed_for(id: &SessionId) -> u64 {
    let bytes = id.as_bytes();
    let take = bytes.len().min(8);
    let mut prefix = [0u8; 8];
    prefix[..take].copy_from_slice(&bytes[..take]);
    u64::from_be_bytes(prefix)
}

/// Lazy iterator over the remaining values of a session's sequence.
#[derive(Debug, Clone)]
pub struct Sequence {
    rng: ChaCha8Rng,
    remaining: u32,
}

impl Iterator for Sequence {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.rng.next_u32())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Sequence {}

impl FusedIterator for Sequence {}

/// The full sequence of `length` values for `seed`.
pub fn generate(seed: u64, length: u32) -> Sequence {
    Sequence {
        rng: ChaCha8Rng::seed_from_u64(seed),
        remaining: length,
    }
}

/// The tail of the sequence starting at index `offset`.
///
/// Offsets at or past `length` yield an empty iterator.
pub fn generate_from(seed: u64, length: u32, offset: u32) -> Sequence {
    let mut sequence = generate(seed, length);
    let skip = offset.min(length);
    for _ in 0..skip {
        sequence.rng.next_u32();
    }
    sequence.remaining = length - skip;
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: u64 = 0x0123_4567_89ab_cdef;

    #[test]
    fn test_seed_is_big_endian_prefix() {
        let id = SessionId::new("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        assert_eq!(seed_for(&id), 0x6161_6161_6161_6161);

        let id = SessionId::new("09ff8f0b-c0fb-4587-9173-807695f5b576");
        assert_eq!(seed_for(&id), u64::from_be_bytes(*b"09ff8f0b"));
    }

    #[test]
    fn test_short_identifier_padded() {
        let id = SessionId::new("ab");
        assert_eq!(seed_for(&id), u64::from_be_bytes(*b"ab\0\0\0\0\0\0"));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a: Vec<u32> = generate(SEED, 64).collect();
        let b: Vec<u32> = generate(SEED, 64).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_different_seeds_diverge() {
        let a: Vec<u32> = generate(1, 16).collect();
        let b: Vec<u32> = generate(2, 16).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn test_shorter_length_is_prefix() {
        let long: Vec<u32> = generate(SEED, 32).collect();
        let short: Vec<u32> = generate(SEED, 10).collect();
        assert_eq!(&long[..10], &short[..]);
    }

    #[test]
    fn test_every_offset_yields_tail() {
        let length = 20;
        let full: Vec<u32> = generate(SEED, length).collect();
        for m in 0..=length {
            let tail: Vec<u32> = generate_from(SEED, length, m).collect();
            assert_eq!(tail, full[m as usize..], "tail mismatch at offset {m}");
        }
    }

    #[test]
    fn test_zero_length_is_empty() {
        assert_eq!(generate(SEED, 0).count(), 0);
        assert_eq!(generate_from(SEED, 0, 0).count(), 0);
    }

    #[test]
    fn test_offset_at_or_past_length_is_empty() {
        assert_eq!(generate_from(SEED, 1, 1).count(), 0);
        assert_eq!(generate_from(SEED, 5, 9).count(), 0);
    }

    #[test]
    fn test_exact_size() {
        let seq = generate_from(SEED, 10, 4);
        assert_eq!(seq.len(), 6);
    }
}

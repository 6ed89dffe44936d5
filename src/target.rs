// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Search target derivation from a block header.
//!
//! The network encodes the difficulty as a trailing bit count: the target
//! is a fixed prefix (a set bit, 8 reserved zero bits, the 256 bits of the
//! header hash) padded with zeros up to the requested length. Shares are
//! submitted as the byte-exact offset of the found constellation from this
//! target, so the bit layout here is part of the wire protocol.

use num_traits::One;
use sha2::{Digest, Sha256};

use crate::Uint;

pub const ZEROES_BEFORE_HASH: u32 = 8;

/// Smallest encodable target: one marker bit, the reserved zeros and the
/// hash, with no trailing padding.
pub const MIN_SEARCH_BITS: u32 = 1 + ZEROES_BEFORE_HASH + 256;

/// Candidates are target + remainder + k*P; capping the target size keeps
/// their Fermat squarings inside 1024 bits.
pub const MAX_SEARCH_BITS: u32 = 504;

/// One unit of work from the network: an 80-byte block header, the
/// difficulty encoding, and an opaque handle passed back on submission.
#[derive(Clone, Debug)]
pub struct WorkInfo {
    pub header: [u8; 80],
    /// Trailing bit count of the target ("search bits").
    pub target_compact: u32,
    pub height: u64,
    pub handle: u64,
}

/// Double SHA-256 of the block header.
pub fn pow_hash(header: &[u8; 80]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(header)).into()
}

/// Builds the search target from a header hash. Bits of the hash are
/// consumed least-significant first within each byte, byte 0 first, each
/// appended below the previous ones. Returns None when the difficulty
/// encoding is out of the supported range.
pub fn target_from_hash(hash: &[u8; 32], search_bits: u32) -> Option<Uint> {
    if !(MIN_SEARCH_BITS..=MAX_SEARCH_BITS).contains(&search_bits) {
        return None;
    }
    let mut t = Uint::one() << ZEROES_BEFORE_HASH as usize;
    for i in 0..256usize {
        t = t << 1usize;
        if (hash[i / 8] >> (i % 8)) & 1 == 1 {
            t = t + Uint::one();
        }
    }
    let trailing_zeros = search_bits - 1 - ZEROES_BEFORE_HASH - 256;
    Some(t << trailing_zeros as usize)
}

pub fn target_from_block(block: &WorkInfo) -> Option<Uint> {
    target_from_hash(&pow_hash(&block.header), block.target_compact)
}

/// Remainder R with (target + R) = primorial_offset mod P and R minimal
/// above the congruence, so the candidate base sits in the admissible
/// residue class just past the target.
pub fn remainder_primorial(target: &Uint, primorial: &Uint, primorial_offset: u32) -> Uint {
    let r = *target % *primorial;
    let r = (*primorial - r) % *primorial;
    r + Uint::from(primorial_offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_layout() {
        // All-zero hash: only the marker bit survives, the target is
        // exactly search_bits long.
        let t = target_from_hash(&[0u8; 32], 300).unwrap();
        assert_eq!(t, Uint::one() << 299usize);
        assert_eq!(t.bits(), 300);

        // Bit 0 of byte 0 is the first bit consumed, so it ends up at
        // the top of the hash field: position 255 + trailing zeros.
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        let t = target_from_hash(&hash, 300).unwrap();
        assert_eq!(t, (Uint::one() << 299usize) + (Uint::one() << 290usize));

        // Bit 7 of byte 31 is the last bit consumed: lowest position.
        let mut hash = [0u8; 32];
        hash[31] = 0x80;
        let t = target_from_hash(&hash, 300).unwrap();
        assert_eq!(t, (Uint::one() << 299usize) + (Uint::one() << 35usize));

        assert!(target_from_hash(&[0u8; 32], MIN_SEARCH_BITS - 1).is_none());
        assert!(target_from_hash(&[0u8; 32], MAX_SEARCH_BITS + 1).is_none());
    }

    #[test]
    fn test_pow_hash_deterministic() {
        let h1 = pow_hash(&[0xabu8; 80]);
        let h2 = pow_hash(&[0xabu8; 80]);
        assert_eq!(h1, h2);
        assert_ne!(h1, pow_hash(&[0xacu8; 80]));
    }

    #[test]
    fn test_remainder_primorial() {
        // Primorial of the first 8 primes.
        let p = Uint::from(9_699_690u64);

        // A target that is an exact multiple of P: the remainder is the
        // admissible offset itself.
        let t = p * Uint::from(12345u64);
        assert_eq!(remainder_primorial(&t, &p, 16057), Uint::from(16057u64));

        // Arbitrary targets land in the admissible class.
        for k in [1u64, 97, 5_000_000, 123_456_789_123] {
            let t = Uint::from(k) * Uint::from(1_000_003u64);
            let r = remainder_primorial(&t, &p, 16057);
            assert_eq!((t + r) % p, Uint::from(16057u64));
        }
    }
}

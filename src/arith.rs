// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Modular arithmetic on candidates and table primes.
//!
//! Three operations carry the engine: reducing a multi-hundred-bit
//! candidate modulo a table prime (once per prime per block, in the mod
//! phase), inverting the primorial modulo a table prime (startup), and
//! modular exponentiation for the Fermat filter (the verification hot
//! path). Reductions here are one-shot, so nothing is precomputed per
//! modulus; the limb fold below beats setting up a reciprocal that
//! would be used a single time.

use num_integer::Integer;
use num_traits::One;

pub use bnum::types::U1024;

/// Remainder of a large value by a 64-bit modulus, folding one limb at
/// a time from the most significant end. The running remainder stays
/// below the modulus, so `rem * 2^64 + limb` always fits 128 bits.
pub fn mod_u64(n: &U1024, m: u64) -> u64 {
    debug_assert!(m != 0);
    let mut rem: u64 = 0;
    for &limb in n.digits().iter().rev() {
        if rem == 0 && limb == 0 {
            continue;
        }
        rem = ((((rem as u128) << 64) | limb as u128) % m as u128) as u64;
    }
    rem
}

/// Inverse of a modulo p by the extended Euclidean algorithm, or None
/// when a and p share a factor. Both arguments must fit in 63 bits.
pub fn mod_inverse(a: u64, p: u64) -> Option<u64> {
    let e = (a as i64).extended_gcd(&(p as i64));
    if e.gcd != 1 {
        return None;
    }
    Some(e.x.rem_euclid(p as i64) as u64)
}

/// Modular exponentiation, square-and-multiply from the top exponent
/// bit down. The modulus must stay below half the width of the type so
/// the squarings cannot overflow.
pub fn pow_mod(base: &U1024, exp: &U1024, modulus: &U1024) -> U1024 {
    let b = *base % *modulus;
    let mut acc = U1024::one();
    for i in (0..exp.bits()).rev() {
        acc = acc * acc % *modulus;
        if exp.bit(i) {
            acc = acc * b % *modulus;
        }
    }
    acc
}

/// Fermat base-2 probable-prime test: n passes iff 2^(n-1) = 1 mod n.
/// Composites slip through rarely enough that downstream validation of
/// submitted shares is the cheaper place to catch them.
pub fn fermat2(n: &U1024) -> bool {
    let one = U1024::one();
    pow_mod(&(one + one), &(*n - one), n) == one
}

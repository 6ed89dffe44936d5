// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Prime table, primorial and per-prime inverses.
//!
//! Sieving primes fall in three strata relative to the search window:
//! dense primes hit every iteration many times and are sieved inline,
//! sparse primes hit a few times and go through the prefetch pipeline,
//! and primes larger than the whole window hit at most once per bias and
//! are routed to per-iteration segment buckets instead of keeping
//! resident offsets.

use num_traits::One;

use crate::arith::{mod_inverse, mod_u64};
use crate::{InvalidParams, Params, Uint, Verbosity};

/// Immutable startup tables shared by all threads.
pub struct PrimeBase {
    pub primes: Vec<u32>,
    /// inverts[i] = primorial^-1 mod primes[i], for i >= 5 where the
    /// inverse exists. Indices below the primorial number are never used
    /// as sieving primes.
    pub inverts: Vec<u32>,
    pub primorial: Uint,
    /// Count of sieving primes below the dense limit.
    pub n_dense: usize,
    /// Count of sieving primes between the dense limit and the window.
    pub n_sparse: usize,
    /// Index of the first prime at or above the window, which is also
    /// the length of the resident offsets table.
    pub offsets_len: usize,
    /// Bucket capacity for once-only hits, per iteration.
    pub entries_per_segment: u32,
}

impl PrimeBase {
    pub fn new(params: &Params) -> Result<PrimeBase, InvalidParams> {
        params.check()?;
        let m = params.primorial_number;
        let max_increments = params.max_increments();

        let primes = sieve_primes(params.sieve_max);
        if primes.len() <= m {
            return Err(InvalidParams(format!(
                "prime table ceiling {} yields only {} primes, primorial needs {}",
                params.sieve_max,
                primes.len(),
                m + 1
            )));
        }
        if params.verbose(Verbosity::Info) {
            eprintln!("Prime table: {} primes below {}", primes.len(), params.sieve_max);
        }

        let mut primorial = Uint::one();
        for &p in &primes[..m] {
            primorial *= Uint::from(p as u64);
        }

        let mut inverts = vec![0u32; primes.len()];
        for i in 5..primes.len() {
            let p = primes[i] as u64;
            let r = mod_u64(&primorial, p);
            // Not invertible for indices below the primorial number:
            // those primes divide P and are skipped by the sieve.
            if let Some(inv) = mod_inverse(r, p) {
                inverts[i] = inv as u32;
            }
        }

        let mut n_dense = 0;
        let mut n_sparse = 0;
        for &p in &primes[m..] {
            if (p as u64) < params.dense_limit as u64 {
                n_dense += 1;
            } else if (p as u64) < max_increments {
                n_sparse += 1;
            }
        }
        let offsets_len = m + n_dense + n_sparse;
        if (primes[m] as u64) >= max_increments {
            return Err(InvalidParams(format!(
                "search window {} does not cover the first sieving prime {}",
                max_increments, primes[m]
            )));
        }
        debug_assert!(primes[..offsets_len]
            .iter()
            .all(|&p| (p as u64) < max_increments));

        // A once-only prime p lands in the window about 6*window/p times
        // over the six biases. Spread over the iterations, with slack.
        let mut once_hits = 0f64;
        for &p in &primes[offsets_len..] {
            once_hits += 6.0 * max_increments as f64 / p as f64;
        }
        let entries_per_segment = if once_hits == 0.0 {
            1
        } else {
            let per_iter = (once_hits.ceil() as u64 / params.max_iter as u64) as u32 + 4;
            per_iter + (per_iter >> 3)
        };

        if params.verbose(Verbosity::Info) {
            eprintln!(
                "Primorial of {} primes: {} bits",
                m,
                primorial.bits()
            );
            eprintln!(
                "Strata: {} dense, {} sparse, {} once-only (bucket capacity {})",
                n_dense,
                n_sparse,
                primes.len() - offsets_len,
                entries_per_segment
            );
        }

        Ok(PrimeBase {
            primes,
            inverts,
            primorial,
            n_dense,
            n_sparse,
            offsets_len,
            entries_per_segment,
        })
    }

    pub fn n_primes(&self) -> usize {
        self.primes.len()
    }
}

/// Byte-packed sieve of Eratosthenes over [2, limit).
fn sieve_primes(limit: u64) -> Vec<u32> {
    let limit = limit as usize;
    let mut composite = vec![0u8; (limit + 7) / 8];
    let mut factor = 2usize;
    while factor * factor < limit {
        if composite[factor >> 3] & (1 << (factor & 7)) == 0 {
            let mut n = factor * factor;
            while n < limit {
                composite[n >> 3] |= 1 << (n & 7);
                n += factor;
            }
        }
        factor += 1;
    }
    let mut primes = vec![];
    for n in 2..limit {
        if composite[n >> 3] & (1 << (n & 7)) == 0 {
            primes.push(n as u32);
        }
    }
    primes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Verbosity;

    fn quiet(sieve_max: u64, m: usize) -> Params {
        Params {
            sieve_max,
            primorial_number: m,
            sieve_bits: 12,
            max_iter: 4,
            dense_limit: 100,
            verbosity: Verbosity::Silent,
            ..Params::default()
        }
    }

    #[test]
    fn test_sieve_primes() {
        let ps = sieve_primes(1_000_000);
        assert_eq!(ps.len(), 78498);
        assert_eq!(&ps[..6], &[2, 3, 5, 7, 11, 13]);
        assert_eq!(ps.last(), Some(&999983));
    }

    #[test]
    fn test_primorial() {
        let base = PrimeBase::new(&quiet(100_000, 5)).unwrap();
        assert_eq!(base.primorial, Uint::from(2310u64));
        let base = PrimeBase::new(&quiet(100_000, 8)).unwrap();
        assert_eq!(base.primorial, Uint::from(9_699_690u64));
    }

    #[test]
    fn test_inverts() {
        let params = quiet(100_000, 8);
        let base = PrimeBase::new(&params).unwrap();
        for i in (8..base.n_primes()).step_by(37) {
            let p = base.primes[i] as u64;
            let r = mod_u64(&base.primorial, p);
            assert_eq!(
                r * base.inverts[i] as u64 % p,
                1,
                "invert law fails at prime {}",
                p
            );
        }
        // Primes dividing P have no inverse recorded.
        for i in 5..8 {
            assert_eq!(base.inverts[i], 0);
        }
    }

    #[test]
    fn test_strata() {
        let params = quiet(100_000, 5);
        let base = PrimeBase::new(&params).unwrap();
        // Window is 2^14; primes split as [13, 100), [100, 16384), rest.
        let max_inc = params.max_increments();
        assert_eq!(
            base.n_dense,
            base.primes[5..].iter().filter(|&&p| p < 100).count()
        );
        assert_eq!(
            base.n_sparse,
            base.primes[5..]
                .iter()
                .filter(|&&p| p >= 100 && (p as u64) < max_inc)
                .count()
        );
        assert_eq!(base.offsets_len, 5 + base.n_dense + base.n_sparse);
        assert!(base.offsets_len < base.n_primes());
        assert!(base.entries_per_segment > 0);
    }

    #[test]
    fn test_table_too_small() {
        assert!(PrimeBase::new(&quiet(100, 40)).is_err());
    }
}

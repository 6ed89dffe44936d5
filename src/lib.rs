// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! A search engine for prime sextuplets (p, p+4, p+6, p+10, p+12, p+16)
//! above a target value derived from a block header.
//!
//! Candidates are of the form T + R + k·P where P is a primorial and
//! T + R lies in a residue class modulo P that admits the tuple pattern.
//! A segmented sieve over k eliminates candidates divisible by a table
//! prime at any of the six biases; survivors are handed to Fermat testers
//! and reported as shares through a caller-provided sink.

use std::fmt;

pub mod arith;
pub mod miner;
pub mod primes;
pub mod queue;
pub mod sieve;
pub mod target;

pub use miner::{BlockStats, Miner, MinerStats, ShareSink};
pub use target::WorkInfo;

// Candidates are at most ~500 bits (see target::MAX_SEARCH_BITS) so that
// the squarings of the Fermat test stay inside 1024 bits.
pub type Uint = arith::U1024;

/// Gaps between successive members of the sextuplet pattern.
/// Cumulative biases from the first member are 0, 4, 6, 10, 12, 16.
pub const TUPLE_OFFSETS: [u32; 6] = [0, 4, 2, 4, 2, 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent,
    Info,
    Verbose,
    Debug,
}

/// Engine parameters. The defaults match production mining; tests and
/// benchmarks shrink the window through these fields.
#[derive(Clone, Debug)]
pub struct Params {
    /// Ceiling of the prime table generated at startup.
    pub sieve_max: u64,
    /// log2 of the number of bit positions per sieve iteration.
    pub sieve_bits: u32,
    /// Sieve iterations per block. The search window per block is
    /// `max_iter << sieve_bits` multiples of the primorial.
    pub max_iter: u32,
    /// Number of primes multiplied into the primorial.
    pub primorial_number: usize,
    /// Primes below this bound are sieved inline by the master thread,
    /// primes above it by the sieve workers.
    pub dense_limit: u32,
    /// Additive offset placing T + R in a tuple-admissible class mod P.
    pub primorial_offset: u32,
    /// Total thread count, master included.
    pub threads: usize,
    /// Minimal number of tuple members that must pass the Fermat test
    /// for a candidate to be submitted as a share.
    pub tuples_threshold: u32,
    pub verbosity: Verbosity,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            sieve_max: 1 << 27,
            sieve_bits: 24,
            max_iter: 32,
            primorial_number: 40,
            dense_limit: 16384,
            primorial_offset: 16057,
            threads: 4,
            tuples_threshold: 6,
            verbosity: Verbosity::Info,
        }
    }
}

impl Params {
    pub fn sieve_size(&self) -> u32 {
        1 << self.sieve_bits
    }

    pub fn sieve_words(&self) -> usize {
        (self.sieve_size() / 64) as usize
    }

    pub fn max_increments(&self) -> u64 {
        (self.max_iter as u64) << self.sieve_bits
    }

    pub fn verbose(&self, v: Verbosity) -> bool {
        self.verbosity >= v
    }

    pub fn check(&self) -> Result<(), InvalidParams> {
        if self.threads < 2 {
            // The master thread never pops jobs, so at least one worker
            // must exist or the mod phase cannot complete.
            return Err(InvalidParams("at least 2 threads required".into()));
        }
        if !(5..=64).contains(&self.primorial_number) {
            return Err(InvalidParams(format!(
                "primorial number {} out of range 5..=64",
                self.primorial_number
            )));
        }
        if !(8..=28).contains(&self.sieve_bits) {
            return Err(InvalidParams(format!(
                "sieve bits {} out of range 8..=28",
                self.sieve_bits
            )));
        }
        if self.max_iter == 0 {
            return Err(InvalidParams("max iter must be nonzero".into()));
        }
        // Offsets are kept as u32 and may temporarily exceed the window
        // by one prime, which itself is below the window.
        if self.max_increments() > 1 << 31 {
            return Err(InvalidParams(format!(
                "search window {} exceeds 2^31",
                self.max_increments()
            )));
        }
        if self.sieve_max < 100 || self.sieve_max > u32::MAX as u64 {
            return Err(InvalidParams(format!(
                "prime table ceiling {} out of range",
                self.sieve_max
            )));
        }
        if self.tuples_threshold == 0 || self.tuples_threshold > 6 {
            return Err(InvalidParams(format!(
                "tuple threshold {} out of range 1..=6",
                self.tuples_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct InvalidParams(pub String);

impl fmt::Display for InvalidParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid miner parameters: {}", self.0)
    }
}

impl std::error::Error for InvalidParams {}

#[test]
fn test_params_check() {
    assert!(Params::default().check().is_ok());
    let p = Params {
        threads: 1,
        ..Params::default()
    };
    assert!(p.check().is_err());
    // 2^33 window
    let p = Params {
        sieve_bits: 28,
        max_iter: 32,
        ..Params::default()
    };
    assert!(p.check().is_err());
    let p = Params {
        primorial_number: 4,
        ..Params::default()
    };
    assert!(p.check().is_err());
}

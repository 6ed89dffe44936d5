// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Benchmark driver: mines a sequence of synthetic blocks with random
//! headers and prints found shares to stdout.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;

use sextans::{Miner, Params, ShareSink, Verbosity, WorkInfo};

struct StdoutSink;

impl ShareSink for StdoutSink {
    fn submit_share(&self, work: &WorkInfo, offset: &[u8; 32], k_primes: u32) {
        let mut hex = String::with_capacity(64);
        for b in offset.iter().rev() {
            hex.push_str(&format!("{b:02x}"));
        }
        println!("share block={} k={} offset={}", work.height, k_primes, hex);
    }
}

fn main() {
    let arg = arguments::parse(std::env::args()).unwrap();
    let threads = arg.get::<usize>("threads").unwrap_or(4);
    let sieve_max = arg.get::<u64>("sieve-max").unwrap_or(1 << 27);
    let tuples = arg.get::<u32>("tuples").unwrap_or(4);
    let bits = arg.get::<u32>("bits").unwrap_or(280);
    let blocks = arg.get::<u64>("blocks").unwrap_or(1);

    let params = Params {
        sieve_max,
        threads,
        tuples_threshold: tuples,
        verbosity: Verbosity::Verbose,
        ..Params::default()
    };
    let mut miner = match Miner::new(params) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut rng = rand::thread_rng();
    let sink = StdoutSink;
    for height in 1..=blocks {
        let mut header = [0u8; 80];
        rng.fill_bytes(&mut header);
        let block = WorkInfo {
            header,
            target_compact: bits,
            height,
            handle: height,
        };
        let current = AtomicU64::new(height);
        let stats = miner.process(&block, &current, &sink);
        eprintln!(
            "block {}: {} candidates over {} iterations",
            height, stats.candidates, stats.loops
        );
    }
    for k in 2..=6 {
        let c = miner.stats.tuples[k].load(Ordering::Relaxed);
        if c > 0 {
            eprintln!("{k}-tuples found: {c}");
        }
    }
}

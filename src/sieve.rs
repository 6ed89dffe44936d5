// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Segmented sieve over primorial multiples.
//!
//! For each sieving prime p and each of the six tuple biases there is one
//! residue class of k such that T + R + k·P + bias is divisible by p. The
//! mod phase computes the first k of each class; the sieve phase walks the
//! classes through the window one iteration at a time, marking eliminated
//! positions in a bitmap.
//!
//! Most of the sieve time is spent missing the cache on the bitmap byte,
//! so sparse-prime writes go through a small pending ring: a position is
//! prefetched when it enters the ring and the bit is only set when the
//! position is displaced, sixteen writes later. Slot value 0 means an
//! empty slot; position 0 is excluded from candidate extraction instead
//! of being branch-checked here.

use std::cell::UnsafeCell;
use std::sync::Mutex;

use crate::arith::mod_u64;
use crate::primes::PrimeBase;
use crate::{Uint, TUPLE_OFFSETS};

pub const PENDING_SIZE: usize = 16;

/// Once-only hits are batched per worker before taking the bucket lock.
pub const OFFSET_STACK_SIZE: usize = 16384;

/// Per-prime sieve state: one position per tuple bias.
pub type SixOff = [u32; 6];

#[inline]
pub(crate) fn set_bit(words: &mut [u64], pos: u32) {
    words[(pos >> 6) as usize] |= 1 << (pos & 63);
}

#[inline]
fn prefetch(words: &[u64], pos: u32) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(words.as_ptr().add((pos >> 6) as usize) as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = (words, pos);
}

/// Write pipeline for cache-missing bitmap updates. Positions are marked
/// with a delay of PENDING_SIZE insertions, by which time the prefetch
/// issued on insertion has landed.
pub struct PendingRing {
    slots: [u32; PENDING_SIZE],
    pos: usize,
}

impl PendingRing {
    pub fn new() -> Self {
        PendingRing {
            slots: [0; PENDING_SIZE],
            pos: 0,
        }
    }

    #[inline]
    pub fn add(&mut self, sieve: &mut [u64], ent: u32) {
        prefetch(sieve, ent);
        let old = self.slots[self.pos];
        if old != 0 {
            debug_assert!(((old >> 6) as usize) < sieve.len());
            set_bit(sieve, old);
        }
        self.slots[self.pos] = ent;
        self.pos = (self.pos + 1) & (PENDING_SIZE - 1);
    }

    pub fn flush(&mut self, sieve: &mut [u64]) {
        for i in 0..PENDING_SIZE {
            let old = self.slots[i];
            if old != 0 {
                set_bit(sieve, old);
            }
            self.slots[i] = 0;
        }
        self.pos = 0;
    }
}

/// Resident per-prime offsets, shared across the worker pool.
///
/// Jobs carry disjoint index ranges: mod jobs partition the table once
/// per block, sieve jobs use a partition that is stable across
/// iterations, and the dense range is only touched by the master.
/// Handoff between phases is ordered by the job and ack queues.
pub struct OffsetsBox {
    slots: Box<[UnsafeCell<SixOff>]>,
}

unsafe impl Sync for OffsetsBox {}

impl OffsetsBox {
    pub fn new(len: usize) -> Self {
        OffsetsBox {
            slots: (0..len).map(|_| UnsafeCell::new([0u32; 6])).collect(),
        }
    }

    /// Safety: the caller must hold the only live reference to indices
    /// in [start, end).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, start: usize, end: usize) -> &mut [SixOff] {
        // UnsafeCell<T> has the layout of T, so a disjoint cell range
        // reborrows as a plain mutable slice.
        if start == end {
            return &mut [];
        }
        let ptr = self.slots[start].get();
        std::slice::from_raw_parts_mut(ptr, end - start)
    }
}

/// A sieve bitmap writable by one worker at a time, id-assigned by the
/// master so that each bitmap receives at most one job per iteration.
pub struct SieveBox {
    words: UnsafeCell<Box<[u64]>>,
}

unsafe impl Sync for SieveBox {}

impl SieveBox {
    pub fn new(words: usize) -> Self {
        SieveBox {
            words: UnsafeCell::new(vec![0u64; words].into_boxed_slice()),
        }
    }

    /// Safety: no other reference may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn words_mut(&self) -> &mut [u64] {
        &mut *self.words.get()
    }

    /// Safety: no writer may be live.
    pub unsafe fn words(&self) -> &[u64] {
        &*self.words.get()
    }
}

/// Per-iteration storage for hits of primes larger than the window.
/// Capacity is derived from the expected hit count with slack; running
/// out means the stratification is wrong and aborts the process.
pub struct SegmentBuckets {
    hits: Vec<Box<[u32]>>,
    counts: Vec<u32>,
    sieve_bits: u32,
}

impl SegmentBuckets {
    pub fn new(max_iter: u32, entries_per_segment: u32, sieve_bits: u32) -> Self {
        SegmentBuckets {
            hits: (0..max_iter)
                .map(|_| vec![0u32; entries_per_segment as usize].into_boxed_slice())
                .collect(),
            counts: vec![0; max_iter as usize],
            sieve_bits,
        }
    }

    pub fn reset(&mut self) {
        self.counts.fill(0);
    }

    pub fn flush(&mut self, offsets: &[u32]) {
        let mask = (1u32 << self.sieve_bits) - 1;
        for &index in offsets {
            let segment = (index >> self.sieve_bits) as usize;
            let sc = self.counts[segment] as usize;
            if sc >= self.hits[segment].len() {
                // Capacity was derived from an upper bound with slack;
                // running out means the stratification is broken.
                eprintln!(
                    "segment bucket {} overflow at {} entries (index {})",
                    segment, sc, index
                );
                std::process::exit(1);
            }
            self.hits[segment][sc] = index & mask;
            self.counts[segment] += 1;
        }
    }

    pub fn segment(&self, k: usize) -> &[u32] {
        &self.hits[k][..self.counts[k] as usize]
    }
}

/// Computes sieve start positions for prime indices [start, end) against
/// the candidate base T + R.
///
/// For each bias the start is the least k with T + R + k·P + bias
/// divisible by p, that is (p - (T + R + bias) mod p) · P^-1 mod p.
/// Resident primes store all six positions in `table` (which covers
/// absolute indices from `start`); once-only hits inside the window are
/// batched in `stack` and flushed to the shared buckets.
pub fn update_remainders(
    base: &PrimeBase,
    t_plus_r: &Uint,
    max_increments: u64,
    start: usize,
    end: usize,
    table: &mut [SixOff],
    stack: &mut Vec<u32>,
    buckets: &Mutex<SegmentBuckets>,
) {
    debug_assert!(start >= 5);
    for i in start..end {
        let p = base.primes[i] as u64;
        let mut r = mod_u64(t_plus_r, p);
        let once_only = p >= max_increments;
        let invert = base.inverts[i] as u64;
        for f in 0..6 {
            r += TUPLE_OFFSETS[f] as u64;
            if r > p {
                r -= p;
            }
            let pa = p - r;
            let index = pa * invert % p;
            if !once_only {
                table[i - start][f] = index as u32;
            } else if index < max_increments {
                stack.push(index as u32);
                if stack.len() >= OFFSET_STACK_SIZE {
                    buckets.lock().unwrap().flush(stack);
                    stack.clear();
                }
            }
        }
    }
    if !stack.is_empty() {
        buckets.lock().unwrap().flush(stack);
        stack.clear();
    }
}

/// Sieves one iteration of sparse primes through the pending ring.
/// Offsets leave the call positioned for the next iteration.
pub fn process_sieve(sieve: &mut [u64], sieve_size: u32, primes: &[u32], offsets: &mut [SixOff]) {
    debug_assert_eq!(primes.len(), offsets.len());
    let mut pending = PendingRing::new();
    for (&p, off) in primes.iter().zip(offsets.iter_mut()) {
        for f in 0..6 {
            while off[f] < sieve_size {
                pending.add(sieve, off[f]);
                off[f] += p;
            }
            off[f] -= sieve_size;
        }
    }
    pending.flush(sieve);
}

/// Sieves one iteration of dense primes with direct bit writes; their
/// positions are dense enough that the target words stay cached.
pub fn dense_sieve(sieve: &mut [u64], sieve_size: u32, primes: &[u32], offsets: &mut [SixOff]) {
    debug_assert_eq!(primes.len(), offsets.len());
    for (&p, off) in primes.iter().zip(offsets.iter_mut()) {
        sort6(off);
        for f in 0..6 {
            while off[f] < sieve_size {
                set_bit(sieve, off[f]);
                off[f] += p;
            }
            off[f] -= sieve_size;
        }
    }
}

/// Marks the once-only hits collected for one iteration.
pub fn apply_segment(sieve: &mut [u64], hits: &[u32]) {
    let mut pending = PendingRing::new();
    for &h in hits {
        pending.add(sieve, h);
    }
    pending.flush(sieve);
}

pub fn merge_into(dst: &mut [u64], src: &[u64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d |= *s;
    }
}

#[inline]
fn sort6(off: &mut SixOff) {
    for i in 0..5 {
        for j in i + 1..6 {
            if off[j] < off[i] {
                off.swap(i, j);
            }
        }
    }
}

// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Per-block orchestration and constellation verification.
//!
//! The thread calling [`Miner::process`] is the master: it owns the block
//! schedule (mod phase, then one sieve iteration at a time, then the
//! drain) and the main bitmap. All other threads drain a single job queue
//! and dispatch on the job tag, so threads not busy sieving serve
//! verification jobs opportunistically. Verification carries no
//! per-iteration ordering: batches from iteration k may still be in
//! flight while iteration k+1 is sieved.

use std::cmp::min;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::arith::fermat2;
use crate::primes::PrimeBase;
use crate::queue::JobQueue;
use crate::sieve::{
    apply_segment, dense_sieve, merge_into, process_sieve, update_remainders, OffsetsBox,
    SegmentBuckets, SieveBox, SixOff, OFFSET_STACK_SIZE,
};
use crate::target::{self, WorkInfo};
use crate::{InvalidParams, Params, Uint, Verbosity, TUPLE_OFFSETS};

/// Candidates per verification job.
pub const WORK_INDEXES: usize = 64;

const VERIFY_QUEUE_CAP: usize = 1024;
const DONE_QUEUE_CAP: usize = 3096;

/// Chunk count for the mod phase partition.
const MOD_JOBS: usize = 128;

#[derive(Clone)]
enum Job {
    Mod {
        start: u32,
        end: u32,
    },
    /// Prime range relative to the first sieving prime, plus the id of
    /// the auxiliary bitmap to write.
    Sieve {
        start: u32,
        end: u32,
        sieve_id: u32,
    },
    Check(CheckJob),
}

#[derive(Clone)]
struct CheckJob {
    loop_no: u32,
    n_indexes: u32,
    indexes: [u32; WORK_INDEXES],
}

/// Consumer of found constellations. `offset` is the little-endian
/// distance of the first member from the derived target; together with
/// the count of members that passed verification it forms a share.
pub trait ShareSink: Sync {
    fn submit_share(&self, work: &WorkInfo, offset: &[u8; 32], k_primes: u32);
}

/// Constellations by verified length, accumulated across blocks.
#[derive(Default)]
pub struct MinerStats {
    pub tuples: [AtomicU64; 7],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlockStats {
    /// Sieve survivors handed to verification.
    pub candidates: u64,
    /// Iterations fully started before exhaustion or supersedure.
    pub loops: u32,
}

pub struct Miner {
    params: Params,
    base: PrimeBase,
    sieve_workers: usize,
    offsets: OffsetsBox,
    /// Master bitmap; auxiliary bitmaps are merged into it.
    sieve: Vec<u64>,
    aux: Vec<SieveBox>,
    buckets: Mutex<SegmentBuckets>,
    pub stats: MinerStats,
}

/// Everything the worker pool needs for one block.
struct BlockCtx<'a> {
    params: &'a Params,
    base: &'a PrimeBase,
    block: &'a WorkInfo,
    target: Uint,
    t_plus_r: Uint,
    offsets: &'a OffsetsBox,
    buckets: &'a Mutex<SegmentBuckets>,
    aux: &'a [SieveBox],
    work_q: JobQueue<Job>,
    done_q: JobQueue<u32>,
    test_q: JobQueue<u32>,
    height: &'a AtomicU64,
    sink: &'a dyn ShareSink,
    stats: &'a MinerStats,
}

impl Miner {
    pub fn new(params: Params) -> Result<Miner, InvalidParams> {
        let base = PrimeBase::new(&params)?;
        let sieve_workers = (params.threads / 4).clamp(1, 8);
        let words = params.sieve_words();
        let offsets = OffsetsBox::new(base.offsets_len);
        let aux = (0..sieve_workers).map(|_| SieveBox::new(words)).collect();
        let buckets = Mutex::new(SegmentBuckets::new(
            params.max_iter,
            base.entries_per_segment,
            params.sieve_bits,
        ));
        Ok(Miner {
            params,
            base,
            sieve_workers,
            offsets,
            sieve: vec![0u64; words],
            aux,
            buckets,
            stats: MinerStats::default(),
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Mines one block: derives the target from the header and searches
    /// the window until it is exhausted or the observed height moves.
    /// Shares are reported through the sink as they are found.
    pub fn process(&mut self, block: &WorkInfo, height: &AtomicU64, sink: &dyn ShareSink) -> BlockStats {
        match target::target_from_block(block) {
            Some(target) => self.process_target(block, target, height, sink),
            None => {
                if self.params.verbose(Verbosity::Info) {
                    eprintln!(
                        "Unsupported difficulty {} for block {}, skipping",
                        block.target_compact, block.height
                    );
                }
                BlockStats::default()
            }
        }
    }

    /// Same as [`Miner::process`] with an explicit target, which is what
    /// benchmarks and tests want.
    pub fn process_target(
        &mut self,
        block: &WorkInfo,
        target: Uint,
        height: &AtomicU64,
        sink: &dyn ShareSink,
    ) -> BlockStats {
        let remainder =
            target::remainder_primorial(&target, &self.base.primorial, self.params.primorial_offset);
        let t_plus_r = target + remainder;
        if self.params.verbose(Verbosity::Info) {
            eprintln!("Block {}: difficulty {} bits", block.height, target.bits());
        }
        self.buckets.lock().unwrap().reset();

        let ctx = BlockCtx {
            params: &self.params,
            base: &self.base,
            block,
            target,
            t_plus_r,
            offsets: &self.offsets,
            buckets: &self.buckets,
            aux: &self.aux,
            work_q: JobQueue::new(VERIFY_QUEUE_CAP),
            done_q: JobQueue::new(DONE_QUEUE_CAP),
            test_q: JobQueue::new(DONE_QUEUE_CAP),
            height,
            sink,
            stats: &self.stats,
        };
        let sieve = &mut self.sieve;
        let sieve_workers = self.sieve_workers;
        let mut out = BlockStats::default();
        thread::scope(|s| {
            for _ in 1..ctx.params.threads {
                s.spawn(|| worker_loop(&ctx));
            }
            out = master_block(&ctx, sieve, sieve_workers);
            ctx.work_q.close();
        });
        if self.params.verbose(Verbosity::Verbose) {
            eprintln!(
                "Block {}: {} candidates in {} iterations",
                block.height, out.candidates, out.loops
            );
        }
        out
    }
}

fn master_block(ctx: &BlockCtx, sieve: &mut [u64], sieve_workers: usize) -> BlockStats {
    let params = ctx.params;
    let base = ctx.base;
    let m = params.primorial_number;
    let n_primes = base.n_primes();
    let sieve_size = params.sieve_size();
    let mut out = BlockStats::default();

    // Mod phase. All offsets must be in place before any sieving starts.
    let incr = ((n_primes - m) / MOD_JOBS).max(1);
    let mut n_jobs = 0;
    let mut start = m;
    while start < n_primes {
        let end = min(n_primes, start + incr);
        ctx.work_q.push_back(Job::Mod {
            start: start as u32,
            end: end as u32,
        });
        n_jobs += 1;
        start = end;
    }
    for _ in 0..n_jobs {
        ctx.done_q.pop().expect("ack queue closed");
    }

    let n_dense = base.n_dense;
    let n_sparse = base.n_sparse;
    let mut outstanding: i64 = 0;

    for loop_no in 0..params.max_iter {
        if ctx.block.height != ctx.height.load(Ordering::Relaxed) {
            break;
        }
        out.loops = loop_no + 1;

        for b in ctx.aux {
            // No sieve job is in flight here: the previous iteration
            // waited for every ack before merging.
            unsafe { b.words_mut() }.fill(0);
        }

        // Sparse stratum, one chunk per auxiliary bitmap, pushed to the
        // front of the queue so fresh workers pick sieving over verify
        // stragglers.
        let chunk = n_sparse / sieve_workers + 1;
        let mut n_sieve_jobs = 0;
        let mut rel = n_dense;
        let mut which = 0u32;
        while rel < n_dense + n_sparse {
            let lim = min(n_dense + n_sparse, rel + chunk);
            ctx.work_q.push_front(Job::Sieve {
                start: rel as u32,
                end: lim as u32,
                sieve_id: which,
            });
            which += 1;
            n_sieve_jobs += 1;
            rel = lim;
        }
        debug_assert!(n_sieve_jobs <= sieve_workers);

        // Dense stratum runs inline while the workers sieve.
        sieve.fill(0);
        {
            let dense = unsafe { ctx.offsets.range_mut(m, m + n_dense) };
            dense_sieve(sieve, sieve_size, &base.primes[m..m + n_dense], dense);
        }

        outstanding -= ctx.test_q.clear() as i64;
        for _ in 0..n_sieve_jobs {
            ctx.done_q.pop().expect("ack queue closed");
        }

        for b in ctx.aux {
            merge_into(sieve, unsafe { b.words() });
        }

        {
            let buckets = ctx.buckets.lock().unwrap();
            apply_segment(sieve, buckets.segment(loop_no as usize));
        }

        // Extraction. Position 0 is the base itself (and the pending
        // ring sentinel), never a candidate.
        sieve[0] |= 1;
        let mut job = CheckJob {
            loop_no,
            n_indexes: 0,
            indexes: [0; WORK_INDEXES],
        };
        let mut do_reset = false;
        'words: for b in 0..sieve.len() {
            let mut sb = !sieve[b];
            let mut sb_count = 0;
            while sb != 0 {
                sb_count += 1;
                if sb_count > 65 {
                    eprintln!("impossible: more than 65 candidates in a sieve word");
                    std::process::exit(1);
                }
                let high = sb.leading_zeros();
                let idx = (b as u32) * 64 + (63 - high);
                sb &= !(1u64 << (63 - high));
                out.candidates += 1;

                job.indexes[job.n_indexes as usize] = idx;
                job.n_indexes += 1;
                if job.n_indexes as usize == WORK_INDEXES {
                    ctx.work_q.push_back(Job::Check(job.clone()));
                    job.n_indexes = 0;
                    outstanding += 1;
                }
                outstanding -= ctx.test_q.clear() as i64;

                // Cheap enough to poll per candidate. Dropping queued
                // batches is safe; in-flight ones still submit valid
                // shares because offsets are absolute.
                if ctx.block.height != ctx.height.load(Ordering::Relaxed) {
                    outstanding -= ctx.work_q.clear() as i64;
                    do_reset = true;
                    break 'words;
                }
            }
        }
        if job.n_indexes > 0 {
            ctx.work_q.push_back(Job::Check(job));
            outstanding += 1;
        }
        if do_reset {
            break;
        }
    }

    // Drain verification before returning the block.
    outstanding -= ctx.test_q.clear() as i64;
    while outstanding > 0 {
        ctx.test_q.pop().expect("ack queue closed");
        outstanding -= 1;
        if ctx.block.height != ctx.height.load(Ordering::Relaxed) {
            outstanding -= ctx.work_q.clear() as i64;
        }
    }
    out
}

fn worker_loop(ctx: &BlockCtx) {
    let mut stack: Vec<u32> = Vec::with_capacity(OFFSET_STACK_SIZE);
    while let Some(job) = ctx.work_q.pop() {
        match job {
            Job::Mod { start, end } => {
                let (start, end) = (start as usize, end as usize);
                let res_end = min(end, ctx.base.offsets_len);
                // Mod ranges partition the table: exclusive access.
                let table: &mut [SixOff] = if start < res_end {
                    unsafe { ctx.offsets.range_mut(start, res_end) }
                } else {
                    &mut []
                };
                update_remainders(
                    ctx.base,
                    &ctx.t_plus_r,
                    ctx.params.max_increments(),
                    start,
                    end,
                    table,
                    &mut stack,
                    ctx.buckets,
                );
                ctx.done_q.push_back(1);
            }
            Job::Sieve {
                start,
                end,
                sieve_id,
            } => {
                let m = ctx.params.primorial_number;
                let (lo, hi) = (m + start as usize, m + end as usize);
                // One job per bitmap per iteration, and the sparse
                // partition is identical across iterations, so both the
                // bitmap and the offset range are exclusively ours.
                let sieve = unsafe { ctx.aux[sieve_id as usize].words_mut() };
                let offsets = unsafe { ctx.offsets.range_mut(lo, hi) };
                process_sieve(sieve, ctx.params.sieve_size(), &ctx.base.primes[lo..hi], offsets);
                ctx.done_q.push_back(1);
            }
            Job::Check(job) => {
                check_batch(ctx, &job);
                ctx.test_q.push_back(1);
            }
        }
    }
}

/// Verifies a batch of sieve survivors: Fermat base-2 on each member in
/// tuple order, stopping at the first failure. Sufficiently long
/// constellations become shares.
fn check_batch(ctx: &BlockCtx, job: &CheckJob) {
    let base_k = (job.loop_no as u64) * ctx.params.sieve_size() as u64;
    for &idx in &job.indexes[..job.n_indexes as usize] {
        let k = base_k + idx as u64;
        let mut n = ctx.t_plus_r + ctx.base.primorial * Uint::from(k);
        let offset = n - ctx.target;
        if !fermat2(&n) {
            continue;
        }
        let mut count = 1u32;
        for f in 1..6 {
            n = n + Uint::from(TUPLE_OFFSETS[f] as u64);
            if fermat2(&n) {
                count += 1;
                ctx.stats.tuples[count as usize].fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
        if count < ctx.params.tuples_threshold {
            continue;
        }
        // The wire format takes the low 32 bytes of the offset.
        let mut bytes = [0u8; 32];
        for (d, chunk) in offset.digits()[..4].iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&d.to_le_bytes());
        }
        ctx.sink.submit_share(ctx.block, &bytes, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Verbosity;

    #[derive(Default)]
    struct CollectSink {
        shares: Mutex<Vec<([u8; 32], u32)>>,
    }

    impl ShareSink for CollectSink {
        fn submit_share(&self, _work: &WorkInfo, offset: &[u8; 32], k_primes: u32) {
            self.shares.lock().unwrap().push((*offset, k_primes));
        }
    }

    fn test_params() -> Params {
        Params {
            sieve_max: 2000,
            sieve_bits: 12,
            max_iter: 2,
            primorial_number: 5,
            dense_limit: 100,
            primorial_offset: 97,
            threads: 3,
            tuples_threshold: 1,
            verbosity: Verbosity::Silent,
            ..Params::default()
        }
    }

    fn dummy_block(height: u64) -> WorkInfo {
        WorkInfo {
            header: [0u8; 80],
            target_compact: 0,
            height,
            handle: 1,
        }
    }

    fn test_ctx<'a>(
        params: &'a Params,
        base: &'a PrimeBase,
        block: &'a WorkInfo,
        target: Uint,
        t_plus_r: Uint,
        offsets: &'a OffsetsBox,
        buckets: &'a Mutex<SegmentBuckets>,
        height: &'a AtomicU64,
        sink: &'a dyn ShareSink,
        stats: &'a MinerStats,
    ) -> BlockCtx<'a> {
        BlockCtx {
            params,
            base,
            block,
            target,
            t_plus_r,
            offsets,
            buckets,
            aux: &[],
            work_q: JobQueue::new(4),
            done_q: JobQueue::new(4),
            test_q: JobQueue::new(4),
            height,
            sink,
            stats,
        }
    }

    // The sextuplet starting at 7 passes all six Fermat tests; a batch
    // whose first candidate is exactly 7 must submit one share of
    // length 6 and nothing else.
    #[test]
    fn test_check_batch_sextuplet() {
        let params = Params {
            tuples_threshold: 6,
            ..test_params()
        };
        let base = PrimeBase::new(&params).unwrap();
        assert_eq!(base.primorial, Uint::from(2310u64));

        let block = dummy_block(1);
        let offsets = OffsetsBox::new(0);
        let buckets = Mutex::new(SegmentBuckets::new(1, 1, params.sieve_bits));
        let height = AtomicU64::new(1);
        let sink = CollectSink::default();
        let stats = MinerStats::default();
        // Target 0 with base 7: candidate 0 is the known sextuplet
        // 7, 11, 13, 17, 19, 23; candidate 1 is 2317 = 7 * 331.
        let ctx = test_ctx(
            &params,
            &base,
            &block,
            Uint::from(0u64),
            Uint::from(7u64),
            &offsets,
            &buckets,
            &height,
            &sink,
            &stats,
        );

        let mut indexes = [0u32; WORK_INDEXES];
        indexes[1] = 1;
        check_batch(
            &ctx,
            &CheckJob {
                loop_no: 0,
                n_indexes: 2,
                indexes,
            },
        );

        let shares = sink.shares.lock().unwrap();
        assert_eq!(shares.len(), 1);
        let (offset, k) = shares[0];
        assert_eq!(k, 6);
        assert_eq!(offset[0], 7);
        assert!(offset[1..].iter().all(|&b| b == 0));
        assert_eq!(stats.tuples[6].load(Ordering::Relaxed), 1);
    }

    // Full pipeline over a 2-iteration window. Every submitted share
    // must decode to a value whose first k members pass Fermat base 2.
    #[test]
    fn test_process_block() {
        let params = test_params();
        let mut miner = Miner::new(params.clone()).unwrap();
        let block = dummy_block(42);
        let height = AtomicU64::new(42);
        let sink = CollectSink::default();
        let target = Uint::from(1_000_000_007u64);

        let stats = miner.process_target(&block, target, &height, &sink);
        assert_eq!(stats.loops, params.max_iter);
        assert!(stats.candidates > 0);

        let shares = sink.shares.lock().unwrap();
        assert!(!shares.is_empty());
        let biases = [0u64, 4, 6, 10, 12, 16];
        for (offset, k) in shares.iter() {
            assert!(*k >= 1 && *k <= 6);
            let mut digits = [0u64; 16];
            for (d, chunk) in digits.iter_mut().zip(offset.chunks_exact(8)) {
                *d = u64::from_le_bytes(chunk.try_into().unwrap());
            }
            let n0 = target + Uint::from_digits(digits);
            for &b in &biases[..*k as usize] {
                assert!(
                    fermat2(&(n0 + Uint::from(b))),
                    "member at bias {b} fails Fermat"
                );
            }
        }
    }

    // A block whose height is already superseded is abandoned before
    // the first iteration: no candidates, no shares, quick return.
    #[test]
    fn test_process_superseded() {
        let params = test_params();
        let mut miner = Miner::new(params).unwrap();
        let block = dummy_block(42);
        let height = AtomicU64::new(43);
        let sink = CollectSink::default();

        let stats = miner.process_target(&block, Uint::from(1_000_003u64), &height, &sink);
        assert_eq!(stats.loops, 0);
        assert_eq!(stats.candidates, 0);
        assert!(sink.shares.lock().unwrap().is_empty());
    }

    // Flipping the observed height from the share sink cancels the
    // block mid-run, with verification batches still in flight: the
    // master clears the queued batches, drains the rest and returns
    // well before the window is exhausted.
    #[test]
    fn test_process_cancelled_mid_block() {
        struct FlipSink<'a> {
            height: &'a AtomicU64,
            submissions: AtomicU64,
        }

        impl ShareSink for FlipSink<'_> {
            fn submit_share(&self, work: &WorkInfo, _offset: &[u8; 32], _k_primes: u32) {
                self.submissions.fetch_add(1, Ordering::Relaxed);
                self.height.store(work.height + 1, Ordering::Relaxed);
            }
        }

        // A weak sieve (tiny prime table) over many iterations yields
        // several verification batches per iteration, so the first
        // share lands while the master is still sieving or extracting.
        let params = Params {
            sieve_max: 100,
            sieve_bits: 12,
            max_iter: 64,
            primorial_number: 5,
            dense_limit: 100,
            primorial_offset: 97,
            threads: 3,
            tuples_threshold: 1,
            verbosity: Verbosity::Silent,
            ..Params::default()
        };
        let mut miner = Miner::new(params.clone()).unwrap();
        let block = dummy_block(7);
        let height = AtomicU64::new(7);
        let sink = FlipSink {
            height: &height,
            submissions: AtomicU64::new(0),
        };

        let stats = miner.process_target(&block, Uint::from(1_000_000_007u64), &height, &sink);
        assert!(sink.submissions.load(Ordering::Relaxed) >= 1);
        assert!(stats.candidates > 0);
        // The first share moved the height; everything after the
        // iteration in progress must have been abandoned.
        assert!(
            stats.loops < params.max_iter,
            "block ran to exhaustion despite the height change"
        );
    }
}

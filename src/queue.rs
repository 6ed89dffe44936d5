// Copyright 2024 The sextans authors. All rights reserved.
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Bounded blocking deques for job dispatch and completion accounting.
//!
//! One queue carries tagged jobs to the worker pool; two more carry
//! completion tokens back to the master. Sieve jobs are pushed to the
//! front so that they preempt verification stragglers from the previous
//! iteration: sieve latency gates the next candidate batch, verification
//! has no per-iteration ordering requirement.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct JobQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    cap: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> JobQueue<T> {
    pub fn new(cap: usize) -> Self {
        JobQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(cap),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            cap,
        }
    }

    pub fn push_back(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.cap && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        debug_assert!(!inner.closed);
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
    }

    pub fn push_front(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.cap && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        debug_assert!(!inner.closed);
        inner.items.push_front(item);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available. Returns None once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Drops all queued items, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.items.len();
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        n
    }

    /// Wakes all blocked poppers with None. Items still queued are
    /// delivered first.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-peer, per-TID completion queues.
//!
//! The completion-ring producer enqueues into a locked staging queue; the
//! worker periodically drains staging into its private working queue and
//! reaps from there. Backpressure is by eviction, never by blocking: the
//! oldest entries are dropped (and counted) when the combined depth or the
//! age bound is exceeded.

use {
    crate::completion::MsduCompletion,
    parking_lot::Mutex,
    std::collections::VecDeque,
    std::sync::atomic::{AtomicUsize, Ordering},
};

/// Combined staging + working depth bound.
pub const COMP_QUEUE_MAX_DEPTH: usize = 4096;

/// Entries older than this relative to the newest enqueued time reference
/// are evicted, microseconds.
pub const COMP_QUEUE_MAX_AGE_US: u64 = 100_000;

#[derive(Default)]
struct Staging {
    q: VecDeque<MsduCompletion>,
    newest_tsf: u64,
    age_out_drops: u64,
    overflow_drops: u64,
}

/// Counters accumulated on the producer side, collected at drain time.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct DrainCounters {
    pub age_out_drops: u64,
    pub overflow_drops: u64,
}

/// Result of reaping the working queue for one aggregate.
#[derive(Debug)]
pub struct DequeueResult {
    /// Completions matching the aggregate, in enqueue order.
    pub matched: Vec<MsduCompletion>,
    /// All requested MSDUs were found, or the queue holds only newer
    /// entries (nothing further will match this aggregate).
    pub complete: bool,
    pub age_out_drops: u64,
}

pub struct TidCompletionQueue {
    staging: Mutex<Staging>,
    working: VecDeque<MsduCompletion>,
    working_len: AtomicUsize,
}

impl Default for TidCompletionQueue {
    fn default() -> Self {
        Self {
            staging: Mutex::new(Staging::default()),
            working: VecDeque::new(),
            working_len: AtomicUsize::new(0),
        }
    }
}

impl TidCompletionQueue {
    /// Producer-side enqueue. Holds the staging lock only; applies the age
    /// and depth bounds by evicting the oldest staged entries.
    pub fn enqueue(&self, rec: MsduCompletion) {
        let mut staging = self.staging.lock();
        if rec.tsf > staging.newest_tsf {
            staging.newest_tsf = rec.tsf;
        }
        let newest = staging.newest_tsf;
        while let Some(front) = staging.q.front() {
            if front.tsf.saturating_add(COMP_QUEUE_MAX_AGE_US) < newest {
                staging.q.pop_front();
                staging.age_out_drops += 1;
            } else {
                break;
            }
        }
        let working_len = self.working_len.load(Ordering::Relaxed);
        while staging.q.len() + working_len >= COMP_QUEUE_MAX_DEPTH {
            if staging.q.pop_front().is_none() {
                // Working queue alone is at the bound; shed the newcomer.
                staging.overflow_drops += 1;
                return;
            }
            staging.overflow_drops += 1;
        }
        staging.q.push_back(rec);
    }

    /// Worker-side: moves everything staged into the working queue and
    /// collects the producer's drop counters.
    pub fn drain_to_working(&mut self) -> DrainCounters {
        let mut counters = DrainCounters::default();
        {
            let mut staging = self.staging.lock();
            self.working.extend(staging.q.drain(..));
            counters.age_out_drops = std::mem::take(&mut staging.age_out_drops);
            counters.overflow_drops = std::mem::take(&mut staging.overflow_drops);
        }
        while self.working.len() > COMP_QUEUE_MAX_DEPTH {
            self.working.pop_front();
            counters.overflow_drops += 1;
        }
        self.working_len.store(self.working.len(), Ordering::Relaxed);
        counters
    }

    /// Reaps up to `count` completions for `ppdu_id` whose time reference
    /// falls inside `[start_tsf, end_tsf]`. Excess-retry completions
    /// encountered on the way are diverted to `xretry`; any completion
    /// older than the window start is dropped as aged, whatever aggregate
    /// it belongs to.
    pub fn dequeue_matching(
        &mut self,
        ppdu_id: u32,
        count: usize,
        start_tsf: u64,
        end_tsf: u64,
        xretry: &mut Vec<MsduCompletion>,
    ) -> DequeueResult {
        let mut matched = Vec::new();
        let mut complete = false;
        let mut age_out_drops = 0;
        let mut i = 0;
        while i < self.working.len() {
            if matched.len() == count {
                complete = true;
                break;
            }
            if self.working[i].is_excess_retry() {
                // remove() preserves the order of the remainder.
                if let Some(rec) = self.working.remove(i) {
                    if rec.capture_eligible() {
                        xretry.push(rec);
                    }
                }
                continue;
            }
            let tsf = self.working[i].tsf;
            if tsf != 0 && tsf < start_tsf {
                self.working.remove(i);
                age_out_drops += 1;
                continue;
            }
            if self.working[i].ppdu_id == ppdu_id {
                if tsf > end_tsf {
                    complete = true;
                    break;
                }
                if let Some(rec) = self.working.remove(i) {
                    matched.push(rec);
                }
                continue;
            }
            if tsf > end_tsf {
                // Time-ordered queue: only newer entries remain.
                complete = true;
                break;
            }
            i += 1;
        }
        if matched.len() == count {
            complete = true;
        }
        self.working_len.store(self.working.len(), Ordering::Relaxed);
        DequeueResult { matched, complete, age_out_drops }
    }

    /// Drops everything on both sides. Returns the number of entries freed.
    pub fn flush(&mut self) -> usize {
        let mut staging = self.staging.lock();
        let n = staging.q.len() + self.working.len();
        staging.q.clear();
        drop(staging);
        self.working.clear();
        self.working_len.store(0, Ordering::Relaxed);
        n
    }

    pub fn working_len(&self) -> usize {
        self.working_len.load(Ordering::Relaxed)
    }
}

// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Batching of aggregate descriptors by transmission schedule.
//!
//! Reports for the aggregates of one schedule arrive as fragments, the last
//! one marked terminal. The collector holds fragments until the schedule is
//! complete, so the resolver sees every aggregate that could repair another
//! aggregate's holes in the same pass. A flush deadline bounds how long an
//! incomplete schedule can starve delivery, but only once a newer schedule
//! has been seen (the current schedule may simply still be transmitting).

use {
    crate::report::{PpduDesc, PpduReportFragment},
    std::collections::VecDeque,
    std::time::{Duration, Instant},
};

/// How long an incomplete schedule may hold up the ones behind it.
pub const SCHED_FLUSH_DEADLINE: Duration = Duration::from_millis(10);

struct ScheduleBatch {
    sched_cmdid: u32,
    descs: Vec<PpduDesc>,
    first_seen: Instant,
    terminal: bool,
}

/// Why a schedule was released.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReleaseReason {
    Complete,
    DeadlineFlush,
}

#[derive(Default)]
pub struct ScheduleCollector {
    /// Oldest schedule at the front; fragments arrive roughly in schedule
    /// order so this stays short.
    schedules: VecDeque<ScheduleBatch>,
}

impl ScheduleCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, frag: PpduReportFragment, now: Instant) {
        let terminal = frag.terminal;
        let desc = frag.desc;
        let batch = match self.schedules.iter_mut().find(|b| b.sched_cmdid == desc.sched_cmdid) {
            Some(batch) => batch,
            None => {
                self.schedules.push_back(ScheduleBatch {
                    sched_cmdid: desc.sched_cmdid,
                    descs: Vec::new(),
                    first_seen: now,
                    terminal: false,
                });
                self.schedules.back_mut().unwrap_or_else(|| unreachable!())
            }
        };
        match batch.descs.iter_mut().find(|d| d.ppdu_id == desc.ppdu_id) {
            Some(existing) => existing.merge_fragment(desc),
            None => batch.descs.push(desc),
        }
        batch.terminal |= terminal;
    }

    /// Releases the oldest schedule if it is complete, or if its flush
    /// deadline passed and a newer schedule is already collecting. Schedules
    /// are only ever released oldest-first.
    pub fn pop_ready(&mut self, now: Instant) -> Option<(Vec<PpduDesc>, ReleaseReason)> {
        let front = self.schedules.front()?;
        let reason = if front.terminal {
            ReleaseReason::Complete
        } else if self.schedules.len() > 1
            && now.saturating_duration_since(front.first_seen) >= SCHED_FLUSH_DEADLINE
        {
            ReleaseReason::DeadlineFlush
        } else {
            return None;
        };
        let batch = self.schedules.pop_front().unwrap_or_else(|| unreachable!());
        Some((batch.descs, reason))
    }

    /// Releases everything regardless of completeness, oldest first.
    pub fn drain_all(&mut self) -> Vec<Vec<PpduDesc>> {
        self.schedules.drain(..).map(|b| b.descs).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{report::PpduKind, test_utils};

    fn frag(sched: u32, ppdu_id: u32, terminal: bool) -> PpduReportFragment {
        let mut desc = test_utils::ppdu_desc(ppdu_id, 1, PpduKind::Data);
        desc.sched_cmdid = sched;
        PpduReportFragment { desc, terminal }
    }

    #[test]
    fn releases_on_terminal_fragment() {
        let mut c = ScheduleCollector::new();
        let now = Instant::now();
        c.ingest(frag(5, 100, false), now);
        c.ingest(frag(5, 101, false), now);
        assert!(c.pop_ready(now).is_none());
        c.ingest(frag(5, 102, true), now);
        let (descs, reason) = c.pop_ready(now).unwrap();
        assert_eq!(reason, ReleaseReason::Complete);
        assert_eq!(descs.iter().map(|d| d.ppdu_id).collect::<Vec<_>>(), vec![100, 101, 102]);
        assert!(c.is_empty());
    }

    #[test]
    fn merges_fragments_of_same_aggregate() {
        let mut c = ScheduleCollector::new();
        let now = Instant::now();
        c.ingest(frag(5, 100, false), now);
        c.ingest(frag(5, 100, true), now);
        let (descs, _) = c.pop_ready(now).unwrap();
        assert_eq!(descs.len(), 1);
        // Same user in both fragments: one merged record.
        assert_eq!(descs[0].users.len(), 1);
    }

    #[test]
    fn deadline_flush_requires_newer_schedule() {
        let mut c = ScheduleCollector::new();
        let t0 = Instant::now();
        c.ingest(frag(5, 100, false), t0);
        let late = t0 + SCHED_FLUSH_DEADLINE + Duration::from_millis(1);
        // Deadline passed but nothing newer: still possibly in flight.
        assert!(c.pop_ready(late).is_none());
        c.ingest(frag(6, 200, false), late);
        let (descs, reason) = c.pop_ready(late).unwrap();
        assert_eq!(reason, ReleaseReason::DeadlineFlush);
        assert_eq!(descs[0].ppdu_id, 100);
        // The newer schedule is not releasable yet.
        assert!(c.pop_ready(late).is_none());
    }

    #[test]
    fn oldest_first_even_when_newer_completes() {
        let mut c = ScheduleCollector::new();
        let t0 = Instant::now();
        c.ingest(frag(5, 100, false), t0);
        c.ingest(frag(6, 200, true), t0);
        // Front is incomplete and within deadline; nothing is released.
        assert!(c.pop_ready(t0).is_none());
        let late = t0 + SCHED_FLUSH_DEADLINE;
        let (descs, _) = c.pop_ready(late).unwrap();
        assert_eq!(descs[0].ppdu_id, 100);
        let (descs, reason) = c.pop_ready(late).unwrap();
        assert_eq!(reason, ReleaseReason::Complete);
        assert_eq!(descs[0].ppdu_id, 200);
    }

    #[test]
    fn drain_all_releases_everything() {
        let mut c = ScheduleCollector::new();
        let now = Instant::now();
        c.ingest(frag(5, 100, false), now);
        c.ingest(frag(6, 200, false), now);
        let batches = c.drain_all();
        assert_eq!(batches.len(), 2);
        assert!(c.is_empty());
    }
}

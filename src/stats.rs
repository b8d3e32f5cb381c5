// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capture counters. Attrition is counted, never propagated as an error.

use crate::report::SGEN_FRAME_TYPE_COUNT;

/// Engine-wide counters, snapshotted by `TxCaptureEngine::stats()`.
#[derive(Clone, Debug, Default)]
pub struct CaptureStats {
    /// Aggregate report fragments accepted into staging.
    pub ppdu_reports: u64,
    /// Report fragments dropped at staging (depth bound or capture off).
    pub ppdu_dropped: u64,
    /// Schedules fully processed.
    pub schedules_processed: u64,
    /// Schedules flushed by the starvation deadline before their terminal
    /// fragment arrived.
    pub schedules_flushed: u64,
    /// Aggregates delivered through the data path.
    pub ppdu_delivered: u64,
    /// Frames handed to the sink, all paths.
    pub frames_delivered: u64,
    /// Management payloads staged.
    pub mgmt_staged: u64,
    /// Management payloads dropped as stale or unmatched.
    pub mgmt_dropped: u64,
    /// Histogram over firmware self-generated frame tags.
    pub sgen_frame_types: [u64; SGEN_FRAME_TYPE_COUNT],
}

/// Per-peer counters.
#[derive(Clone, Debug, Default)]
pub struct PeerStats {
    pub frames_delivered: u64,
    /// Worker-side completion queue depth across all TIDs at snapshot time.
    pub comp_queue_depth: u64,
    /// Completions evicted for exceeding the queue age bound.
    pub comp_age_out_drops: u64,
    /// Completions evicted for exceeding the queue depth bound.
    pub comp_overflow_drops: u64,
    /// Reports whose attempted count disagreed with the enqueue bitmap.
    pub bitmap_mismatch: u64,
    /// MSDU chains dropped for duplicate or missing chain markers.
    pub restitch_artifacts: u64,
    /// Pending aggregates force-delivered with holes on queue overflow.
    pub forced_evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zeroed() {
        let s = CaptureStats::default();
        assert_eq!(s.ppdu_reports, 0);
        assert_eq!(s.sgen_frame_types, [0; SGEN_FRAME_TYPE_COUNT]);
        let p = PeerStats::default();
        assert_eq!(p.forced_evictions, 0);
    }
}

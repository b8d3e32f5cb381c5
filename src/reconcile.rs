// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconciliation of the enqueue and acknowledgment bitmaps of one user
//! record.
//!
//! The enqueue bitmap is based at the window start sequence number; the ack
//! bitmap is based at the (possibly different) block-ack starting sequence.
//! Reconciliation re-bases the ack bitmap, derives the failure bitmap and
//! window size, and repairs firmware count inconsistencies.

use {
    crate::{
        report::UserRecord,
        seq::{seq_delta, SeqBitmap},
    },
    log::{debug, warn},
};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The attempted count disagreed with the enqueue bitmap and was raised.
    pub clamped: bool,
    /// Firmware reported more successes than attempts; the aligned ack
    /// bitmap replaced the enqueue bitmap for this pass.
    pub extra_acked: bool,
}

pub fn reconcile_user(user: &mut UserRecord) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let aligned_ack = rebase_bitmap(&user.ba_bitmap, user.ba_seq_no, user.start_seq);

    if user.mpdu_success > user.mpdu_tried {
        // Firmware workaround: acks reported for units the enqueue bitmap
        // never recorded. Trust the ack side for this window.
        debug!(
            "peer {} tid {}: {} acked > {} tried, adopting ack bitmap",
            user.peer_id, user.tid, user.mpdu_success, user.mpdu_tried
        );
        user.enq_bitmap = aligned_ack;
        outcome.extra_acked = true;
    }

    user.failed_bitmap = user.enq_bitmap.and_not(&aligned_ack);
    user.ba_bitmap = aligned_ack;
    user.ba_seq_no = user.start_seq;

    let last_set = user.enq_bitmap.highest_set_bit().unwrap_or(0);
    user.ba_size = last_set as u16 + 1;
    user.last_enq_seq = user.seq_at(last_set);

    let enq_count = user.enq_bitmap.count_ones() as u16;
    if user.mpdu_tried < enq_count {
        warn!(
            "peer {} tid {}: attempted count {} below enqueue population {}",
            user.peer_id, user.tid, user.mpdu_tried, enq_count
        );
        user.mpdu_tried = enq_count;
        outcome.clamped = true;
    }

    outcome
}

/// Re-bases `bitmap` from `from_seq` to `to_seq` in the 12-bit space.
pub fn rebase_bitmap(bitmap: &SeqBitmap, from_seq: u16, to_seq: u16) -> SeqBitmap {
    let delta = seq_delta(to_seq, from_seq);
    if delta >= 0 {
        bitmap.shifted_up(delta as usize)
    } else {
        bitmap.shifted_down((-delta) as usize)
    }
}

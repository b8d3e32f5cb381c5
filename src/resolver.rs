// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cross-aggregate recovery.
//!
//! A failed unit's bytes usually exist somewhere else: a later aggregate in
//! the same schedule that retransmitted it, a future schedule, or the
//! excess-retry side channel. The resolver fills an aggregate's holes from
//! those sources and holds aggregates with unresolved holes in a bounded
//! per-peer/TID pending queue so that delivery stays in transmit order.

use {
    crate::{
        buffer::FrameBuffer,
        dispatch::Dispatcher,
        peer::{PeerState, TidState},
        report::PpduDesc,
        seq::seq_offset,
    },
    log::{debug, warn},
};

/// Bound on aggregates parked per peer/TID. Beyond it the oldest is
/// force-delivered with its holes left absent.
pub const MAX_PENDING_PPDUS: usize = 32;

/// Distributes a user's restitched MPDUs into their window slots. Offsets
/// whose unit is enqueued and acknowledged consume the queue in order;
/// failed offsets stay empty for the recovery passes. A queue that comes up
/// short converts the remaining acknowledged offsets into holes.
pub fn assign_slots(desc: &mut PpduDesc) {
    let user = desc.user_mut();
    let ba_size = usize::from(user.ba_size);
    user.mpdus = vec![None; ba_size];
    for offset in 0..ba_size {
        if !user.enq_bitmap.get(offset) || user.failed_bitmap.get(offset) {
            continue;
        }
        match user.mpdu_q.pop_front() {
            Some(frame) => user.mpdus[offset] = Some(frame),
            None => user.failed_bitmap.set(offset),
        }
    }
    user.pending_retries = user.failed_bitmap.count_ones() as u16;
}

/// For every aggregate in the batch, fills holes by cloning the same
/// sequence number from a later aggregate of the same peer/TID.
pub fn fill_holes_in_batch(slots: &mut [Option<PpduDesc>]) {
    for i in 0..slots.len() {
        let mut desc = match slots[i].take() {
            Some(desc) => desc,
            None => continue,
        };
        {
            let later = &slots[i + 1..];
            let (peer_id, tid) = (desc.user().peer_id, desc.user().tid);
            let user = desc.user_mut();
            for offset in 0..usize::from(user.ba_size) {
                if !user.failed_bitmap.get(offset) {
                    continue;
                }
                let seq = user.seq_at(offset);
                if let Some(frame) = clone_seq_from_batch(later, peer_id, tid, seq) {
                    user.mpdus[offset] = Some(frame);
                    user.failed_bitmap.clear(offset);
                    user.pending_retries = user.pending_retries.saturating_sub(1);
                }
            }
        }
        slots[i] = Some(desc);
    }
}

fn clone_seq_from_batch(
    descs: &[Option<PpduDesc>],
    peer_id: u16,
    tid: u8,
    seq: u16,
) -> Option<FrameBuffer> {
    for slot in descs {
        let desc = match slot {
            Some(desc) => desc,
            None => continue,
        };
        let user = desc.user();
        if user.peer_id != peer_id || user.tid != tid {
            continue;
        }
        let offset = seq_offset(user.start_seq, seq);
        if offset >= usize::from(user.ba_size) || !user.enq_bitmap.get(offset) {
            continue;
        }
        if let Some(frame) = user.mpdus.get(offset).and_then(|s| s.as_ref()) {
            return Some(frame.clone());
        }
    }
    None
}

/// Full recovery pass for one peer/TID after a schedule batch resolved its
/// in-batch holes: repair the pending queue from the batch, park the
/// batch's aggregates behind it, splice from the excess-retry channel,
/// deliver every fully resolved aggregate from the front, and enforce the
/// pending bound. Returns the number of aggregates delivered.
pub fn resolve_peer_tid(
    peer: &mut PeerState,
    tid: u8,
    dispatcher: &mut Dispatcher,
    batch: &mut [Option<PpduDesc>],
) -> u64 {
    let peer_id = peer.peer_id;
    let vdev_addr = peer.vdev_addr;
    let tid_state = match peer.tids.get_mut(usize::from(tid)) {
        Some(tid_state) => tid_state,
        None => return 0,
    };
    let stats = &mut peer.stats;

    fill_pending_from_batch(tid_state, batch, peer_id, tid);
    take_batch_into_pending(tid_state, batch, peer_id, tid);
    apply_xretries(tid_state);
    tid_state.xretry_mpdus.clear();

    let mut delivered = deliver_ready(tid_state, vdev_addr, dispatcher, stats);
    while tid_state.pending_ppdus.len() > MAX_PENDING_PPDUS {
        if let Some(mut desc) = tid_state.pending_ppdus.pop_front() {
            warn!(
                "peer {} tid {}: pending bound hit, forcing ppdu {:#x} out with {} holes",
                peer_id,
                tid,
                desc.ppdu_id,
                desc.user().pending_retries
            );
            stats.forced_evictions += 1;
            dispatcher.deliver_data_ppdu(&mut desc, vdev_addr, stats);
            delivered += 1;
        }
    }
    delivered
}

fn fill_pending_from_batch(
    tid_state: &mut TidState,
    batch: &[Option<PpduDesc>],
    peer_id: u16,
    tid: u8,
) {
    for pend in tid_state.pending_ppdus.iter_mut() {
        if pend.user().pending_retries == 0 {
            continue;
        }
        let user = pend.user_mut();
        for offset in 0..usize::from(user.ba_size) {
            if !user.failed_bitmap.get(offset) {
                continue;
            }
            let seq = user.seq_at(offset);
            if let Some(frame) = clone_seq_from_batch(batch, peer_id, tid, seq) {
                user.mpdus[offset] = Some(frame);
                user.failed_bitmap.clear(offset);
                user.pending_retries = user.pending_retries.saturating_sub(1);
            }
        }
    }
}

fn take_batch_into_pending(
    tid_state: &mut TidState,
    batch: &mut [Option<PpduDesc>],
    peer_id: u16,
    tid: u8,
) {
    for slot in batch.iter_mut() {
        let matches = slot
            .as_ref()
            .map_or(false, |d| d.user().peer_id == peer_id && d.user().tid == tid);
        if matches {
            if let Some(desc) = slot.take() {
                tid_state.pending_ppdus.push_back(desc);
            }
        }
    }
}

/// Splices units from the excess-retry side channel into pending holes,
/// matching by aggregate id. A unit whose retry budget is exhausted is
/// moved; one that may fly again is cloned and kept.
pub fn apply_xretries(tid_state: &mut TidState) {
    let TidState { pending_ppdus, xretry_mpdus, .. } = tid_state;
    for pend in pending_ppdus.iter_mut() {
        if pend.user().pending_retries == 0 {
            continue;
        }
        let ppdu_id = pend.ppdu_id;
        let user = pend.user_mut();
        for offset in 0..usize::from(user.ba_size) {
            if !user.failed_bitmap.get(offset) {
                continue;
            }
            let pos = match xretry_mpdus.iter().position(|x| x.ppdu_id == ppdu_id) {
                Some(pos) => pos,
                None => break,
            };
            xretry_mpdus[pos].transmit_cnt = xretry_mpdus[pos].transmit_cnt.saturating_sub(1);
            let frame = if xretry_mpdus[pos].transmit_cnt == 0 {
                match xretry_mpdus.remove(pos) {
                    Some(x) => x.frame,
                    None => break,
                }
            } else {
                xretry_mpdus[pos].frame.clone()
            };
            debug!("ppdu {:#x}: hole at offset {} spliced from retry channel", ppdu_id, offset);
            user.mpdus[offset] = Some(frame);
            user.failed_bitmap.clear(offset);
            user.pending_retries = user.pending_retries.saturating_sub(1);
        }
    }
}

/// Delivers fully resolved aggregates from the front of the pending queue.
/// Stops at the first aggregate still holding holes so transmit order is
/// preserved.
pub fn deliver_ready(
    tid_state: &mut TidState,
    vdev_addr: crate::mac::MacAddr,
    dispatcher: &mut Dispatcher,
    stats: &mut crate::stats::PeerStats,
) -> u64 {
    let mut delivered = 0;
    while tid_state
        .pending_ppdus
        .front()
        .map_or(false, |d| d.user().pending_retries == 0)
    {
        if let Some(mut desc) = tid_state.pending_ppdus.pop_front() {
            dispatcher.deliver_data_ppdu(&mut desc, vdev_addr, stats);
            delivered += 1;
        }
    }
    delivered
}

// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-peer capture state: one completion queue, pending-aggregate queue and
//! excess-retry side channel per TID, plus the shared 802.11 header cache.

use {
    crate::{
        buffer::FrameBuffer,
        comp_queue::TidCompletionQueue,
        mac::MacAddr,
        report::PpduDesc,
        restitch::{HeaderCache, MAX_TIDS},
        stats::PeerStats,
    },
    std::collections::VecDeque,
};

/// One reconstructed MPDU on the excess-retry side channel.
#[derive(Debug)]
pub struct XretryMpdu {
    pub frame: FrameBuffer,
    /// Aggregate the unit last flew in.
    pub ppdu_id: u32,
    /// Remaining retry budget when the queue released it.
    pub transmit_cnt: u8,
}

#[derive(Default)]
pub struct TidState {
    pub comp_queue: TidCompletionQueue,
    /// Aggregates waiting on holes, oldest first. Delivery for this
    /// peer/TID only ever happens from the front.
    pub pending_ppdus: VecDeque<PpduDesc>,
    pub xretry_mpdus: VecDeque<XretryMpdu>,
}

impl TidState {
    /// Drops all held state. Returns the number of aggregates released.
    pub fn flush(&mut self) -> usize {
        self.comp_queue.flush();
        self.xretry_mpdus.clear();
        let n = self.pending_ppdus.len();
        self.pending_ppdus.clear();
        n
    }
}

pub struct PeerState {
    pub peer_id: u16,
    pub mac_addr: MacAddr,
    /// Address of the transmitting interface this peer is associated to.
    pub vdev_addr: MacAddr,
    /// Per-peer capture filter, effective in per-peer mode.
    pub enabled: bool,
    pub header_cache: HeaderCache,
    pub(crate) tids: Vec<TidState>,
    pub stats: PeerStats,
}

impl PeerState {
    pub fn new(peer_id: u16, peer_addr: MacAddr, vdev_addr: MacAddr) -> Self {
        let mut tids = Vec::with_capacity(MAX_TIDS);
        tids.resize_with(MAX_TIDS, TidState::default);
        Self {
            peer_id,
            mac_addr: peer_addr,
            vdev_addr,
            enabled: true,
            header_cache: HeaderCache::new(peer_addr, vdev_addr),
            tids,
            stats: PeerStats::default(),
        }
    }

    pub fn tid_ref(&self, tid: u8) -> Option<&TidState> {
        self.tids.get(usize::from(tid))
    }

    /// Drops queued state on every TID. Returns aggregates released.
    pub fn flush(&mut self) -> usize {
        self.tids.iter_mut().map(|t| t.flush()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{report::PpduKind, test_utils};

    #[test]
    fn tid_range() {
        let peer = PeerState::new(1, [2; 6], [4; 6]);
        assert!(peer.tid_ref(0).is_some());
        assert!(peer.tid_ref(16).is_some());
        assert!(peer.tid_ref(17).is_none());
    }

    #[test]
    fn flush_releases_pending() {
        let mut peer = PeerState::new(1, [2; 6], [4; 6]);
        let tid = &mut peer.tids[3];
        tid.pending_ppdus.push_back(test_utils::ppdu_desc(9, 1, PpduKind::Data));
        tid.xretry_mpdus.push_back(XretryMpdu {
            frame: FrameBuffer::new(vec![1]),
            ppdu_id: 9,
            transmit_cnt: 1,
        });
        assert_eq!(peer.flush(), 1);
        assert!(peer.tids[3].pending_ppdus.is_empty());
        assert!(peer.tids[3].xretry_mpdus.is_empty());
    }
}

// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconstruction of 802.11 MPDUs from completion-ring MSDU chains.
//!
//! Completions carry the payload in Ethernet framing; the air header was
//! attached by hardware and never reached the host. The restitcher strips
//! the Ethernet header, synthesizes the 802.11 data header plus LLC/SNAP
//! from the aggregate report and the per-peer header cache, and
//! reassembles chained MSDUs into one MPDU per chain.

use {
    crate::{
        buffer::FrameBuffer,
        completion::MsduCompletion,
        mac::{
            self, DataHdr, DataHdr4, FrameControl, LlcHdr, MacAddr, QosControl, SequenceControl,
        },
        report::{PpduDesc, UserRecord},
    },
    log::trace,
    zerocopy::AsBytes,
};

/// Reserved TID reported for non-QoS traffic.
pub const NON_QOS_TID: u8 = 16;

/// Number of TID queues per peer (QoS TIDs plus the non-QoS slot).
pub const MAX_TIDS: usize = 17;

/// Cached 802.11 header fields for one peer, refreshed once per aggregate.
pub struct HeaderCache {
    frame_ctrl: FrameControl,
    duration: u16,
    /// Receiver address: the peer.
    addr1: MacAddr,
    /// Transmitter address: the owning interface.
    addr2: MacAddr,
    qos_ctrl: QosControl,
    last_ppdu_id: u32,
}

impl HeaderCache {
    pub fn new(peer_addr: MacAddr, vdev_addr: MacAddr) -> Self {
        let mut frame_ctrl = FrameControl::new(mac::FRAME_TYPE_DATA, mac::DATA_SUBTYPE_QOS_DATA);
        frame_ctrl.set_from_ds(true);
        Self {
            frame_ctrl,
            duration: 0,
            addr1: peer_addr,
            addr2: vdev_addr,
            qos_ctrl: QosControl::default(),
            last_ppdu_id: 0,
        }
    }

    /// Adopts the aggregate's header fields once per aggregate id; repeated
    /// calls for the same aggregate are no-ops so retried units reuse the
    /// fields of their first transmission.
    pub fn refresh(&mut self, desc: &PpduDesc, user: &UserRecord) {
        if desc.ppdu_id == self.last_ppdu_id {
            return;
        }
        self.last_ppdu_id = desc.ppdu_id;
        let reported = if user.frame_ctrl != 0 { user.frame_ctrl } else { desc.frame_ctrl };
        if FrameControl(reported).frame_type() == mac::FRAME_TYPE_DATA {
            self.frame_ctrl = FrameControl(reported);
        }
        self.duration = desc.tx_duration;
        self.qos_ctrl = QosControl(user.qos_ctrl);
    }

    fn is_wds(&self) -> bool {
        self.frame_ctrl.to_ds() && self.frame_ctrl.from_ds()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestitchOutcome {
    /// MPDUs appended to the user's queue.
    pub restitched: u64,
    /// Chains or stray MSDUs dropped for duplicate/missing chain markers or
    /// truncated payloads.
    pub artifacts: u64,
}

/// Reassembles `msdus` (in completion order) into MPDUs on `user.mpdu_q`.
pub fn restitch_mpdus(
    cache: &mut HeaderCache,
    desc: &PpduDesc,
    user: &mut UserRecord,
    msdus: Vec<MsduCompletion>,
) -> RestitchOutcome {
    let mut frames = Vec::new();
    let outcome = restitch_chains(cache, desc, user, msdus, &mut frames);
    for (frame, _) in frames {
        user.mpdu_q.push_back(frame);
    }
    outcome
}

/// Chain-reassembly core. Each completed chain is emitted as one MPDU
/// paired with the first completion of the chain (for its bookkeeping
/// fields, e.g. the remaining retry budget on the excess-retry path).
pub fn restitch_chains(
    cache: &mut HeaderCache,
    desc: &PpduDesc,
    user: &UserRecord,
    msdus: Vec<MsduCompletion>,
    out: &mut Vec<(FrameBuffer, MsduCompletion)>,
) -> RestitchOutcome {
    let mut outcome = RestitchOutcome::default();
    let mut chain: Vec<MsduCompletion> = Vec::new();
    for rec in msdus {
        if rec.first_msdu {
            if !chain.is_empty() {
                // New chain started before the previous one terminated.
                trace!("ppdu {:#x}: unterminated msdu chain dropped", desc.ppdu_id);
                outcome.artifacts += 1;
                chain.clear();
            }
        } else if chain.is_empty() {
            // Continuation without a first fragment.
            trace!("ppdu {:#x}: orphan msdu continuation dropped", desc.ppdu_id);
            outcome.artifacts += 1;
            continue;
        }
        let last = rec.last_msdu;
        chain.push(rec);
        if last {
            match build_mpdu(cache, desc, user, &chain) {
                Some(frame) => {
                    let first = chain.swap_remove(0);
                    out.push((frame, first));
                    outcome.restitched += 1;
                }
                None => outcome.artifacts += 1,
            }
            chain.clear();
        }
    }
    if !chain.is_empty() {
        outcome.artifacts += 1;
    }
    outcome
}

fn build_mpdu(
    cache: &mut HeaderCache,
    desc: &PpduDesc,
    user: &UserRecord,
    chain: &[MsduCompletion],
) -> Option<FrameBuffer> {
    let first = chain.first()?;
    let (dst, src, ethertype) = mac::parse_ether_hdr(first.payload.bytes()).ok()?;
    cache.refresh(desc, user);

    let qos = user.tid < NON_QOS_TID;
    let mut frame_ctrl = cache.frame_ctrl;
    if !qos && frame_ctrl.frame_subtype() == mac::DATA_SUBTYPE_QOS_DATA {
        frame_ctrl = FrameControl::new(mac::FRAME_TYPE_DATA, 0);
        frame_ctrl.set_from_ds(cache.frame_ctrl.from_ds());
        frame_ctrl.set_to_ds(cache.frame_ctrl.to_ds());
    }

    let body_len: usize = chain.iter().map(|r| r.payload.len()).sum();
    let mut out = Vec::with_capacity(std::mem::size_of::<DataHdr4>() + 10 + body_len);
    if cache.is_wds() {
        let hdr = DataHdr4 {
            frame_ctrl,
            duration: cache.duration,
            addr1: cache.addr1,
            addr2: cache.addr2,
            addr3: dst,
            seq_ctrl: SequenceControl::default(),
            addr4: src,
        };
        out.extend_from_slice(hdr.as_bytes());
    } else {
        let hdr = DataHdr {
            frame_ctrl,
            duration: cache.duration,
            addr1: cache.addr1,
            addr2: cache.addr2,
            addr3: src,
            seq_ctrl: SequenceControl::default(),
        };
        out.extend_from_slice(hdr.as_bytes());
    }
    if qos {
        let qos_ctrl = if cache.qos_ctrl.0 != 0 {
            cache.qos_ctrl
        } else {
            QosControl::from_tid(user.tid)
        };
        out.extend_from_slice(&qos_ctrl.0.to_le_bytes());
    }
    let llc: LlcHdr = mac::make_snap_llc_hdr(ethertype);
    out.extend_from_slice(llc.as_bytes());
    out.extend_from_slice(&first.payload.bytes()[mac::ETHER_HDR_LEN..]);
    for rec in &chain[1..] {
        out.extend_from_slice(rec.payload.bytes());
    }
    Some(FrameBuffer::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        completion::CompletionStatus,
        report::{PpduKind, UserRecord},
        test_utils,
    };

    const PEER: MacAddr = [2, 2, 2, 2, 2, 2];
    const VDEV: MacAddr = [4, 4, 4, 4, 4, 4];
    const DST: [u8; 6] = [6, 6, 6, 6, 6, 6];
    const SRC: [u8; 6] = [8, 8, 8, 8, 8, 8];

    fn eth_payload(body: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&DST);
        v.extend_from_slice(&SRC);
        v.extend_from_slice(&0x0800u16.to_be_bytes());
        v.extend_from_slice(body);
        v
    }

    fn msdu(first: bool, last: bool, payload: Vec<u8>) -> MsduCompletion {
        MsduCompletion {
            ppdu_id: 0x30,
            peer_id: 1,
            tid: 5,
            first_msdu: first,
            last_msdu: last,
            transmit_cnt: 1,
            tsf: 100,
            status: CompletionStatus::Acked,
            payload: FrameBuffer::new(payload),
        }
    }

    fn setup() -> (HeaderCache, PpduDesc, UserRecord) {
        let mut desc = test_utils::ppdu_desc(0x30, 1, PpduKind::Data);
        desc.tx_duration = 0x60;
        let mut user = UserRecord::default();
        user.peer_id = 1;
        user.tid = 5;
        (HeaderCache::new(PEER, VDEV), desc, user)
    }

    #[test]
    fn single_msdu_frame_layout() {
        let (mut cache, desc, mut user) = setup();
        let out = restitch_mpdus(&mut cache, &desc, &mut user, vec![msdu(true, true, eth_payload(&[0xaa, 0xbb]))]);
        assert_eq!(out, RestitchOutcome { restitched: 1, artifacts: 0 });
        let frame = user.mpdu_q.pop_front().unwrap();
        let bytes = frame.bytes();
        // QoS data, FromDS.
        assert_eq!(&bytes[0..2], &[0x88, 0x02]);
        // Duration from the aggregate.
        assert_eq!(&bytes[2..4], &[0x60, 0x00]);
        assert_eq!(&bytes[4..10], &PEER);
        assert_eq!(&bytes[10..16], &VDEV);
        assert_eq!(&bytes[16..22], &SRC);
        // Sequence control left zero until delivery.
        assert_eq!(&bytes[22..24], &[0, 0]);
        // QoS control carries the TID.
        assert_eq!(&bytes[24..26], &[5, 0]);
        // LLC/SNAP with the Ethernet protocol id.
        assert_eq!(&bytes[26..34], &[0xaa, 0xaa, 0x03, 0, 0, 0, 0x08, 0x00]);
        assert_eq!(&bytes[34..], &[0xaa, 0xbb]);
    }

    #[test]
    fn chained_msdus_concatenate() {
        let (mut cache, desc, mut user) = setup();
        let msdus = vec![
            msdu(true, false, eth_payload(&[1, 2])),
            msdu(false, false, vec![3, 4]),
            msdu(false, true, vec![5]),
        ];
        let out = restitch_mpdus(&mut cache, &desc, &mut user, msdus);
        assert_eq!(out.restitched, 1);
        let frame = user.mpdu_q.pop_front().unwrap();
        assert_eq!(&frame.bytes()[34..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_first_drops_open_chain_and_continues() {
        let (mut cache, desc, mut user) = setup();
        let msdus = vec![
            msdu(true, false, eth_payload(&[1])),
            msdu(true, true, eth_payload(&[2])),
            msdu(true, true, eth_payload(&[3])),
        ];
        let out = restitch_mpdus(&mut cache, &desc, &mut user, msdus);
        assert_eq!(out, RestitchOutcome { restitched: 2, artifacts: 1 });
        assert_eq!(user.mpdu_q.len(), 2);
    }

    #[test]
    fn orphan_continuation_dropped() {
        let (mut cache, desc, mut user) = setup();
        let msdus = vec![msdu(false, true, vec![9]), msdu(true, true, eth_payload(&[1]))];
        let out = restitch_mpdus(&mut cache, &desc, &mut user, msdus);
        assert_eq!(out, RestitchOutcome { restitched: 1, artifacts: 1 });
    }

    #[test]
    fn trailing_open_chain_dropped() {
        let (mut cache, desc, mut user) = setup();
        let out =
            restitch_mpdus(&mut cache, &desc, &mut user, vec![msdu(true, false, eth_payload(&[1]))]);
        assert_eq!(out, RestitchOutcome { restitched: 0, artifacts: 1 });
    }

    #[test]
    fn truncated_ether_header_counted() {
        let (mut cache, desc, mut user) = setup();
        let out = restitch_mpdus(&mut cache, &desc, &mut user, vec![msdu(true, true, vec![1, 2])]);
        assert_eq!(out, RestitchOutcome { restitched: 0, artifacts: 1 });
    }

    #[test]
    fn non_qos_tid_omits_qos_control() {
        let (mut cache, desc, mut user) = setup();
        user.tid = NON_QOS_TID;
        restitch_mpdus(&mut cache, &desc, &mut user, vec![msdu(true, true, eth_payload(&[7]))]);
        let frame = user.mpdu_q.pop_front().unwrap();
        let bytes = frame.bytes();
        // Plain data subtype, no QoS control: LLC starts right after the header.
        assert_eq!(bytes[0] & 0xf0, 0x00);
        assert_eq!(&bytes[24..32], &[0xaa, 0xaa, 0x03, 0, 0, 0, 0x08, 0x00]);
    }

    #[test]
    fn wds_uses_four_addresses() {
        let (mut cache, mut desc, mut user) = setup();
        let mut fc = FrameControl::new(mac::FRAME_TYPE_DATA, mac::DATA_SUBTYPE_QOS_DATA);
        fc.set_to_ds(true);
        fc.set_from_ds(true);
        desc.frame_ctrl = fc.0;
        restitch_mpdus(&mut cache, &desc, &mut user, vec![msdu(true, true, eth_payload(&[7]))]);
        let frame = user.mpdu_q.pop_front().unwrap();
        let bytes = frame.bytes();
        assert_eq!(&bytes[16..22], &DST);
        assert_eq!(&bytes[24..30], &SRC);
        // QoS control follows addr4.
        assert_eq!(&bytes[30..32], &[5, 0]);
    }
}

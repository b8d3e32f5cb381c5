// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery to the monitor consumer.
//!
//! The dispatcher stamps sequence numbers into reconstructed data frames,
//! synthesizes the frames that never exist as host buffers (RTS/CTS
//! protection, BAR, ACK and BlockAck responses, firmware control frames)
//! and hands everything to the [`CaptureSink`] with per-frame metadata.
//! A data slot is cleared as it is delivered, so re-delivering an
//! aggregate is a no-op.

use {
    crate::{
        buffer::FrameBuffer,
        mac::{
            self, ba_control_compressed, BlockAckInfo, CtrlHdrOneAddr, CtrlHdrTwoAddr,
            FrameControl, MacAddr, SequenceControl,
        },
        report::{PpduDesc, RateInfo, UserCompletionStatus, UserRecord},
        stats::PeerStats,
    },
    log::trace,
    zerocopy::AsBytes,
};

/// Per-frame delivery metadata.
#[derive(Clone, Debug)]
pub struct CaptureMeta {
    pub ppdu_id: u32,
    pub peer_id: u16,
    pub tid: u8,
    pub seq_no: u16,
    pub peer_addr: MacAddr,
    pub channel: u8,
    pub start_tsf: u64,
    pub end_tsf: u64,
    pub tx_duration: u16,
    pub rate: RateInfo,
    /// Frame was synthesized from report fields rather than reconstructed
    /// from host payload bytes.
    pub synthesized: bool,
}

/// Consumer of captured frames.
pub trait CaptureSink: Send {
    fn deliver(&mut self, frame: FrameBuffer, meta: &CaptureMeta);
}

pub struct Dispatcher {
    sink: Box<dyn CaptureSink>,
    pub frames_delivered: u64,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn CaptureSink>) -> Self {
        Self { sink, frames_delivered: 0 }
    }

    fn meta(desc: &PpduDesc, user: &UserRecord, seq_no: u16, synthesized: bool) -> CaptureMeta {
        CaptureMeta {
            ppdu_id: desc.ppdu_id,
            peer_id: user.peer_id,
            tid: user.tid,
            seq_no,
            peer_addr: user.mac_addr,
            channel: desc.channel,
            start_tsf: desc.start_tsf,
            end_tsf: desc.end_tsf,
            tx_duration: desc.tx_duration,
            rate: user.rate,
            synthesized,
        }
    }

    fn send(&mut self, frame: FrameBuffer, meta: &CaptureMeta) {
        self.frames_delivered += 1;
        self.sink.deliver(frame, meta);
    }

    /// Delivers one resolved data aggregate: protection exchange first, then
    /// every occupied slot in sequence order, then the synthesized
    /// acknowledgment. Slots are emptied as they go out.
    pub fn deliver_data_ppdu(
        &mut self,
        desc: &mut PpduDesc,
        vdev_addr: MacAddr,
        peer_stats: &mut PeerStats,
    ) {
        self.deliver_protection(desc, vdev_addr);
        let mut delivered = 0u64;
        let slots = usize::from(desc.user().ba_size).min(desc.user().mpdus.len());
        for offset in 0..slots {
            if !desc.user().enq_bitmap.get(offset) {
                continue;
            }
            let mut frame = match desc.user_mut().mpdus[offset].take() {
                Some(frame) => frame,
                None => continue,
            };
            let seq_no = desc.user().seq_at(offset);
            stamp_sequence(&mut frame, seq_no);
            let meta = Self::meta(desc, desc.user(), seq_no, false);
            self.send(frame, &meta);
            delivered += 1;
        }
        peer_stats.frames_delivered += delivered;
        trace!("ppdu {:#x}: delivered {} data frames", desc.ppdu_id, delivered);
        if delivered > 0 {
            let user = desc.user();
            if user.ack_expected && user.completion_status == UserCompletionStatus::Ok {
                self.deliver_ack(desc, vdev_addr);
            }
        }
    }

    /// Synthesizes the medium-protection exchange recorded for the
    /// aggregate: RTS (and CTS on success), or a lone CTS-to-self.
    fn deliver_protection(&mut self, desc: &PpduDesc, vdev_addr: MacAddr) {
        use crate::report::Protection;
        let user = desc.user();
        if desc.protection.is_rts() {
            let rts = CtrlHdrTwoAddr {
                frame_ctrl: FrameControl::new(mac::FRAME_TYPE_CTRL, mac::CTRL_SUBTYPE_RTS),
                duration: desc.tx_duration,
                addr1: user.mac_addr,
                addr2: vdev_addr,
            };
            let meta = Self::meta(desc, user, 0, true);
            self.send(FrameBuffer::new(rts.as_bytes().to_vec()), &meta);
        }
        let cts_addr = match desc.protection {
            Protection::CtsToSelf => Some(vdev_addr),
            _ if desc.protection.is_rts() && desc.rts_success => Some(vdev_addr),
            _ => return,
        };
        if let Some(addr1) = cts_addr {
            let cts = CtrlHdrOneAddr {
                frame_ctrl: FrameControl::new(mac::FRAME_TYPE_CTRL, mac::CTRL_SUBTYPE_CTS),
                duration: desc.tx_duration,
                addr1,
            };
            let meta = Self::meta(desc, user, 0, true);
            self.send(FrameBuffer::new(cts.as_bytes().to_vec()), &meta);
        }
    }

    /// Synthesizes the reverse-direction ACK or BlockAck of an acknowledged
    /// aggregate, so the consumer sees the full exchange.
    fn deliver_ack(&mut self, desc: &PpduDesc, vdev_addr: MacAddr) {
        let user = desc.user();
        let mut meta = Self::meta(desc, user, 0, true);
        meta.tx_duration = 0;
        if user.is_ampdu {
            let hdr = CtrlHdrTwoAddr {
                frame_ctrl: FrameControl::new(mac::FRAME_TYPE_CTRL, mac::CTRL_SUBTYPE_BLOCK_ACK),
                duration: 0,
                addr1: vdev_addr,
                addr2: user.mac_addr,
            };
            let info = BlockAckInfo {
                ba_control: ba_control_compressed(user.tid),
                ba_ssc: SequenceControl::from_seq(user.start_seq),
            };
            let mut out = Vec::with_capacity(52);
            out.extend_from_slice(hdr.as_bytes());
            out.extend_from_slice(info.as_bytes());
            let words = user.ba_bitmap.words();
            let n_words = if user.ba_size <= 64 { 2 } else { 8 };
            for w in &words[..n_words] {
                out.extend_from_slice(&w.to_le_bytes());
            }
            self.send(FrameBuffer::new(out), &meta);
        } else {
            let ack = CtrlHdrOneAddr {
                frame_ctrl: FrameControl::new(mac::FRAME_TYPE_CTRL, mac::CTRL_SUBTYPE_ACK),
                duration: 0,
                addr1: vdev_addr,
            };
            self.send(FrameBuffer::new(ack.as_bytes().to_vec()), &meta);
        }
    }

    /// Delivers a synthesized minimal frame for a block-ack-request
    /// aggregate, carrying the BAR-specific id and window.
    pub fn deliver_bar(&mut self, desc: &PpduDesc, vdev_addr: MacAddr) {
        let user = desc.user();
        let hdr = CtrlHdrTwoAddr {
            frame_ctrl: FrameControl::new(mac::FRAME_TYPE_CTRL, mac::CTRL_SUBTYPE_BAR),
            duration: desc.bar_tx_duration,
            addr1: user.mac_addr,
            addr2: vdev_addr,
        };
        let mut meta = Self::meta(desc, user, 0, true);
        meta.ppdu_id = desc.bar_ppdu_id;
        meta.start_tsf = desc.bar_start_tsf;
        meta.end_tsf = desc.bar_end_tsf;
        meta.tx_duration = desc.bar_tx_duration;
        self.send(FrameBuffer::new(hdr.as_bytes().to_vec()), &meta);
    }

    /// Delivers a firmware-generated control frame that exists only as
    /// report fields.
    pub fn deliver_ctrl(&mut self, desc: &PpduDesc, vdev_addr: MacAddr) {
        let user = desc.user();
        let frame_ctrl = FrameControl(desc.frame_ctrl);
        let single_addr = matches!(
            frame_ctrl.frame_subtype(),
            mac::CTRL_SUBTYPE_CTS | mac::CTRL_SUBTYPE_ACK
        );
        let frame = if single_addr {
            let hdr = CtrlHdrOneAddr {
                frame_ctrl,
                duration: desc.tx_duration,
                addr1: user.mac_addr,
            };
            FrameBuffer::new(hdr.as_bytes().to_vec())
        } else {
            let hdr = CtrlHdrTwoAddr {
                frame_ctrl,
                duration: desc.tx_duration,
                addr1: user.mac_addr,
                addr2: vdev_addr,
            };
            FrameBuffer::new(hdr.as_bytes().to_vec())
        };
        let meta = Self::meta(desc, user, 0, true);
        self.send(frame, &meta);
    }

    /// Delivers a host-captured management payload matched to its aggregate,
    /// re-stamping the fields firmware finalized after capture.
    pub fn deliver_mgmt(&mut self, desc: &PpduDesc, payload: FrameBuffer, retry: bool) {
        let user = desc.user();
        let mut frame = payload;
        let seq_no = user.start_seq;
        {
            let bytes = frame.make_mut();
            if bytes.len() >= mac::SEQ_CTRL_OFFSET + 2 {
                let mut fc = FrameControl(desc.frame_ctrl);
                fc.set_retry(retry || fc.retry());
                bytes[0..2].copy_from_slice(&fc.0.to_le_bytes());
                if fc.frame_subtype() != mac::MGMT_SUBTYPE_BEACON
                    || fc.frame_type() != mac::FRAME_TYPE_MGMT
                {
                    bytes[mac::DURATION_OFFSET..mac::DURATION_OFFSET + 2]
                        .copy_from_slice(&desc.tx_duration.to_le_bytes());
                    let sc = SequenceControl::from_seq(seq_no);
                    bytes[mac::SEQ_CTRL_OFFSET..mac::SEQ_CTRL_OFFSET + 2]
                        .copy_from_slice(&sc.0.to_le_bytes());
                }
            }
        }
        let meta = Self::meta(desc, user, seq_no, false);
        self.send(frame, &meta);
    }
}

/// Writes `seq` into the sequence-control field of a reconstructed frame.
fn stamp_sequence(frame: &mut FrameBuffer, seq: u16) {
    let bytes = frame.make_mut();
    if bytes.len() >= mac::SEQ_CTRL_OFFSET + 2 {
        let sc = SequenceControl::from_seq(seq);
        bytes[mac::SEQ_CTRL_OFFSET..mac::SEQ_CTRL_OFFSET + 2].copy_from_slice(&sc.0.to_le_bytes());
    }
}

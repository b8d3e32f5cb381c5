// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Aggregate (PPDU) completion reports from firmware.
//!
//! A report fragment carries the decoded fields for one aggregate; a
//! transmission schedule may span several fragments, the last of which is
//! marked terminal. The descriptor doubles as the working state the
//! resolver mutates while reconstructing frames.

use {
    crate::{
        buffer::FrameBuffer,
        mac::{self, FrameControl, MacAddr},
        seq::SeqBitmap,
    },
    std::collections::VecDeque,
};

/// Broad class of an aggregate, deciding which delivery path it takes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PpduKind {
    /// Carries MSDUs reaped from the completion ring.
    Data,
    /// Block-ack request; delivered as a synthesized control frame.
    Bar,
    /// Host-generated management frame matched against the staging queues.
    Mgmt,
    /// Firmware-generated control frame (RTS, CTS, NDP announcement, ...).
    Ctrl,
}

/// Firmware tag for self-generated frames. The tag is authoritative when the
/// report's frame-control field is zero or garbage.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SgenFrameType {
    DataSu,
    DataMu,
    Ndpa,
    Ndp,
    Brp,
    Rts,
    Cts,
    CfEnd,
    Trigger,
    Bar,
    QosNull,
    Other,
}

/// Number of histogram buckets for [`SgenFrameType`].
pub const SGEN_FRAME_TYPE_COUNT: usize = 12;

impl SgenFrameType {
    pub fn index(self) -> usize {
        match self {
            SgenFrameType::DataSu => 0,
            SgenFrameType::DataMu => 1,
            SgenFrameType::Ndpa => 2,
            SgenFrameType::Ndp => 3,
            SgenFrameType::Brp => 4,
            SgenFrameType::Rts => 5,
            SgenFrameType::Cts => 6,
            SgenFrameType::CfEnd => 7,
            SgenFrameType::Trigger => 8,
            SgenFrameType::Bar => 9,
            SgenFrameType::QosNull => 10,
            SgenFrameType::Other => 11,
        }
    }

    /// Frame control to substitute when the report's own is unusable.
    pub fn frame_ctrl_override(self) -> Option<FrameControl> {
        let subtype = match self {
            SgenFrameType::Ndpa => mac::CTRL_SUBTYPE_NDP_ANNOUNCE,
            SgenFrameType::Brp => mac::CTRL_SUBTYPE_BEAMFORM_POLL,
            SgenFrameType::Rts => mac::CTRL_SUBTYPE_RTS,
            SgenFrameType::Cts => mac::CTRL_SUBTYPE_CTS,
            SgenFrameType::CfEnd => mac::CTRL_SUBTYPE_CF_END,
            SgenFrameType::Trigger => mac::CTRL_SUBTYPE_TRIGGER,
            SgenFrameType::Bar => mac::CTRL_SUBTYPE_BAR,
            _ => return None,
        };
        Some(FrameControl::new(mac::FRAME_TYPE_CTRL, subtype))
    }
}

/// Firmware-reported completion status for one user of an aggregate.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UserCompletionStatus {
    Ok,
    /// Filtered before transmission; nothing to deliver.
    Filtered,
}

/// Medium protection used for the aggregate.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Protection {
    None,
    RtsLegacy,
    RtsStaticBw,
    RtsDynamicBw,
    CtsToSelf,
}

impl Protection {
    pub fn is_rts(&self) -> bool {
        matches!(self, Protection::RtsLegacy | Protection::RtsStaticBw | Protection::RtsDynamicBw)
    }
}

/// Transmit rate fields carried through to delivery metadata.
#[derive(Copy, Clone, Debug, Default)]
pub struct RateInfo {
    pub mcs: u8,
    pub nss: u8,
    pub bw: u8,
    pub short_gi: bool,
    pub preamble: u8,
    /// Rate in units of 100 kbps.
    pub tx_rate: u32,
}

/// Per-user slice of an aggregate report, plus the resolver's working state
/// for that user.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub peer_id: u16,
    pub tid: u8,
    pub mac_addr: MacAddr,
    pub completion_status: UserCompletionStatus,
    /// First sequence number of the transmit window.
    pub start_seq: u16,
    /// Sequence number the ack bitmap is based at.
    pub ba_seq_no: u16,
    /// Number of valid slots from `start_seq`; set by reconciliation.
    pub ba_size: u16,
    pub enq_bitmap: SeqBitmap,
    pub ba_bitmap: SeqBitmap,
    /// Set bit: enqueued and not acknowledged. Filled by reconciliation.
    pub failed_bitmap: SeqBitmap,
    pub mpdu_tried: u16,
    pub mpdu_success: u16,
    pub num_msdu: u16,
    /// Highest enqueued sequence number; set by reconciliation.
    pub last_enq_seq: u16,
    /// Holes still waiting on a later aggregate or the retry side channel.
    pub pending_retries: u16,
    pub is_ampdu: bool,
    pub ack_expected: bool,
    pub qos_ctrl: u16,
    pub frame_ctrl: u16,
    pub rate: RateInfo,
    /// Acknowledge RSSI, dB above noise floor.
    pub ack_rssi: u32,
    /// Restitched MPDUs in enqueue order, before slot assignment.
    pub mpdu_q: VecDeque<FrameBuffer>,
    /// One slot per sequence offset; filled during resolution, cleared on
    /// delivery.
    pub mpdus: Vec<Option<FrameBuffer>>,
}

impl Default for UserRecord {
    fn default() -> Self {
        Self {
            peer_id: 0,
            tid: 0,
            mac_addr: [0; 6],
            completion_status: UserCompletionStatus::Ok,
            start_seq: 0,
            ba_seq_no: 0,
            ba_size: 0,
            enq_bitmap: SeqBitmap::new(),
            ba_bitmap: SeqBitmap::new(),
            failed_bitmap: SeqBitmap::new(),
            mpdu_tried: 0,
            mpdu_success: 0,
            num_msdu: 0,
            last_enq_seq: 0,
            pending_retries: 0,
            is_ampdu: false,
            ack_expected: false,
            qos_ctrl: 0,
            frame_ctrl: 0,
            rate: RateInfo::default(),
            ack_rssi: 0,
            mpdu_q: VecDeque::new(),
            mpdus: Vec::new(),
        }
    }
}

impl UserRecord {
    /// Sequence number at slot `offset` of this user's window.
    pub fn seq_at(&self, offset: usize) -> u16 {
        self.start_seq.wrapping_add(offset as u16) & (crate::seq::SEQ_MAX - 1)
    }

    /// Folds a later fragment's record for the same user into this one.
    /// The enqueue side and the block-ack side of a report may arrive in
    /// separate fragments; each side overwrites only its own fields.
    fn merge(&mut self, other: UserRecord) {
        if !other.enq_bitmap.is_empty() {
            self.enq_bitmap = other.enq_bitmap;
            self.start_seq = other.start_seq;
        }
        if !other.ba_bitmap.is_empty() || other.mpdu_success > 0 {
            self.ba_bitmap = other.ba_bitmap;
            self.ba_seq_no = other.ba_seq_no;
        }
        self.mpdu_tried = self.mpdu_tried.max(other.mpdu_tried);
        self.mpdu_success = self.mpdu_success.max(other.mpdu_success);
        self.num_msdu = self.num_msdu.max(other.num_msdu);
        self.is_ampdu |= other.is_ampdu;
        self.ack_expected |= other.ack_expected;
        if other.completion_status == UserCompletionStatus::Filtered {
            self.completion_status = UserCompletionStatus::Filtered;
        }
        if other.frame_ctrl != 0 {
            self.frame_ctrl = other.frame_ctrl;
        }
        if other.qos_ctrl != 0 {
            self.qos_ctrl = other.qos_ctrl;
        }
        if other.rate.tx_rate != 0 {
            self.rate = other.rate;
        }
        self.ack_rssi = self.ack_rssi.max(other.ack_rssi);
    }
}

/// Decoded aggregate completion descriptor.
#[derive(Clone, Debug)]
pub struct PpduDesc {
    pub ppdu_id: u32,
    pub sched_cmdid: u32,
    pub vdev_id: u8,
    pub kind: PpduKind,
    pub sgen_type: SgenFrameType,
    pub frame_ctrl: u16,
    pub tx_duration: u16,
    pub channel: u8,
    /// Device time references bounding the transmission, microseconds.
    pub start_tsf: u64,
    pub end_tsf: u64,
    pub protection: Protection,
    pub rts_success: bool,
    /// Responded block-ack-request identifiers, for BAR descriptors.
    pub bar_ppdu_id: u32,
    pub bar_start_tsf: u64,
    pub bar_end_tsf: u64,
    pub bar_tx_duration: u16,
    /// Flush-only descriptor: run the excess-retry pass, deliver nothing.
    pub is_flush: bool,
    pub users: Vec<UserRecord>,
}

impl PpduDesc {
    /// Folds a later fragment for the same aggregate into this descriptor.
    /// Records for a user already present merge field-wise, so an ack-status
    /// fragment lands in the same record as the enqueue fragment.
    pub fn merge_fragment(&mut self, mut other: PpduDesc) {
        for user in other.users.drain(..) {
            match self
                .users
                .iter_mut()
                .find(|u| u.peer_id == user.peer_id && u.tid == user.tid)
            {
                Some(existing) => existing.merge(user),
                None => self.users.push(user),
            }
        }
        if other.start_tsf != 0 && (self.start_tsf == 0 || other.start_tsf < self.start_tsf) {
            self.start_tsf = other.start_tsf;
        }
        self.end_tsf = self.end_tsf.max(other.end_tsf);
        self.is_flush |= other.is_flush;
        if self.frame_ctrl == 0 {
            self.frame_ctrl = other.frame_ctrl;
        }
    }

    /// The first user record. Correlation treats aggregates as single-user;
    /// fragments of the same user merge into one record, and genuinely
    /// multi-user reports are split into one descriptor per user upstream.
    pub fn user(&self) -> &UserRecord {
        &self.users[0]
    }

    pub fn user_mut(&mut self) -> &mut UserRecord {
        &mut self.users[0]
    }

    /// Repairs a zero/garbage frame-control field from the firmware tag.
    pub fn repair_frame_ctrl(&mut self) {
        if let Some(fc) = self.sgen_type.frame_ctrl_override() {
            self.frame_ctrl = fc.0;
        }
    }
}

/// One firmware report: a descriptor fragment plus schedule bookkeeping.
#[derive(Clone, Debug)]
pub struct PpduReportFragment {
    pub desc: PpduDesc,
    /// Last fragment of this schedule.
    pub terminal: bool,
}

/// Host-captured management payload staged for correlation.
#[derive(Clone, Debug)]
pub struct MgmtPayload {
    pub frame_type: u8,
    pub frame_subtype: u8,
    pub ppdu_id: u32,
    pub tsf: u64,
    /// Firmware-generated (as opposed to host-enqueued) frame.
    pub is_sgen: bool,
    pub payload: FrameBuffer,
}

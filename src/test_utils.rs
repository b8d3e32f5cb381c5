// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builders and fakes shared by the module tests.

use {
    crate::{
        buffer::FrameBuffer,
        completion::{CompletionStatus, MsduCompletion},
        dispatch::{CaptureMeta, CaptureSink},
        mac::MacAddr,
        peer::PeerState,
        report::{PpduDesc, PpduKind, Protection, SgenFrameType, UserRecord},
    },
    parking_lot::Mutex,
    std::sync::Arc,
};

pub const PEER_ADDR: MacAddr = [2, 2, 2, 2, 2, 2];

pub fn ppdu_desc(ppdu_id: u32, peer_id: u16, kind: PpduKind) -> PpduDesc {
    let mut user = UserRecord::default();
    user.peer_id = peer_id;
    user.mac_addr = PEER_ADDR;
    let (sgen_type, frame_ctrl) = match kind {
        // QoS data, FromDS.
        PpduKind::Data => (SgenFrameType::DataSu, 0x0288),
        _ => (SgenFrameType::Other, 0),
    };
    PpduDesc {
        ppdu_id,
        sched_cmdid: 1,
        vdev_id: 0,
        kind,
        sgen_type,
        frame_ctrl,
        tx_duration: 0,
        channel: 6,
        start_tsf: 1_000,
        end_tsf: 2_000,
        protection: Protection::None,
        rts_success: false,
        bar_ppdu_id: 0,
        bar_start_tsf: 0,
        bar_end_tsf: 0,
        bar_tx_duration: 0,
        is_flush: false,
        users: vec![user],
    }
}

pub fn peer(peer_id: u16, vdev_addr: MacAddr) -> PeerState {
    PeerState::new(peer_id, PEER_ADDR, vdev_addr)
}

/// A header-sized frame carrying an identifying tag past the header bytes.
pub fn tagged_frame(ppdu_id: u32, index: usize) -> FrameBuffer {
    let mut bytes = vec![0u8; 24];
    bytes.extend_from_slice(&(ppdu_id as u16).to_le_bytes());
    bytes.push(index as u8);
    FrameBuffer::new(bytes)
}

/// Reads back the tag written by [`tagged_frame`].
pub fn frame_tag(bytes: &[u8]) -> (u32, usize) {
    (u32::from(u16::from_le_bytes([bytes[24], bytes[25]])), usize::from(bytes[26]))
}

/// Ethernet-framed MSDU payload with a recognizable body.
pub fn eth_payload(body: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&[6u8; 6]);
    v.extend_from_slice(&[8u8; 6]);
    v.extend_from_slice(&0x0800u16.to_be_bytes());
    v.extend_from_slice(body);
    v
}

pub fn completion(ppdu_id: u32, peer_id: u16, tid: u8, tsf: u64, body: &[u8]) -> MsduCompletion {
    MsduCompletion {
        ppdu_id,
        peer_id,
        tid,
        first_msdu: true,
        last_msdu: true,
        transmit_cnt: 1,
        tsf,
        status: CompletionStatus::Acked,
        payload: FrameBuffer::new(eth_payload(body)),
    }
}

pub type SinkLog = Arc<Mutex<Vec<(Vec<u8>, CaptureMeta)>>>;

/// Sink that records every delivered frame with its metadata.
pub struct SharedSink(SinkLog);

impl SharedSink {
    pub fn new() -> (Self, SinkLog) {
        let log: SinkLog = Arc::new(Mutex::new(Vec::new()));
        (Self(log.clone()), log)
    }
}

impl CaptureSink for SharedSink {
    fn deliver(&mut self, frame: FrameBuffer, meta: &CaptureMeta) {
        self.0.lock().push((frame.bytes().to_vec(), meta.clone()));
    }
}

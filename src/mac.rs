// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 802.11 MAC header definitions used by the restitcher and dispatcher.
//!
//! Only the layouts this crate synthesizes are defined; frames are built by
//! writing these packed structs with zerocopy, never parsed from the air.

use {
    crate::error::Error,
    zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned},
};

pub type MacAddr = [u8; 6];

// IEEE Std 802.11-2016, 9.2.4.1.3
pub const FRAME_TYPE_MGMT: u8 = 0b00;
pub const FRAME_TYPE_CTRL: u8 = 0b01;
pub const FRAME_TYPE_DATA: u8 = 0b10;

pub const MGMT_SUBTYPE_BEACON: u8 = 0x08;

pub const CTRL_SUBTYPE_TRIGGER: u8 = 0x02;
pub const CTRL_SUBTYPE_BEAMFORM_POLL: u8 = 0x04;
pub const CTRL_SUBTYPE_NDP_ANNOUNCE: u8 = 0x05;
pub const CTRL_SUBTYPE_BAR: u8 = 0x08;
pub const CTRL_SUBTYPE_BLOCK_ACK: u8 = 0x09;
pub const CTRL_SUBTYPE_RTS: u8 = 0x0b;
pub const CTRL_SUBTYPE_CTS: u8 = 0x0c;
pub const CTRL_SUBTYPE_ACK: u8 = 0x0d;
pub const CTRL_SUBTYPE_CF_END: u8 = 0x0e;

pub const DATA_SUBTYPE_QOS_DATA: u8 = 0x08;
pub const DATA_SUBTYPE_QOS_NULL: u8 = 0x0c;

/// Byte offset of the duration field in any MAC header.
pub const DURATION_OFFSET: usize = 2;
/// Byte offset of the sequence-control field in data and management headers.
pub const SEQ_CTRL_OFFSET: usize = 22;

pub const ETHER_HDR_LEN: usize = 14;

// IEEE Std 802.11-2016, 9.2.4.1.1
// Alignment 2; unaligned access works through the containing packed headers.
#[derive(FromZeroes, FromBytes, AsBytes, Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct FrameControl(pub u16);

impl FrameControl {
    pub fn new(frame_type: u8, subtype: u8) -> Self {
        Self((u16::from(frame_type) & 0x3) << 2 | (u16::from(subtype) & 0xf) << 4)
    }

    pub fn frame_type(&self) -> u8 {
        (self.0 >> 2) as u8 & 0x3
    }

    pub fn frame_subtype(&self) -> u8 {
        (self.0 >> 4) as u8 & 0xf
    }

    pub fn to_ds(&self) -> bool {
        self.0 & (1 << 8) != 0
    }

    pub fn from_ds(&self) -> bool {
        self.0 & (1 << 9) != 0
    }

    pub fn set_to_ds(&mut self, to_ds: bool) {
        if to_ds {
            self.0 |= 1 << 8;
        } else {
            self.0 &= !(1 << 8);
        }
    }

    pub fn set_from_ds(&mut self, from_ds: bool) {
        if from_ds {
            self.0 |= 1 << 9;
        } else {
            self.0 &= !(1 << 9);
        }
    }

    pub fn retry(&self) -> bool {
        self.0 & (1 << 11) != 0
    }

    pub fn set_retry(&mut self, retry: bool) {
        if retry {
            self.0 |= 1 << 11;
        } else {
            self.0 &= !(1 << 11);
        }
    }
}

impl std::fmt::Debug for FrameControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameControl({:#06x})", self.0)
    }
}

// IEEE Std 802.11-2016, 9.2.4.4
#[derive(FromZeroes, FromBytes, AsBytes, Copy, Clone, PartialEq, Eq, Debug, Default)]
#[repr(transparent)]
pub struct SequenceControl(pub u16);

impl SequenceControl {
    pub fn from_seq(seq: u16) -> Self {
        Self((seq & 0xfff) << 4)
    }

    pub fn seq(&self) -> u16 {
        self.0 >> 4
    }
}

// IEEE Std 802.11-2016, 9.3.2.1: three-address data frame header.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct DataHdr {
    pub frame_ctrl: FrameControl,
    pub duration: u16,
    pub addr1: MacAddr,
    pub addr2: MacAddr,
    pub addr3: MacAddr,
    pub seq_ctrl: SequenceControl,
}

// Four-address (WDS) data frame header.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct DataHdr4 {
    pub frame_ctrl: FrameControl,
    pub duration: u16,
    pub addr1: MacAddr,
    pub addr2: MacAddr,
    pub addr3: MacAddr,
    pub seq_ctrl: SequenceControl,
    pub addr4: MacAddr,
}

// IEEE Std 802.11-2016, 9.2.4.5
#[derive(FromZeroes, FromBytes, AsBytes, Copy, Clone, PartialEq, Eq, Debug, Default)]
#[repr(transparent)]
pub struct QosControl(pub u16);

impl QosControl {
    pub fn from_tid(tid: u8) -> Self {
        Self(u16::from(tid) & 0xf)
    }
}

// Single-address control frame (ACK, CTS).
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct CtrlHdrOneAddr {
    pub frame_ctrl: FrameControl,
    pub duration: u16,
    pub addr1: MacAddr,
}

// Two-address control frame (RTS, BAR, BlockAck).
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct CtrlHdrTwoAddr {
    pub frame_ctrl: FrameControl,
    pub duration: u16,
    pub addr1: MacAddr,
    pub addr2: MacAddr,
}

// IEEE Std 802.11-2016, 9.3.1.9: BA control plus starting sequence control.
// The compressed bitmap (8 or 32 bytes) follows.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct BlockAckInfo {
    pub ba_control: u16,
    pub ba_ssc: SequenceControl,
}

/// Compressed-bitmap BlockAck control field for one TID.
pub fn ba_control_compressed(tid: u8) -> u16 {
    (u16::from(tid) & 0xf) << 12 | 0x0004
}

// IEEE Std 802.2: LLC header with SNAP extension.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct LlcHdr {
    pub dsap: u8,
    pub ssap: u8,
    pub control: u8,
    pub oui: [u8; 3],
    /// Big-endian ethertype.
    pub protocol_id: [u8; 2],
}

const LLC_SNAP_EXTENSION: u8 = 0xaa;
const LLC_UNNUMBERED_INFORMATION: u8 = 0x03;
const RFC_1042_OUI: [u8; 3] = [0x00, 0x00, 0x00];

pub fn make_snap_llc_hdr(protocol_id: u16) -> LlcHdr {
    LlcHdr {
        dsap: LLC_SNAP_EXTENSION,
        ssap: LLC_SNAP_EXTENSION,
        control: LLC_UNNUMBERED_INFORMATION,
        oui: RFC_1042_OUI,
        protocol_id: protocol_id.to_be_bytes(),
    }
}

/// Destination, source and ethertype of an Ethernet II header.
pub fn parse_ether_hdr(bytes: &[u8]) -> Result<(MacAddr, MacAddr, u16), Error> {
    if bytes.len() < ETHER_HDR_LEN {
        return Err(Error::FrameTooShort(bytes.len(), ETHER_HDR_LEN));
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&bytes[0..6]);
    src.copy_from_slice(&bytes[6..12]);
    let ethertype = u16::from_be_bytes([bytes[12], bytes[13]]);
    Ok((dst, src, ethertype))
}

// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-MSDU transmit completion records reaped from the host completion ring.

use crate::buffer::FrameBuffer;

/// Release reason reported for one MSDU.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompletionStatus {
    /// Transmitted and acknowledged.
    Acked,
    /// Removed by a remove-transmitted command after at least one attempt.
    RemovedTx,
    /// Aged out of the transmit queue.
    RemovedAged,
}

/// One MSDU completion: the original payload (Ethernet framed) plus the
/// bookkeeping needed to correlate it with an aggregate report.
#[derive(Clone, Debug)]
pub struct MsduCompletion {
    pub ppdu_id: u32,
    pub peer_id: u16,
    pub tid: u8,
    pub first_msdu: bool,
    pub last_msdu: bool,
    pub transmit_cnt: u8,
    /// Device time reference at completion, microseconds.
    pub tsf: u64,
    pub status: CompletionStatus,
    pub payload: FrameBuffer,
}

impl MsduCompletion {
    /// Whether this completion carries a frame worth capturing. Aged-out
    /// MSDUs that never hit the air are not.
    pub fn capture_eligible(&self) -> bool {
        match self.status {
            CompletionStatus::Acked | CompletionStatus::RemovedTx => true,
            CompletionStatus::RemovedAged => self.transmit_cnt > 0,
        }
    }

    /// Whether this completion belongs on the excess-retry side channel
    /// rather than the normal reap path.
    pub fn is_excess_retry(&self) -> bool {
        matches!(self.status, CompletionStatus::RemovedTx | CompletionStatus::RemovedAged)
    }
}

// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown peer: {0}")]
    UnknownPeer(u16),
    #[error("frame too short: have {0} bytes, need {1}")]
    FrameTooShort(usize, usize),
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

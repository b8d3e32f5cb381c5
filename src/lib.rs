// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconstruction of the WiFi transmit path for monitor-mode capture.
//!
//! Firmware reports each transmitted aggregate (PPDU) with per-user bitmaps
//! but without payload bytes; the host completion ring returns the payload
//! bytes but in Ethernet framing and without air-interface headers. This
//! crate correlates the two into ordered, de-duplicated, byte-accurate
//! 802.11 frames and hands them to a [`CaptureSink`]. See [`engine`] for
//! the pipeline and [`spawn_capture_loop`] for the worker thread driving
//! it.

pub mod buffer;
mod collector;
mod comp_queue;
pub mod completion;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mac;
mod peer;
mod reconcile;
pub mod report;
mod resolver;
mod restitch;
pub mod seq;
pub mod stats;
#[cfg(test)]
pub mod test_utils;

pub use {
    dispatch::{CaptureMeta, CaptureSink},
    engine::{CaptureConfig, CaptureMode, TxCaptureEngine},
    error::Error,
    restitch::NON_QOS_TID,
};

use {
    crate::{
        completion::MsduCompletion,
        mac::MacAddr,
        report::{MgmtPayload, PpduReportFragment},
    },
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError},
    log::{error, info, warn},
    parking_lot::Mutex,
    std::sync::Arc,
    std::time::Duration,
};

/// Upper bound on the loop's latency when no events arrive; pending
/// schedules are still flushed on this cadence.
const WORKER_TICK: Duration = Duration::from_millis(10);

const EVENT_CHANNEL_DEPTH: usize = 2048;

/// Everything the driver feeds into the capture loop. All events are
/// handled serially by the worker thread.
pub enum CaptureEvent {
    /// One decoded aggregate report fragment.
    PpduReport(PpduReportFragment),
    /// One MSDU reaped from the completion ring.
    TxCompletion(MsduCompletion),
    /// A host-captured management payload.
    MgmtFrame(MgmtPayload),
    PeerAttach { peer_id: u16, peer_addr: MacAddr, vdev_addr: MacAddr },
    PeerDetach { peer_id: u16 },
    SetMode(CaptureMode),
    SetPeerEnabled { peer_id: u16, enabled: bool },
    /// Shuts the loop down after a final drain.
    Stop,
}

/// CaptureEventSink is handed to the driver's interrupt-context paths. It
/// never blocks: a full channel sheds the event, which the bounded queues
/// behind it are built to tolerate. Clones may be passed freely between
/// threads.
#[derive(Clone)]
pub struct CaptureEventSink(Sender<CaptureEvent>);

impl CaptureEventSink {
    pub fn send(&self, event: CaptureEvent) {
        match self.0.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("capture event channel full, event shed"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Handle to a running capture loop.
pub struct CaptureHandle {
    sink: CaptureEventSink,
    engine: Arc<Mutex<TxCaptureEngine>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn event_sink(&self) -> CaptureEventSink {
        self.sink.clone()
    }

    pub fn stats(&self) -> stats::CaptureStats {
        self.engine.lock().stats()
    }

    pub fn peer_stats(&self, peer_id: u16) -> Option<stats::PeerStats> {
        self.engine.lock().peer_stats(peer_id)
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(mut self) {
        self.sink.send(CaptureEvent::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture loop thread panicked");
            }
        }
    }
}

/// Spawns the worker thread driving `engine`. Events are handled as they
/// arrive; on every tick the engine also gets a chance to flush schedules
/// held back by the starvation deadline.
pub fn spawn_capture_loop(engine: TxCaptureEngine) -> Result<CaptureHandle, Error> {
    let (sender, receiver) = crossbeam_channel::bounded(EVENT_CHANNEL_DEPTH);
    let engine = Arc::new(Mutex::new(engine));
    let loop_engine = engine.clone();
    let thread = std::thread::Builder::new()
        .name("wlan-tx-capture".to_string())
        .spawn(move || capture_loop(loop_engine, receiver))
        .map_err(|e| Error::Internal(e.into()))?;
    Ok(CaptureHandle { sink: CaptureEventSink(sender), engine, thread: Some(thread) })
}

fn capture_loop(engine: Arc<Mutex<TxCaptureEngine>>, receiver: Receiver<CaptureEvent>) {
    info!("capture loop started");
    loop {
        let event = match receiver.recv_timeout(WORKER_TICK) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let mut engine = engine.lock();
        if let Some(event) = event {
            if !handle_event(&mut engine, event) {
                engine.process();
                break;
            }
            // Drain whatever queued up behind the first event before
            // running the pipeline once for the whole batch.
            let mut stop = false;
            while let Ok(event) = receiver.try_recv() {
                if !handle_event(&mut engine, event) {
                    stop = true;
                    break;
                }
            }
            engine.process();
            if stop {
                break;
            }
        } else {
            engine.process();
        }
    }
    info!("capture loop exited");
}

/// Returns false when the loop should stop.
fn handle_event(engine: &mut TxCaptureEngine, event: CaptureEvent) -> bool {
    match event {
        CaptureEvent::PpduReport(frag) => engine.on_ppdu_report(frag),
        CaptureEvent::TxCompletion(rec) => engine.on_tx_completion(rec),
        CaptureEvent::MgmtFrame(frame) => engine.on_mgmt_frame(frame),
        CaptureEvent::PeerAttach { peer_id, peer_addr, vdev_addr } => {
            engine.on_peer_attach(peer_id, peer_addr, vdev_addr)
        }
        CaptureEvent::PeerDetach { peer_id } => engine.on_peer_detach(peer_id),
        CaptureEvent::SetMode(mode) => engine.set_mode(mode),
        CaptureEvent::SetPeerEnabled { peer_id, enabled } => {
            if let Err(e) = engine.set_peer_enabled(peer_id, enabled) {
                warn!("per-peer filter update failed: {}", e);
            }
        }
        CaptureEvent::Stop => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        report::PpduKind,
        test_utils::{self, SharedSink},
    };
    use std::time::Instant;

    #[test]
    fn start_and_stop_capture_loop() {
        let (sink, log) = SharedSink::new();
        let engine = TxCaptureEngine::new(CaptureConfig::default(), Box::new(sink));
        let handle = spawn_capture_loop(engine).expect("Failed to spawn capture loop");
        let events = handle.event_sink();
        events.send(CaptureEvent::PeerAttach {
            peer_id: 1,
            peer_addr: test_utils::PEER_ADDR,
            vdev_addr: [4; 6],
        });
        events.send(CaptureEvent::TxCompletion(test_utils::completion(0x10, 1, 0, 1_100, b"hi")));
        let mut frag = test_utils::ppdu_desc(0x10, 1, PpduKind::Data);
        {
            let user = frag.user_mut();
            user.start_seq = 100;
            user.ba_seq_no = 100;
            user.num_msdu = 1;
            user.mpdu_tried = 1;
            user.mpdu_success = 1;
            user.enq_bitmap.set(0);
            user.ba_bitmap.set(0);
        }
        events.send(CaptureEvent::PpduReport(report::PpduReportFragment {
            desc: frag,
            terminal: true,
        }));

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().frames_delivered == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.stats().frames_delivered, 1);
        assert_eq!(log.lock()[0].1.seq_no, 100);
        handle.stop();
    }
}

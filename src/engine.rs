// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capture engine: owns all per-peer state and drives the pipeline.
//!
//! Producers (completion-ring reap, report decode, management capture)
//! enqueue through the `on_*` entry points, which only touch locked staging
//! queues and never block. The single worker calls [`TxCaptureEngine::process`],
//! which drains staging, batches reports by schedule, reconciles bitmaps,
//! restitches frames, resolves holes across aggregates and delivers.

use {
    crate::{
        collector::{ReleaseReason, ScheduleCollector},
        dispatch::{CaptureSink, Dispatcher},
        error::Error,
        mac::{self, FrameControl, MacAddr},
        peer::{PeerState, XretryMpdu},
        reconcile,
        report::{MgmtPayload, PpduDesc, PpduKind, PpduReportFragment, UserCompletionStatus},
        resolver,
        restitch::{self, MAX_TIDS, NON_QOS_TID},
        seq::SeqBitmap,
        stats::{CaptureStats, PeerStats},
    },
    log::{debug, error, info},
    parking_lot::Mutex,
    std::collections::{HashMap, VecDeque},
    std::time::Instant,
};

/// Bound on report fragments staged between worker passes.
pub const REPORT_STAGING_MAX_DEPTH: usize = 1024;

/// Bound per management staging queue.
const MGMT_STAGING_MAX_DEPTH: usize = 256;

/// A host-generated management payload older than its candidate aggregate's
/// start by more than this is stale, microseconds.
pub const MAX_MGMT_ENQ_DELAY_US: u64 = 10_000;

/// Low bits of the aggregate id carrying the schedule ordinal, used to
/// order firmware-generated payloads against descriptors.
const SCH_ID_MASK: u32 = 0xff;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CaptureMode {
    Disabled,
    /// Capture traffic of every peer.
    AllPeers,
    /// Capture only peers with their enable bit set.
    PerPeer,
}

#[derive(Copy, Clone, Debug)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { mode: CaptureMode::AllPeers }
    }
}

#[derive(Default)]
struct ReportStaging {
    q: VecDeque<PpduReportFragment>,
    accepted: u64,
    dropped: u64,
}

#[derive(Default)]
struct MgmtStaging {
    queues: HashMap<(u8, u8), VecDeque<MgmtPayload>>,
    staged: u64,
    dropped: u64,
}

pub struct TxCaptureEngine {
    mode: CaptureMode,
    report_staging: Mutex<ReportStaging>,
    mgmt_staging: Mutex<MgmtStaging>,
    /// Descriptors waiting for a management payload that has not been
    /// captured yet, keyed like the staging queues.
    retries_mgmt: HashMap<(u8, u8), VecDeque<PpduDesc>>,
    collector: ScheduleCollector,
    peers: HashMap<u16, PeerState>,
    dispatcher: Dispatcher,
    stats: CaptureStats,
}

impl TxCaptureEngine {
    pub fn new(config: CaptureConfig, sink: Box<dyn CaptureSink>) -> Self {
        Self {
            mode: config.mode,
            report_staging: Mutex::new(ReportStaging::default()),
            mgmt_staging: Mutex::new(MgmtStaging::default()),
            retries_mgmt: HashMap::new(),
            collector: ScheduleCollector::new(),
            peers: HashMap::new(),
            dispatcher: Dispatcher::new(sink),
            stats: CaptureStats::default(),
        }
    }

    /// Stages one aggregate report fragment. Never blocks; sheds beyond the
    /// staging bound.
    pub fn on_ppdu_report(&self, frag: PpduReportFragment) {
        let staging = &mut *self.report_staging.lock();
        if self.mode == CaptureMode::Disabled || staging.q.len() >= REPORT_STAGING_MAX_DEPTH {
            staging.dropped += 1;
            return;
        }
        staging.accepted += 1;
        staging.q.push_back(frag);
    }

    /// Stages one MSDU completion on its peer/TID queue.
    pub fn on_tx_completion(&self, rec: crate::completion::MsduCompletion) {
        if self.mode == CaptureMode::Disabled || !rec.capture_eligible() {
            return;
        }
        if usize::from(rec.tid) >= MAX_TIDS {
            debug!("completion with tid {} out of range", rec.tid);
            return;
        }
        let peer = match self.peers.get(&rec.peer_id) {
            Some(peer) => peer,
            None => {
                debug!("completion for unknown peer {}", rec.peer_id);
                return;
            }
        };
        if self.mode == CaptureMode::PerPeer && !peer.enabled {
            return;
        }
        if let Some(tid_state) = peer.tid_ref(rec.tid) {
            tid_state.comp_queue.enqueue(rec);
        }
    }

    /// Stages a captured management payload for correlation.
    pub fn on_mgmt_frame(&self, frame: MgmtPayload) {
        let staging = &mut *self.mgmt_staging.lock();
        if self.mode == CaptureMode::Disabled {
            staging.dropped += 1;
            return;
        }
        let q = staging.queues.entry((frame.frame_type, frame.frame_subtype)).or_default();
        if q.len() >= MGMT_STAGING_MAX_DEPTH {
            q.pop_front();
            staging.dropped += 1;
        }
        q.push_back(frame);
        staging.staged += 1;
    }

    pub fn on_peer_attach(&mut self, peer_id: u16, peer_addr: MacAddr, vdev_addr: MacAddr) {
        info!("peer {} attached", peer_id);
        self.peers.insert(peer_id, PeerState::new(peer_id, peer_addr, vdev_addr));
    }

    /// Releases everything held for the peer.
    pub fn on_peer_detach(&mut self, peer_id: u16) {
        if self.peers.remove(&peer_id).is_some() {
            info!("peer {} detached", peer_id);
        }
    }

    pub fn set_mode(&mut self, mode: CaptureMode) {
        if self.mode == mode {
            return;
        }
        info!("capture mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        if mode == CaptureMode::Disabled {
            self.drain_all();
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Per-peer capture filter, effective in [`CaptureMode::PerPeer`].
    /// Disabling a peer flushes its queued state.
    pub fn set_peer_enabled(&mut self, peer_id: u16, enabled: bool) -> Result<(), Error> {
        let peer = self.peers.get_mut(&peer_id).ok_or(Error::UnknownPeer(peer_id))?;
        peer.enabled = enabled;
        if !enabled {
            peer.flush();
        }
        Ok(())
    }

    /// Worker entry point: drains staging and processes every released
    /// schedule.
    pub fn process(&mut self) {
        self.process_at(Instant::now());
    }

    fn process_at(&mut self, now: Instant) {
        let frags = {
            let staging = &mut *self.report_staging.lock();
            self.stats.ppdu_reports += std::mem::take(&mut staging.accepted);
            self.stats.ppdu_dropped += std::mem::take(&mut staging.dropped);
            staging.q.drain(..).collect::<Vec<_>>()
        };
        for frag in frags {
            self.stats.sgen_frame_types[frag.desc.sgen_type.index()] += 1;
            self.collector.ingest(frag, now);
        }
        {
            let staging = &mut *self.mgmt_staging.lock();
            self.stats.mgmt_staged += std::mem::take(&mut staging.staged);
            self.stats.mgmt_dropped += std::mem::take(&mut staging.dropped);
        }
        while self.mode != CaptureMode::Disabled {
            match self.collector.pop_ready(now) {
                Some((descs, reason)) => {
                    if reason == ReleaseReason::DeadlineFlush {
                        self.stats.schedules_flushed += 1;
                    }
                    self.process_schedule(descs);
                    self.stats.schedules_processed += 1;
                }
                None => break,
            }
        }
        self.stats.frames_delivered = self.dispatcher.frames_delivered;
    }

    pub fn stats(&self) -> CaptureStats {
        let mut stats = self.stats.clone();
        stats.frames_delivered = self.dispatcher.frames_delivered;
        stats
    }

    pub fn peer_stats(&self, peer_id: u16) -> Option<PeerStats> {
        self.peers.get(&peer_id).map(|p| {
            let mut stats = p.stats.clone();
            stats.comp_queue_depth =
                p.tids.iter().map(|t| t.comp_queue.working_len() as u64).sum();
            stats
        })
    }

    fn process_schedule(&mut self, descs: Vec<PpduDesc>) {
        let mut slots: Vec<Option<PpduDesc>> = Vec::with_capacity(descs.len());
        for mut desc in descs {
            desc.repair_frame_ctrl();
            if desc.users.is_empty() {
                continue;
            }
            if desc.is_flush {
                self.process_flush(&desc);
                continue;
            }
            match desc.kind {
                PpduKind::Data => {
                    if let Some(desc) = self.prepare_data_ppdu(desc) {
                        slots.push(Some(desc));
                    }
                }
                PpduKind::Bar => self.process_bar(&desc),
                PpduKind::Mgmt | PpduKind::Ctrl => self.process_mgmt_ctrl(desc),
            }
        }
        for slot in slots.iter_mut() {
            if let Some(desc) = slot {
                resolver::assign_slots(desc);
            }
        }
        resolver::fill_holes_in_batch(&mut slots);
        let mut keys: Vec<(u16, u8)> = Vec::new();
        for slot in slots.iter() {
            if let Some(desc) = slot {
                let key = (desc.user().peer_id, desc.user().tid);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        for (peer_id, tid) in keys {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                self.stats.ppdu_delivered +=
                    resolver::resolve_peer_tid(peer, tid, &mut self.dispatcher, &mut slots);
            }
        }
    }

    fn peer_captured(&self, peer_id: u16) -> bool {
        match self.mode {
            CaptureMode::Disabled => false,
            CaptureMode::AllPeers => true,
            CaptureMode::PerPeer => self.peers.get(&peer_id).map_or(false, |p| p.enabled),
        }
    }

    /// Reconciles the user's bitmaps, reaps its completions and restitches
    /// them; the result is ready for slot assignment.
    fn prepare_data_ppdu(&mut self, mut desc: PpduDesc) -> Option<PpduDesc> {
        let peer_id = desc.user().peer_id;
        if !self.peer_captured(peer_id) {
            return None;
        }
        if desc.user().completion_status == UserCompletionStatus::Filtered {
            return None;
        }
        if usize::from(desc.user().tid) >= MAX_TIDS {
            error!("ppdu {:#x}: tid {} out of range", desc.ppdu_id, desc.user().tid);
            return None;
        }
        let peer = match self.peers.get_mut(&peer_id) {
            Some(peer) => peer,
            None => {
                debug!("ppdu {:#x} for unknown peer {}", desc.ppdu_id, peer_id);
                return None;
            }
        };
        {
            let user = desc.user_mut();
            if user.tid == NON_QOS_TID {
                // Non-QoS traffic reports no bitmaps; model it as a
                // one-slot window.
                user.enq_bitmap = SeqBitmap::new();
                user.enq_bitmap.set(0);
                user.ba_bitmap = SeqBitmap::new();
                if user.mpdu_success > 0 {
                    user.ba_bitmap.set(0);
                }
                user.ba_seq_no = user.start_seq;
                user.num_msdu = user.num_msdu.max(1);
            }
            let outcome = reconcile::reconcile_user(user);
            if outcome.clamped || outcome.extra_acked {
                peer.stats.bitmap_mismatch += 1;
            }
        }
        let tid_idx = usize::from(desc.user().tid);
        let counters = peer.tids[tid_idx].comp_queue.drain_to_working();
        peer.stats.comp_age_out_drops += counters.age_out_drops;
        peer.stats.comp_overflow_drops += counters.overflow_drops;

        let mut xretry_raw = Vec::new();
        let reaped = peer.tids[tid_idx].comp_queue.dequeue_matching(
            desc.ppdu_id,
            usize::from(desc.user().num_msdu),
            desc.start_tsf,
            desc.end_tsf,
            &mut xretry_raw,
        );
        peer.stats.comp_age_out_drops += reaped.age_out_drops;
        if !reaped.complete {
            debug!(
                "ppdu {:#x}: {} of {} msdus reaped",
                desc.ppdu_id,
                reaped.matched.len(),
                desc.user().num_msdu
            );
        }
        if !xretry_raw.is_empty() {
            let mut chains = Vec::new();
            let outcome = restitch::restitch_chains(
                &mut peer.header_cache,
                &desc,
                desc.user(),
                xretry_raw,
                &mut chains,
            );
            peer.stats.restitch_artifacts += outcome.artifacts;
            for (frame, first) in chains {
                peer.tids[tid_idx].xretry_mpdus.push_back(XretryMpdu {
                    frame,
                    ppdu_id: first.ppdu_id,
                    transmit_cnt: first.transmit_cnt,
                });
            }
        }
        let mut user = std::mem::take(&mut desc.users[0]);
        let outcome =
            restitch::restitch_mpdus(&mut peer.header_cache, &desc, &mut user, reaped.matched);
        peer.stats.restitch_artifacts += outcome.artifacts;
        debug!("ppdu {:#x}: {} mpdus restitched", desc.ppdu_id, outcome.restitched);
        desc.users[0] = user;
        Some(desc)
    }

    fn process_bar(&mut self, desc: &PpduDesc) {
        let peer_id = desc.user().peer_id;
        if !self.peer_captured(peer_id) {
            return;
        }
        let vdev_addr = self.peers.get(&peer_id).map(|p| p.vdev_addr).unwrap_or([0; 6]);
        self.dispatcher.deliver_bar(desc, vdev_addr);
    }

    /// Flush-only descriptor: run the excess-retry pass for its peer/TID,
    /// deliver whatever that resolves, keep nothing else.
    fn process_flush(&mut self, desc: &PpduDesc) {
        let user = desc.user();
        let tid_idx = usize::from(user.tid).min(MAX_TIDS - 1);
        if let Some(peer) = self.peers.get_mut(&user.peer_id) {
            let vdev_addr = peer.vdev_addr;
            resolver::apply_xretries(&mut peer.tids[tid_idx]);
            peer.tids[tid_idx].xretry_mpdus.clear();
            self.stats.ppdu_delivered += resolver::deliver_ready(
                &mut peer.tids[tid_idx],
                vdev_addr,
                &mut self.dispatcher,
                &mut peer.stats,
            );
        }
    }

    /// Matches a management/control descriptor against the staged payloads
    /// of its (type, subtype); control frames with no host payload are
    /// synthesized from report fields.
    fn process_mgmt_ctrl(&mut self, desc: PpduDesc) {
        if !self.peer_captured(desc.user().peer_id) {
            return;
        }
        let fc = FrameControl(desc.frame_ctrl);
        let key = (fc.frame_type(), fc.frame_subtype());
        let filtered = desc.user().completion_status == UserCompletionStatus::Filtered;
        let vdev_addr =
            self.peers.get(&desc.user().peer_id).map(|p| p.vdev_addr).unwrap_or([0; 6]);
        loop {
            let staged = self.mgmt_staging.lock().queues.get_mut(&key).and_then(|q| q.pop_front());
            let payload = match staged {
                None => {
                    if fc.frame_type() == mac::FRAME_TYPE_CTRL && !filtered {
                        self.dispatcher.deliver_ctrl(&desc, vdev_addr);
                    }
                    return;
                }
                Some(payload) => payload,
            };
            if !payload.is_sgen && payload.tsf < desc.start_tsf {
                // Host payload from before this aggregate ever started.
                self.stats.mgmt_dropped += 1;
                continue;
            }
            if payload.ppdu_id == desc.ppdu_id {
                if filtered {
                    self.stats.mgmt_dropped += 1;
                    return;
                }
                if let Some(retries) = self.retries_mgmt.get_mut(&key) {
                    // Earlier attempts of this frame never saw their own
                    // payload; deliver them from this one, marked retry.
                    while let Some(retry_desc) = retries.pop_front() {
                        self.dispatcher.deliver_mgmt(&retry_desc, payload.payload.clone(), true);
                    }
                }
                self.dispatcher.deliver_mgmt(&desc, payload.payload, false);
                return;
            }
            if payload.is_sgen
                && payload.tsf < desc.start_tsf.saturating_add(MAX_MGMT_ENQ_DELAY_US)
                && (payload.ppdu_id & SCH_ID_MASK) < (desc.ppdu_id & SCH_ID_MASK)
            {
                // Firmware payload from an earlier schedule; its descriptor
                // is gone.
                self.stats.mgmt_dropped += 1;
                continue;
            }
            // Payload belongs to a later aggregate: put it back and park
            // this descriptor until its payload shows up.
            self.mgmt_staging.lock().queues.entry(key).or_default().push_front(payload);
            if !filtered {
                self.retries_mgmt.entry(key).or_default().push_back(desc);
            }
            return;
        }
    }

    /// Disable drain: every queue emptied, every buffer released.
    fn drain_all(&mut self) {
        if !self.collector.is_empty() {
            let parked = self.collector.drain_all();
            debug!("capture disabled, dropping {} collecting schedules", parked.len());
        }
        {
            let staging = &mut *self.report_staging.lock();
            staging.dropped += staging.q.len() as u64;
            staging.q.clear();
        }
        {
            let staging = &mut *self.mgmt_staging.lock();
            let held: usize = staging.queues.values().map(|q| q.len()).sum();
            staging.dropped += held as u64;
            staging.queues.clear();
        }
        self.retries_mgmt.clear();
        for peer in self.peers.values_mut() {
            peer.flush();
        }
    }
}

//! Pipe-flow state machine: origin eligibility and load-cell triggering
//!
//! Tracks every tracked pipe detection by tracker ID. A pipe becomes
//! eligible once it is confirmed to come from the caster; an eligible pipe
//! entering the load-cell while the cell is armed fires the PLC count
//! trigger exactly once and disarms the cell. The cell re-arms only after
//! it has been seen empty for `rearm_empty_frames` consecutive frames, so
//! a pipe lingering on the cell cannot count twice.
//!
//! Tracks not seen for `stale_track_frames` are reclaimed; one that was
//! still on the load-cell gets a synthesized exit first.

use crate::domain::events::{PipeEnteredLoadcellEvent, PipeEvent, PipeExitedLoadcellEvent};
use crate::domain::roi::{gate_open_roi, RoiManager, RoiName};
use crate::domain::types::{PipeOrigin, PipeRecord, PipeState, PipeStats, TrackDet, TrackId};
use crate::infra::config::{Config, PipeFlowConfig};
use crate::infra::metrics::Metrics;
use crate::io::plc::PlcClient;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Role of the count-trigger tag in `[plc.tags]`
pub const COUNT_TAG_ROLE: &str = "caster_new";

/// Gate whose open zone ends the "till gate" confidence window
const FIRST_GATE: &str = "gate1";

/// Result of one tick
#[derive(Debug, Default)]
pub struct PipeUpdate {
    /// Snapshots of every pipe touched this tick, in processing order
    pub updated: Vec<PipeRecord>,
    pub events: SmallVec<[PipeEvent; 2]>,
}

pub struct PipeFlowFsm {
    rois: Arc<RoiManager>,
    plc: Arc<dyn PlcClient>,
    params: PipeFlowConfig,
    site_id: String,
    count_tag: Option<String>,
    pulse: Duration,
    gate_zone_roi: String,

    pipes: FxHashMap<TrackId, PipeStats>,
    seq: u64,
    armed: bool,
    empty_streak: u64,

    metrics: Option<Arc<Metrics>>,
}

impl PipeFlowFsm {
    pub fn new(rois: Arc<RoiManager>, plc: Arc<dyn PlcClient>, config: &Config) -> Self {
        let count_tag = config.plc().tag(COUNT_TAG_ROLE).map(str::to_string);
        if count_tag.is_none() {
            warn!(role = COUNT_TAG_ROLE, "plc_tag_not_configured");
        }
        Self {
            rois,
            plc,
            params: config.pipe_flow().clone(),
            site_id: config.site_id().to_string(),
            count_tag,
            pulse: config.plc().pulse(),
            gate_zone_roi: gate_open_roi(FIRST_GATE),
            pipes: FxHashMap::default(),
            seq: 0,
            armed: true,
            empty_streak: 0,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    #[inline]
    pub fn empty_streak(&self) -> u64 {
        self.empty_streak
    }

    /// Live tracks
    #[inline]
    pub fn active_count(&self) -> usize {
        self.pipes.len()
    }

    pub fn pipe(&self, tracker_id: TrackId) -> Option<&PipeStats> {
        self.pipes.get(&tracker_id)
    }

    /// Process one frame's detections
    pub fn update(&mut self, frame_idx: u64, ts: f64, dets: &[TrackDet]) -> PipeUpdate {
        let mut out = PipeUpdate::default();
        trace!(frame_idx, ts, dets = dets.len(), tracks = self.pipes.len(), "pipe_fsm_tick");

        self.scan_loadcell(dets);

        for det in dets {
            if !self.is_pipe(det) {
                continue;
            }
            let Some(tid) = det.track_id else { continue };
            let record = self.observe(tid, det, frame_idx, ts, &mut out.events);
            out.updated.push(record);
        }

        self.reclaim_stale(frame_idx, ts, &mut out);
        out
    }

    fn is_pipe(&self, det: &TrackDet) -> bool {
        det.track_id.is_some() && det.is_class(&self.params.pipe_class)
    }

    /// Update the empty streak and re-arm the cell when it has been empty long enough
    fn scan_loadcell(&mut self, dets: &[TrackDet]) {
        let occupied = dets.iter().filter(|d| self.is_pipe(d)).any(|d| {
            let (cx, cy) = d.bbox.centroid();
            self.rois.contains_named(RoiName::Loadcell, cx, cy)
        });

        if occupied {
            self.empty_streak = 0;
            return;
        }
        self.empty_streak += 1;
        if !self.armed && self.empty_streak >= self.params.rearm_empty_frames {
            self.armed = true;
            info!(empty_streak = self.empty_streak, "loadcell_rearmed");
        }
    }

    fn new_pipe(&mut self, tid: TrackId, frame_idx: u64, ts: f64) -> PipeStats {
        self.seq += 1;
        let uid = format!("{}_{}_{:06}", self.site_id, ts as i64, self.seq);
        debug!(tracker_id = tid.0, pipe_uid = %uid, "pipe_track_new");
        if let Some(ref m) = self.metrics {
            m.record_pipe_created();
        }
        let mut p = PipeStats::new(uid, tid);
        p.last_seen_frame = frame_idx;
        p.last_seen_ts = ts;
        p
    }

    fn observe(
        &mut self,
        tid: TrackId,
        det: &TrackDet,
        frame_idx: u64,
        ts: f64,
        events: &mut SmallVec<[PipeEvent; 2]>,
    ) -> PipeRecord {
        let mut p = match self.pipes.remove(&tid) {
            Some(p) => p,
            None => self.new_pipe(tid, frame_idx, ts),
        };
        let (cx, cy) = det.bbox.centroid();

        if p.frames_seen > 0 {
            let missed = frame_idx.saturating_sub(p.last_seen_frame).saturating_sub(1);
            p.frames_missing += missed;
        }
        p.frames_seen += 1;
        p.last_seen_frame = frame_idx;
        p.last_seen_ts = ts;
        p.tracker_id = tid;

        self.assign_origin(&mut p, cx, cy, ts);

        p.conf_sum_full += det.conf;
        p.conf_count_full += 1;
        if !p.reached_gate_zone {
            p.conf_sum_till_gate += det.conf;
            p.conf_count_till_gate += 1;
            if self.rois.contains(&self.gate_zone_roi, cx, cy) {
                p.reached_gate_zone = true;
                debug!(pipe_uid = %p.pipe_uid, "pipe_reached_gate_zone");
            }
        }

        if p.origin == Some(PipeOrigin::Caster) {
            let in_cell = self.rois.contains_named(RoiName::Loadcell, cx, cy);
            if p.t_loadcell_enter.is_none() {
                self.check_entry(&mut p, in_cell, ts, events);
            }
            if p.t_loadcell_enter.is_some() && p.t_loadcell_exit.is_none() {
                self.check_exit(&mut p, in_cell, ts, events);
            }
        }

        let record = PipeRecord::from(&p);
        self.pipes.insert(tid, p);
        record
    }

    /// Sticky: a decided origin never changes
    fn assign_origin(&self, p: &mut PipeStats, cx: f64, cy: f64, ts: f64) {
        if p.origin.is_some() {
            return;
        }
        if self.rois.contains_named(RoiName::CasterOrigin, cx, cy) {
            p.origin_hits += 1;
            if p.origin_hits >= self.params.origin_confirm_frames {
                p.origin = Some(PipeOrigin::Caster);
                p.t_origin.get_or_insert(ts);
                info!(pipe_uid = %p.pipe_uid, tracker_id = p.tracker_id.0, ts, "pipe_origin_caster");
            }
        } else if self.rois.contains_named(RoiName::LeftOrigin, cx, cy)
            || self.rois.contains_named(RoiName::RightOrigin, cx, cy)
        {
            p.origin = Some(PipeOrigin::Other);
            info!(pipe_uid = %p.pipe_uid, tracker_id = p.tracker_id.0, "pipe_origin_other");
        }
    }

    fn check_entry(
        &mut self,
        p: &mut PipeStats,
        in_cell: bool,
        ts: f64,
        events: &mut SmallVec<[PipeEvent; 2]>,
    ) {
        if !in_cell {
            p.loadcell_hits = 0;
            return;
        }
        p.loadcell_hits += 1;
        if !self.armed || p.loadcell_hits < self.params.loadcell_enter_confirm_frames {
            return;
        }

        p.t_loadcell_enter = Some(ts);
        p.state = PipeState::OnLoadcell;
        if p.counted {
            return;
        }

        self.trigger_count(p);
        p.counted = true;
        self.armed = false;
        if let Some(ref m) = self.metrics {
            m.record_loadcell_enter();
            m.record_pipe_counted();
        }
        info!(pipe_uid = %p.pipe_uid, tracker_id = p.tracker_id.0, ts, "pipe_entered_loadcell");
        events.push(PipeEvent::Entered(PipeEnteredLoadcellEvent {
            pipe_uid: p.pipe_uid.clone(),
            tracker_id: p.tracker_id,
            t_enter: ts,
        }));
    }

    fn check_exit(
        &self,
        p: &mut PipeStats,
        in_cell: bool,
        ts: f64,
        events: &mut SmallVec<[PipeEvent; 2]>,
    ) {
        if in_cell {
            p.loadcell_exit_misses = 0;
            return;
        }
        p.loadcell_exit_misses += 1;
        if p.loadcell_exit_misses < self.params.loadcell_exit_confirm_frames {
            return;
        }
        info!(pipe_uid = %p.pipe_uid, tracker_id = p.tracker_id.0, ts, "pipe_exited_loadcell");
        events.push(self.exit(p, ts, false));
    }

    /// Latch the exit and build its event
    fn exit(&self, p: &mut PipeStats, ts: f64, synthesized: bool) -> PipeEvent {
        p.t_loadcell_exit = Some(ts);
        p.state = PipeState::Parked;
        if let Some(ref m) = self.metrics {
            m.record_loadcell_exit(synthesized);
        }
        PipeEvent::Exited(PipeExitedLoadcellEvent {
            pipe_uid: p.pipe_uid.clone(),
            tracker_id: p.tracker_id,
            t_exit: ts,
        })
    }

    /// Fire the count pulse. Blocks for the pulse width. A failure is logged
    /// and the pipe stays counted: a retry could double-count.
    fn trigger_count(&self, p: &PipeStats) {
        let Some(ref tag) = self.count_tag else {
            warn!(pipe_uid = %p.pipe_uid, role = COUNT_TAG_ROLE, "plc_tag_not_configured");
            return;
        };
        let result = self.plc.pulse(tag, self.pulse);
        match result {
            Ok(()) => info!(pipe_uid = %p.pipe_uid, tag = %tag, "plc_pulse"),
            Err(ref e) => error!(pipe_uid = %p.pipe_uid, tag = %tag, error = %e, "plc_pulse_failed"),
        }
        if let Some(ref m) = self.metrics {
            m.record_plc_pulse(result.is_ok());
        }
    }

    fn reclaim_stale(&mut self, frame_idx: u64, ts: f64, out: &mut PipeUpdate) {
        let stale_after = self.params.stale_track_frames;
        let mut stale: SmallVec<[TrackId; 8]> = self
            .pipes
            .iter()
            .filter(|(_, p)| frame_idx.saturating_sub(p.last_seen_frame) > stale_after)
            .map(|(tid, _)| *tid)
            .collect();
        stale.sort_unstable();

        for tid in stale {
            let Some(mut p) = self.pipes.remove(&tid) else { continue };
            info!(
                tracker_id = tid.0,
                pipe_uid = %p.pipe_uid,
                last_seen_frame = p.last_seen_frame,
                "pipe_stale_reclaimed"
            );
            if p.on_loadcell() {
                info!(pipe_uid = %p.pipe_uid, tracker_id = tid.0, ts, "pipe_exit_synthesized");
                out.events.push(self.exit(&mut p, ts, true));
                out.updated.push(PipeRecord::from(&p));
            }
        }
    }
}

#[cfg(test)]
mod tests;

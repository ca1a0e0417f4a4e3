//! Scenario tests for the pipe-flow FSM
//!
//! Layout (pixels): caster origin top-left, side origins bottom corners,
//! gate1 open zone in the middle of the run, load-cell to the right.

use super::*;
use crate::domain::types::BBox;
use crate::infra::config::PlcConfig;
use crate::io::plc::SimulatedPlc;

const ROIS: &str = r#"
roi_caster5_origin = [[0, 0], [100, 0], [100, 100], [0, 100]]
roi_left_origin = [[0, 500], [100, 500], [100, 600], [0, 600]]
roi_right_origin = [[900, 500], [1000, 500], [1000, 600], [900, 600]]
roi_safety_critical = [[150, 0], [350, 0], [350, 150], [150, 150]]
roi_gate1_open = [[200, 0], [260, 0], [260, 100], [200, 100]]
roi_gate1_closed = [[180, 0], [300, 0], [300, 100], [180, 100]]
roi_gate2_open = [[700, 200], [760, 200], [760, 300], [700, 300]]
roi_gate2_closed = [[680, 200], [800, 200], [800, 300], [680, 300]]
roi_loadcell = [[400, 0], [600, 0], [600, 100], [400, 100]]
"#;

const COUNT_TAG: &str = "caster_5_new";

const CASTER: (f64, f64) = (50.0, 50.0);
const RUNWAY: (f64, f64) = (150.0, 50.0);
const GATE: (f64, f64) = (230.0, 50.0);
const BEFORE_CELL: (f64, f64) = (350.0, 50.0);
const CELL: (f64, f64) = (500.0, 50.0);
const PARKED: (f64, f64) = (700.0, 50.0);
const LEFT: (f64, f64) = (50.0, 550.0);

/// FSM plus a frame clock: frame N is stamped `1000 + N` seconds
struct Harness {
    fsm: PipeFlowFsm,
    plc: Arc<SimulatedPlc>,
    metrics: Arc<Metrics>,
    frame: u64,
}

impl Harness {
    fn new() -> Self {
        Self::with_flow(PipeFlowConfig::default())
    }

    fn with_flow(flow: PipeFlowConfig) -> Self {
        let mut plc_cfg = PlcConfig { pulse_ms: 1, ..PlcConfig::default() };
        plc_cfg.tags.insert(COUNT_TAG_ROLE.to_string(), COUNT_TAG.to_string());
        let config = Config::default().with_pipe_flow(flow).with_plc(plc_cfg);

        let rois = Arc::new(RoiManager::from_toml_str(ROIS).unwrap());
        let plc = Arc::new(SimulatedPlc::new());
        let metrics = Arc::new(Metrics::new());
        let fsm = PipeFlowFsm::new(rois, plc.clone(), &config).with_metrics(metrics.clone());
        Self { fsm, plc, metrics, frame: 0 }
    }

    fn ts(frame: u64) -> f64 {
        1000.0 + frame as f64
    }

    fn step(&mut self, dets: &[TrackDet]) -> PipeUpdate {
        self.frame += 1;
        self.fsm.update(self.frame, Self::ts(self.frame), dets)
    }

    /// Same detections for `n` frames, all events collected
    fn hold(&mut self, dets: &[TrackDet], n: usize) -> Vec<PipeEvent> {
        (0..n).flat_map(|_| self.step(dets).events).collect()
    }

    fn empty(&mut self, n: usize) -> Vec<PipeEvent> {
        self.hold(&[], n)
    }

    fn pulses(&self) -> u32 {
        self.plc.pulse_count(COUNT_TAG)
    }

    fn stats(&self, tid: i64) -> &PipeStats {
        self.fsm.pipe(TrackId(tid)).unwrap()
    }

    /// Walk a fresh track from the caster onto the load-cell
    fn deliver(&mut self, tid: i64) -> Vec<PipeEvent> {
        let mut events = self.hold(&[pipe(tid, CASTER)], 2);
        for at in [RUNWAY, GATE, BEFORE_CELL, CELL] {
            events.extend(self.step(&[pipe(tid, at)]).events);
        }
        events
    }
}

/// 20x20 pipe box centred on `at`
fn pipe(tid: i64, at: (f64, f64)) -> TrackDet {
    pipe_conf(tid, at, 0.9)
}

fn pipe_conf(tid: i64, at: (f64, f64), conf: f64) -> TrackDet {
    let (x, y) = at;
    TrackDet::new("pipe", conf, Some(tid), BBox::new(x - 10.0, y - 10.0, x + 10.0, y + 10.0))
}

fn entered(events: &[PipeEvent]) -> usize {
    events.iter().filter(|e| matches!(e, PipeEvent::Entered(_))).count()
}

fn exited(events: &[PipeEvent]) -> usize {
    events.iter().filter(|e| matches!(e, PipeEvent::Exited(_))).count()
}

// ============================================================================
// Identity and bookkeeping
// ============================================================================

#[test]
fn test_new_track_gets_uid_on_first_sight() {
    let mut h = Harness::new();
    let out = h.step(&[pipe(7, RUNWAY)]);

    assert_eq!(out.updated.len(), 1);
    assert_eq!(out.updated[0].pipe_uid, "caster5_1001_000001");
    assert_eq!(out.updated[0].origin, None);
    assert_eq!(h.fsm.active_count(), 1);

    h.step(&[pipe(8, RUNWAY)]);
    assert_eq!(h.stats(8).pipe_uid, "caster5_1002_000002");
    // Existing track keeps its uid
    assert_eq!(h.stats(7).pipe_uid, "caster5_1001_000001");
}

#[test]
fn test_untracked_and_foreign_detections_ignored() {
    let mut h = Harness::new();
    let untracked = TrackDet::new("pipe", 0.9, None, BBox::new(490.0, 40.0, 510.0, 60.0));
    let person = TrackDet::new("human", 0.9, Some(3), BBox::new(490.0, 40.0, 510.0, 60.0));

    let out = h.step(&[untracked, person]);
    assert!(out.updated.is_empty());
    assert_eq!(h.fsm.active_count(), 0);
    // Neither counts as load-cell occupancy
    assert_eq!(h.fsm.empty_streak(), 1);
}

#[test]
fn test_class_match_agrees_for_tracking_and_occupancy() {
    let mut h = Harness::new();
    let shouty = TrackDet::new("PIPE", 0.9, Some(4), BBox::new(490.0, 40.0, 510.0, 60.0));

    let out = h.step(&[shouty]);
    assert_eq!(out.updated.len(), 1);
    assert_eq!(h.fsm.active_count(), 1);
    assert_eq!(h.fsm.empty_streak(), 0);
}

#[test]
fn test_missing_frames_accounted() {
    let mut h = Harness::new();
    h.step(&[pipe(1, RUNWAY)]);
    h.empty(3);
    h.step(&[pipe(1, RUNWAY)]);
    h.step(&[pipe(1, RUNWAY)]);

    let p = h.stats(1);
    assert_eq!(p.frames_seen, 3);
    assert_eq!(p.frames_missing, 3);
    assert_eq!(p.last_seen_frame, 6);
    assert_eq!(p.last_seen_ts, 1006.0);
}

// ============================================================================
// Origin
// ============================================================================

#[test]
fn test_caster_origin_latches_on_confirming_frame() {
    let mut h = Harness::new();
    h.step(&[pipe(1, CASTER)]);
    assert_eq!(h.stats(1).origin, None);

    h.step(&[pipe(1, CASTER)]);
    let p = h.stats(1);
    assert_eq!(p.origin, Some(PipeOrigin::Caster));
    assert_eq!(p.t_origin, Some(1002.0));

    h.hold(&[pipe(1, CASTER)], 3);
    assert_eq!(h.stats(1).t_origin, Some(1002.0));
}

#[test]
fn test_side_origin_is_immediate_and_sticky() {
    let mut h = Harness::new();
    h.step(&[pipe(1, LEFT)]);
    assert_eq!(h.stats(1).origin, Some(PipeOrigin::Other));

    h.hold(&[pipe(1, CASTER)], 3);
    let p = h.stats(1);
    assert_eq!(p.origin, Some(PipeOrigin::Other));
    assert_eq!(p.t_origin, None);
}

#[test]
fn test_other_pipe_never_triggers() {
    let mut h = Harness::new();
    h.step(&[pipe(1, LEFT)]);
    let events = h.hold(&[pipe(1, CELL)], 5);

    assert!(events.is_empty());
    assert_eq!(h.pulses(), 0);
    assert_eq!(h.stats(1).t_loadcell_enter, None);
}

#[test]
fn test_pipe_without_origin_never_triggers() {
    let mut h = Harness::new();
    let events = h.hold(&[pipe(1, CELL)], 5);
    assert!(events.is_empty());
    assert_eq!(h.pulses(), 0);
}

// ============================================================================
// Confidence
// ============================================================================

#[test]
fn test_till_gate_window_closes_at_gate_zone() {
    let mut h = Harness::new();
    h.step(&[pipe_conf(1, RUNWAY, 0.8)]);
    h.step(&[pipe_conf(1, GATE, 0.6)]);
    h.step(&[pipe_conf(1, BEFORE_CELL, 0.1)]);

    let p = h.stats(1);
    assert!(p.reached_gate_zone);
    assert_eq!(p.conf_count_till_gate, 2);
    assert!((p.avg_conf_till_gate() - 0.7).abs() < 1e-9);
    assert_eq!(p.conf_count_full, 3);
    assert!((p.avg_conf_full() - 0.5).abs() < 1e-9);
}

// ============================================================================
// Load-cell
// ============================================================================

#[test]
fn test_caster_pipe_counts_once() {
    let mut h = Harness::new();
    let events = h.deliver(1);

    assert_eq!(entered(&events), 1);
    assert_eq!(h.pulses(), 1);
    let p = h.stats(1);
    assert!(p.counted);
    assert_eq!(p.state, PipeState::OnLoadcell);
    assert_eq!(p.t_loadcell_enter, Some(1006.0));
    assert!(!h.fsm.is_armed());

    // Lingering on the cell does not re-trigger
    let more = h.hold(&[pipe(1, CELL)], 20);
    assert!(more.is_empty());
    assert_eq!(h.pulses(), 1);
    assert_eq!(h.metrics.pipes_counted(), 1);
}

#[test]
fn test_entered_event_carries_identity() {
    let mut h = Harness::new();
    let events = h.deliver(4);
    let PipeEvent::Entered(ev) = &events[0] else {
        panic!("expected entry, got {:?}", events[0]);
    };
    assert_eq!(ev.tracker_id, TrackId(4));
    assert_eq!(ev.pipe_uid, h.stats(4).pipe_uid);
    assert_eq!(ev.t_enter, 1006.0);
}

#[test]
fn test_exit_needs_consecutive_misses() {
    let mut h = Harness::new();
    h.deliver(1);

    assert!(h.step(&[pipe(1, PARKED)]).events.is_empty());
    // Back inside resets the miss counter
    h.step(&[pipe(1, CELL)]);
    assert_eq!(h.stats(1).loadcell_exit_misses, 0);

    assert!(h.step(&[pipe(1, PARKED)]).events.is_empty());
    let out = h.step(&[pipe(1, PARKED)]);
    assert_eq!(exited(&out.events), 1);

    let p = h.stats(1);
    assert_eq!(p.state, PipeState::Parked);
    assert_eq!(p.t_loadcell_exit, Some(Harness::ts(h.frame)));

    // Exit latches once
    assert!(h.hold(&[pipe(1, PARKED)], 5).is_empty());
}

#[test]
fn test_entry_requires_consecutive_hits() {
    let mut h = Harness::with_flow(PipeFlowConfig {
        loadcell_enter_confirm_frames: 3,
        ..PipeFlowConfig::default()
    });
    h.hold(&[pipe(1, CASTER)], 2);

    h.hold(&[pipe(1, CELL)], 2);
    h.step(&[pipe(1, BEFORE_CELL)]);
    assert_eq!(h.stats(1).loadcell_hits, 0);
    assert_eq!(h.pulses(), 0);

    h.hold(&[pipe(1, CELL)], 2);
    assert_eq!(h.pulses(), 0);
    let out = h.step(&[pipe(1, CELL)]);
    assert_eq!(entered(&out.events), 1);
    assert_eq!(h.pulses(), 1);
}

#[test]
fn test_second_pipe_counts_after_rearm() {
    let mut h = Harness::new();
    h.deliver(1);
    h.hold(&[pipe(1, PARKED)], 2);

    // Cell has been empty only briefly: a new pipe is not counted yet
    h.hold(&[pipe(2, CASTER)], 2);
    assert!(!h.fsm.is_armed());

    // 4 empty frames so far; 6 more reach the re-arm threshold of 10
    h.hold(&[pipe(2, RUNWAY)], 6);
    assert!(h.fsm.is_armed());

    let out = h.step(&[pipe(2, CELL)]);
    assert_eq!(entered(&out.events), 1);
    assert_eq!(h.pulses(), 2);
    assert_ne!(h.stats(1).pipe_uid, h.stats(2).pipe_uid);
}

#[test]
fn test_disarmed_cell_blocks_second_pipe() {
    let mut h = Harness::new();
    h.deliver(1);

    // Pipe 2 follows while pipe 1 is still on the cell
    h.hold(&[pipe(1, CELL), pipe(2, CASTER)], 2);
    let events = h.hold(&[pipe(1, CELL), pipe(2, CELL)], 5);

    assert_eq!(entered(&events), 0);
    assert_eq!(h.pulses(), 1);
    let p2 = h.stats(2);
    assert_eq!(p2.t_loadcell_enter, None);
    assert!(!p2.counted);
    assert_eq!(p2.loadcell_hits, 5);
}

#[test]
fn test_rearm_requires_empty_streak() {
    let mut h = Harness::new();
    h.deliver(1);
    h.hold(&[pipe(1, PARKED)], 9);
    assert_eq!(h.fsm.empty_streak(), 9);
    assert!(!h.fsm.is_armed());

    h.step(&[pipe(1, PARKED)]);
    assert!(h.fsm.is_armed());
}

// ============================================================================
// Stale reclamation
// ============================================================================

#[test]
fn test_stale_track_on_cell_gets_synthesized_exit() {
    let mut h = Harness::with_flow(PipeFlowConfig { stale_track_frames: 5, ..PipeFlowConfig::default() });
    h.deliver(1);
    let uid = h.stats(1).pipe_uid.clone();

    let quiet = h.empty(5);
    assert!(quiet.is_empty());
    assert_eq!(h.fsm.active_count(), 1);

    let out = h.step(&[]);
    assert_eq!(exited(&out.events), 1);
    assert_eq!(out.events[0].pipe_uid(), uid);
    assert_eq!(out.events[0].ts(), Harness::ts(h.frame));
    assert_eq!(out.updated.len(), 1);
    assert_eq!(out.updated[0].state, PipeState::Parked);
    assert_eq!(h.fsm.active_count(), 0);

    // Nothing left to reclaim
    assert!(h.empty(10).is_empty());
    assert_eq!(h.metrics.report().stale_exits, 1);
}

#[test]
fn test_stale_track_off_cell_dropped_silently() {
    let mut h = Harness::with_flow(PipeFlowConfig { stale_track_frames: 3, ..PipeFlowConfig::default() });
    h.step(&[pipe(1, RUNWAY)]);

    let events = h.empty(4);
    assert!(events.is_empty());
    assert_eq!(h.fsm.active_count(), 0);
}

#[test]
fn test_reused_tracker_id_is_a_new_pipe() {
    let mut h = Harness::with_flow(PipeFlowConfig { stale_track_frames: 2, ..PipeFlowConfig::default() });
    h.step(&[pipe(9, RUNWAY)]);
    let first = h.stats(9).pipe_uid.clone();
    h.empty(3);

    h.step(&[pipe(9, RUNWAY)]);
    assert_ne!(h.stats(9).pipe_uid, first);
    assert_eq!(h.stats(9).frames_missing, 0);
}

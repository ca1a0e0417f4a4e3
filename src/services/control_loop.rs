//! Decision loop orchestrator
//!
//! Owns both state machines and every collaborator they report to. One
//! [`ControlLoop::tick`] runs gate FSM, pipe-flow FSM, persistence, PLC
//! side signals and recording for a single frame, start to finish, on the
//! caller's thread. Settings are polled from the store on the same thread.

use crate::domain::events::{EventKind, GateOpenedEvent, PipeEvent};
use crate::domain::roi::RoiManager;
use crate::domain::types::{now_ts, Frame, TrackDet};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::detections::DetectionFrame;
use crate::io::overlay::Overlay;
use crate::io::plc::PlcClient;
use crate::io::recorder::SegmentedRecorder;
use crate::io::store::Store;
use crate::services::gate_fsm::GateFsm;
use crate::services::gate_sources::{build_gate_source, GateSourceKind};
use crate::services::pipe_fsm::PipeFlowFsm;
use anyhow::{Context, Result};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Live setting selecting the gate status source
pub const GATE_SOURCE_KEY: &str = "gate_source";

/// Role of the optional "pipe on load-cell" tag in `[plc.tags]`
pub const ON_LOADCELL_TAG_ROLE: &str = "pipe_on_loadcell";

/// What one tick produced
#[derive(Debug, Default)]
pub struct TickReport {
    pub gate_events: Vec<GateOpenedEvent>,
    pub pipe_events: SmallVec<[PipeEvent; 2]>,
    pub pipes_updated: usize,
}

/// Caps the loop rate by sleeping out the rest of each frame period
#[derive(Debug)]
pub struct RateLimiter {
    period: Option<Duration>,
    last: Option<Instant>,
}

impl RateLimiter {
    /// `max_fps == 0` disables limiting
    pub fn new(max_fps: u32) -> Self {
        let period = (max_fps > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(max_fps)));
        Self { period, last: None }
    }

    pub fn sleep_if_needed(&mut self) {
        let Some(period) = self.period else { return };
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Parse an operator-supplied source name, falling back to geometry
fn parse_source(value: &str) -> GateSourceKind {
    value.parse().unwrap_or_else(|e| {
        warn!(value = %value, error = %e, "gate_source_invalid_using_geometry");
        GateSourceKind::Geometry
    })
}

pub struct ControlLoop {
    config: Config,
    rois: Arc<RoiManager>,
    plc: Arc<dyn PlcClient>,
    store: Box<dyn Store>,
    gate_fsm: GateFsm,
    pipe_fsm: PipeFlowFsm,
    recorder: Option<SegmentedRecorder>,
    overlay: Overlay,
    metrics: Arc<Metrics>,

    /// Raw setting value the gate FSM was built from
    gate_source: String,
    on_loadcell_tag: Option<String>,
    flush_every: Duration,
    poll_every: Duration,
    last_flush: Instant,
    last_poll: Instant,
    closed: bool,
}

impl ControlLoop {
    /// Build both FSMs. Seeds the `gate_source` setting from
    /// `gate.source_default` when the store has none.
    pub fn new(
        config: Config,
        rois: Arc<RoiManager>,
        plc: Arc<dyn PlcClient>,
        mut store: Box<dyn Store>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        rois.validate(&config.gate().names)?;

        let default_source = config.gate().source_default.clone();
        let gate_source = store
            .get_setting(GATE_SOURCE_KEY, &default_source)
            .context("failed to read gate_source setting")?;
        store
            .set_setting(GATE_SOURCE_KEY, &gate_source)
            .context("failed to seed gate_source setting")?;

        let gate_fsm = Self::build_gate_fsm(&config, &rois, &plc, &metrics, &gate_source);
        let pipe_fsm =
            PipeFlowFsm::new(rois.clone(), plc.clone(), &config).with_metrics(metrics.clone());
        let on_loadcell_tag = config.plc().tag(ON_LOADCELL_TAG_ROLE).map(str::to_string);
        let overlay = Overlay::new(rois.clone(), &config);

        info!(
            site = %config.site_id(),
            gate_source = %gate_source,
            gates = ?config.gate().names,
            "control_loop_ready"
        );

        let now = Instant::now();
        Ok(Self {
            flush_every: config.db_flush_interval(),
            poll_every: config.settings_poll_interval(),
            config,
            rois,
            plc,
            store,
            gate_fsm,
            pipe_fsm,
            recorder: None,
            overlay,
            metrics,
            gate_source,
            on_loadcell_tag,
            last_flush: now,
            last_poll: now,
            closed: false,
        })
    }

    /// Attach a started recorder; annotated frames are pushed to it every tick
    pub fn with_recorder(mut self, recorder: SegmentedRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    fn build_gate_fsm(
        config: &Config,
        rois: &Arc<RoiManager>,
        plc: &Arc<dyn PlcClient>,
        metrics: &Arc<Metrics>,
        raw_source: &str,
    ) -> GateFsm {
        let kind = parse_source(raw_source);
        let source = build_gate_source(kind, config, rois, plc);
        GateFsm::new(source, plc.clone(), config).with_metrics(metrics.clone())
    }

    pub fn gate_fsm(&self) -> &GateFsm {
        &self.gate_fsm
    }

    pub fn pipe_fsm(&self) -> &PipeFlowFsm {
        &self.pipe_fsm
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Operator-side access, e.g. changing a setting in place
    pub fn store_mut(&mut self) -> &mut dyn Store {
        self.store.as_mut()
    }

    pub fn gate_source(&self) -> GateSourceKind {
        self.gate_fsm.source_kind()
    }

    /// Run one frame through the whole decision pipeline
    pub fn tick(
        &mut self,
        frame_idx: u64,
        ts: f64,
        frame: Option<&Frame>,
        dets: &[TrackDet],
    ) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        report.gate_events = self.gate_fsm.update(ts, frame, Some(dets));
        for ev in &report.gate_events {
            let details = format!("{}@{:.3}", ev.gate_name, ev.t_open);
            let res = self.store.insert_event(ev.t_open, EventKind::GateOpen, None, &details);
            self.check_write(res, "gate_open");
        }

        let update = self.pipe_fsm.update(frame_idx, ts, dets);
        for ev in &update.events {
            let details = format!("tid={}", ev.tracker_id().0);
            let res = self.store.insert_event(ev.ts(), ev.kind(), Some(ev.pipe_uid()), &details);
            self.check_write(res, ev.kind().as_str());
            if matches!(ev, PipeEvent::Entered(_)) {
                self.signal_on_loadcell(ev.pipe_uid());
            }
        }
        for record in &update.updated {
            let res = self.store.upsert_pipe(record);
            self.check_write(res, "pipe");
        }
        report.pipes_updated = update.updated.len();
        report.pipe_events = update.events;

        if let (Some(rec), Some(frame)) = (&self.recorder, frame) {
            rec.push(&self.overlay.draw(frame, dets, ts), ts);
        }

        self.maintain();

        let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.metrics.record_frame(latency_us);
        self.metrics.set_active_pipes(self.pipe_fsm.active_count());
        debug!(
            frame_idx,
            dets = dets.len(),
            gate_events = report.gate_events.len(),
            pipe_events = report.pipe_events.len(),
            latency_us,
            "tick"
        );
        report
    }

    /// Replay detector frames until the source ends or `stop` is raised.
    ///
    /// Honours `frame_skip` and `max_fps`. The FSMs see processed-frame
    /// indices, so skipped frames never count as a track going missing.
    /// Returns the number of frames ticked.
    pub fn run<I>(&mut self, frames: I, stop: &AtomicBool) -> u64
    where
        I: IntoIterator<Item = DetectionFrame>,
    {
        let skip = u64::from(self.config.runtime().frame_skip);
        let mut limiter = RateLimiter::new(self.config.runtime().max_fps);
        let mut ticked = 0u64;

        for (feed_idx, item) in (0u64..).zip(frames) {
            if stop.load(Ordering::Relaxed) {
                info!(feed_idx, ticked, "control_loop_stop_requested");
                break;
            }
            if skip > 0 && feed_idx % (skip + 1) != 0 {
                continue;
            }

            let image = item.load_image();
            let ts = item.ts.unwrap_or_else(now_ts);
            self.tick(ticked, ts, image.as_ref(), &item.detections);
            ticked += 1;

            limiter.sleep_if_needed();
        }
        ticked
    }

    fn signal_on_loadcell(&self, pipe_uid: &str) {
        let Some(ref tag) = self.on_loadcell_tag else { return };
        let result = self.plc.pulse(tag, self.config.plc().pulse());
        if let Err(ref e) = result {
            error!(pipe_uid = %pipe_uid, tag = %tag, error = %e, "plc_pulse_failed");
        }
        self.metrics.record_plc_pulse(result.is_ok());
    }

    /// A failed write is logged and counted; the loop keeps running
    fn check_write(&self, result: Result<()>, what: &str) {
        if let Err(e) = result {
            error!(what, error = %e, "db_write_failed");
            self.metrics.record_db_error();
        }
    }

    /// Periodic commit and settings poll
    fn maintain(&mut self) {
        if self.last_flush.elapsed() >= self.flush_every {
            self.commit();
            self.last_flush = Instant::now();
        }
        if self.last_poll.elapsed() >= self.poll_every {
            self.poll_settings();
            self.last_poll = Instant::now();
        }
    }

    fn commit(&mut self) {
        let result = self.store.commit();
        if let Err(ref e) = result {
            error!(error = %e, "db_commit_failed");
        }
        self.metrics.record_db_commit(result.is_ok());
    }

    /// Rebuild the gate FSM when the operator changed the source.
    /// Debounce state of the old FSM is discarded.
    pub fn poll_settings(&mut self) {
        let current = match self.store.get_setting(GATE_SOURCE_KEY, &self.gate_source) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "settings_poll_failed");
                self.metrics.record_db_error();
                return;
            }
        };
        if current == self.gate_source {
            return;
        }

        info!(from = %self.gate_source, to = %current, "gate_source_changed");
        self.gate_fsm =
            Self::build_gate_fsm(&self.config, &self.rois, &self.plc, &self.metrics, &current);
        let details = format!("{GATE_SOURCE_KEY}={current}");
        self.gate_source = current;

        let res = self
            .store
            .insert_event(now_ts(), EventKind::SettingChanged, None, &details);
        self.check_write(res, "setting_changed");
        self.commit();
    }

    /// Commit and close the store, stop the recorder within its grace
    /// period and close the PLC. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.commit();
        if let Err(e) = self.store.close() {
            error!(error = %e, "db_close_failed");
        }
        if let Some(ref mut rec) = self.recorder {
            rec.stop();
        }
        self.plc.close();
        info!(active_pipes = self.pipe_fsm.active_count(), "control_loop_stopped");
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

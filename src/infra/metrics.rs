//! Line counters and tick latency, summarised every `metrics.interval_secs`
//!
//! The decision loop, the recorder worker and the reporter task share one
//! `Arc<Metrics>`. Only `report()` resets anything. Counters are Relaxed
//! atomics: they feed the summary log and nothing reads them to decide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Tick latency bucket ceilings in microseconds, doubling from 100µs.
/// The last bucket catches everything slower than ~51ms.
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = BUCKET_BOUNDS.len() + 1;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Ceiling reported for a bucket; the open-ended one reports twice the last bound
fn bucket_ceiling(i: usize) -> u64 {
    BUCKET_BOUNDS.get(i).copied().unwrap_or(BUCKET_BOUNDS[BUCKET_BOUNDS.len() - 1] * 2)
}

fn drain_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Bucket ceiling at quantile `q` (0..=1), 0 when nothing was recorded
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], q: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }
    let target = (total as f64 * q) as u64;
    let mut seen = 0u64;
    buckets
        .iter()
        .position(|&count| {
            seen += count;
            seen >= target
        })
        .map_or(bucket_ceiling(NUM_BUCKETS - 1), bucket_ceiling)
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Frames run through the decision loop (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Tick latency in microseconds (reset on report)
    tick_sum_us: AtomicU64,
    tick_max_us: AtomicU64,
    tick_buckets: [AtomicU64; NUM_BUCKETS],
    /// Pipe lifecycle (monotonic)
    pipes_created: AtomicU64,
    pipes_counted: AtomicU64,
    loadcell_enters: AtomicU64,
    loadcell_exits: AtomicU64,
    /// Exits synthesized for tracks that vanished on the load-cell
    stale_exits: AtomicU64,
    gate_opens: AtomicU64,
    /// PLC outputs (monotonic)
    plc_pulses: AtomicU64,
    plc_failures: AtomicU64,
    /// Persistence (monotonic)
    db_commits: AtomicU64,
    db_errors: AtomicU64,
    /// Recorder (monotonic)
    rec_frames_enqueued: AtomicU64,
    rec_frames_dropped: AtomicU64,
    rec_frames_written: AtomicU64,
    rec_segments_opened: AtomicU64,
    rec_open_failures: AtomicU64,
    /// Recorder queue depth (updated on every enqueue)
    rec_queue_depth: AtomicU64,
    /// Live pipe tracks (gauge, set every tick)
    active_pipes: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            tick_sum_us: AtomicU64::new(0),
            tick_max_us: AtomicU64::new(0),
            tick_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            pipes_created: AtomicU64::new(0),
            pipes_counted: AtomicU64::new(0),
            loadcell_enters: AtomicU64::new(0),
            loadcell_exits: AtomicU64::new(0),
            stale_exits: AtomicU64::new(0),
            gate_opens: AtomicU64::new(0),
            plc_pulses: AtomicU64::new(0),
            plc_failures: AtomicU64::new(0),
            db_commits: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
            rec_frames_enqueued: AtomicU64::new(0),
            rec_frames_dropped: AtomicU64::new(0),
            rec_frames_written: AtomicU64::new(0),
            rec_segments_opened: AtomicU64::new(0),
            rec_open_failures: AtomicU64::new(0),
            rec_queue_depth: AtomicU64::new(0),
            active_pipes: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one processed frame with its decision-loop latency
    #[inline]
    pub fn record_frame(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.tick_max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pipe_created(&self) {
        self.pipes_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pipe_counted(&self) {
        self.pipes_counted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_loadcell_enter(&self) {
        self.loadcell_enters.fetch_add(1, Ordering::Relaxed);
    }

    /// `synthesized` marks an exit emitted by stale-track reclamation
    #[inline]
    pub fn record_loadcell_exit(&self, synthesized: bool) {
        self.loadcell_exits.fetch_add(1, Ordering::Relaxed);
        if synthesized {
            self.stale_exits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_gate_open(&self) {
        self.gate_opens.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_plc_pulse(&self, ok: bool) {
        if ok {
            self.plc_pulses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plc_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_db_commit(&self, ok: bool) {
        if ok {
            self.db_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.db_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_db_error(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rec_enqueued(&self, queue_depth: usize) {
        self.rec_frames_enqueued.fetch_add(1, Ordering::Relaxed);
        self.rec_queue_depth.store(queue_depth as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rec_dropped(&self) {
        self.rec_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rec_written(&self) {
        self.rec_frames_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rec_segment_opened(&self) {
        self.rec_segments_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rec_open_failure(&self) {
        self.rec_open_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_active_pipes(&self, count: usize) {
        self.active_pipes.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pipes_counted(&self) -> u64 {
        self.pipes_counted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn plc_failures(&self) -> u64 {
        self.plc_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn gate_opens(&self) -> u64 {
        self.gate_opens.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rec_frames_dropped(&self) -> u64 {
        self.rec_frames_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rec_frames_written(&self) -> u64 {
        self.rec_frames_written.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rec_segments_opened(&self) -> u64 {
        self.rec_segments_opened.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let tick_sum = self.tick_sum_us.swap(0, Ordering::Relaxed);
        let tick_max = self.tick_max_us.swap(0, Ordering::Relaxed);
        let tick_buckets = drain_buckets(&self.tick_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let fps = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let tick_avg_us = if frames_count > 0 { tick_sum / frames_count } else { 0 };

        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            fps,
            tick_avg_us,
            tick_max_us: tick_max,
            tick_buckets,
            tick_p50_us: percentile_from_buckets(&tick_buckets, 0.50),
            tick_p99_us: percentile_from_buckets(&tick_buckets, 0.99),
            active_pipes: self.active_pipes.load(Ordering::Relaxed),
            pipes_created: self.pipes_created.load(Ordering::Relaxed),
            pipes_counted: self.pipes_counted.load(Ordering::Relaxed),
            loadcell_enters: self.loadcell_enters.load(Ordering::Relaxed),
            loadcell_exits: self.loadcell_exits.load(Ordering::Relaxed),
            stale_exits: self.stale_exits.load(Ordering::Relaxed),
            gate_opens: self.gate_opens.load(Ordering::Relaxed),
            plc_pulses: self.plc_pulses.load(Ordering::Relaxed),
            plc_failures: self.plc_failures.load(Ordering::Relaxed),
            db_commits: self.db_commits.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
            rec_frames_enqueued: self.rec_frames_enqueued.load(Ordering::Relaxed),
            rec_frames_dropped: self.rec_frames_dropped.load(Ordering::Relaxed),
            rec_frames_written: self.rec_frames_written.load(Ordering::Relaxed),
            rec_segments_opened: self.rec_segments_opened.load(Ordering::Relaxed),
            rec_open_failures: self.rec_open_failures.load(Ordering::Relaxed),
            rec_queue_depth: self.rec_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub fps: f64,
    pub tick_avg_us: u64,
    pub tick_max_us: u64,
    /// Decision-loop latency histogram
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub tick_buckets: [u64; NUM_BUCKETS],
    pub tick_p50_us: u64,
    pub tick_p99_us: u64,
    /// Pipes currently tracked (snapshot)
    pub active_pipes: u64,
    pub pipes_created: u64,
    pub pipes_counted: u64,
    pub loadcell_enters: u64,
    pub loadcell_exits: u64,
    pub stale_exits: u64,
    pub gate_opens: u64,
    pub plc_pulses: u64,
    pub plc_failures: u64,
    pub db_commits: u64,
    pub db_errors: u64,
    pub rec_frames_enqueued: u64,
    pub rec_frames_dropped: u64,
    pub rec_frames_written: u64,
    pub rec_segments_opened: u64,
    pub rec_open_failures: u64,
    pub rec_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            fps = format!("{:.1}", self.fps),
            tick_avg_us = %self.tick_avg_us,
            tick_max_us = %self.tick_max_us,
            tick_p50_us = %self.tick_p50_us,
            tick_p99_us = %self.tick_p99_us,
            active_pipes = %self.active_pipes,
            pipes_created = %self.pipes_created,
            pipes_counted = %self.pipes_counted,
            loadcell_enters = %self.loadcell_enters,
            loadcell_exits = %self.loadcell_exits,
            stale_exits = %self.stale_exits,
            gate_opens = %self.gate_opens,
            plc_pulses = %self.plc_pulses,
            plc_failures = %self.plc_failures,
            db_errors = %self.db_errors,
            rec_written = %self.rec_frames_written,
            rec_dropped = %self.rec_frames_dropped,
            rec_segments = %self.rec_segments_opened,
            rec_queue = %self.rec_queue_depth,
            "metrics"
        );
    }
}

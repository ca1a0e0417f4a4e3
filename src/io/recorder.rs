//! Segmented video recorder
//!
//! The decision loop pushes `(frame, ts)` into a bounded queue and returns
//! immediately. One worker thread drains the queue into rotating segment
//! files:
//! - a segment opens lazily on the first frame after start or rotation
//! - it closes once `segment_secs` have elapsed since it opened
//! - for `gap_secs` after a close, incoming frames are discarded
//! - frames whose size differs from the segment's are resized to match
//! - a writer that fails to open is retried on a later frame after a short backoff
//!
//! Segments are Motion-JPEG streams (concatenated JPEG images), which ffmpeg
//! and most players read directly. The writer sits behind
//! [`SegmentWriterFactory`] so another container can be swapped in.

use crate::domain::types::Frame;
use crate::infra::config::RecordingConfig;
use crate::infra::metrics::Metrics;
use anyhow::{Context, Result};
use chrono::format::{Item, StrftimeItems};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Worker poll interval while the queue is empty
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Pause after a writer fails to open
const OPEN_RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Pause after a frame write fails and the segment is abandoned
const WRITE_FAIL_BACKOFF: Duration = Duration::from_millis(200);

const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Log writer open failure (cold path)
#[cold]
fn log_open_failed(path: &Path, e: &anyhow::Error) {
    error!(path = %path.display(), error = %e, "recording_open_failed");
}

/// Log frame write failure (cold path)
#[cold]
fn log_write_failed(path: &Path, e: &anyhow::Error) {
    error!(path = %path.display(), error = %e, "recording_write_failed");
}

/// One open segment file
pub trait SegmentSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens segment files of one container format
pub trait SegmentWriterFactory: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &str;

    fn open(&self, path: &Path, size: (u32, u32), fps: f64) -> Result<Box<dyn SegmentSink>>;
}

/// Motion-JPEG writer
pub struct MjpegWriterFactory {
    quality: u8,
}

impl MjpegWriterFactory {
    pub fn new(quality: u8) -> Self {
        Self { quality: quality.clamp(1, 100) }
    }
}

impl SegmentWriterFactory for MjpegWriterFactory {
    fn extension(&self) -> &str {
        "mjpeg"
    }

    fn open(&self, path: &Path, _size: (u32, u32), _fps: f64) -> Result<Box<dyn SegmentSink>> {
        let file = File::create(path)
            .with_context(|| format!("failed to create segment {}", path.display()))?;
        Ok(Box::new(MjpegSink { out: BufWriter::new(file), quality: self.quality }))
    }
}

struct MjpegSink {
    out: BufWriter<File>,
    quality: u8,
}

impl SegmentSink for MjpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        JpegEncoder::new_with_quality(&mut self.out, self.quality)
            .encode_image(frame)
            .context("JPEG encode failed")
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

/// Fall back to the default filename timestamp when the configured one is not a valid strftime pattern
fn checked_timestamp_format(fmt: &str) -> String {
    if fmt.is_empty() || StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
        warn!(format = %fmt, "recording_bad_timestamp_format");
        DEFAULT_TIMESTAMP_FORMAT.to_string()
    } else {
        fmt.to_string()
    }
}

/// Background segmented recorder
pub struct SegmentedRecorder {
    cfg: RecordingConfig,
    factory: Arc<dyn SegmentWriterFactory>,
    metrics: Option<Arc<Metrics>>,
    tx: Option<Sender<(Frame, f64)>>,
    done_rx: Option<Receiver<()>>,
    abort: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SegmentedRecorder {
    pub fn new(cfg: RecordingConfig) -> Self {
        let factory = Arc::new(MjpegWriterFactory::new(cfg.jpeg_quality));
        Self {
            cfg,
            factory,
            metrics: None,
            tx: None,
            done_rx: None,
            abort: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_writer_factory(mut self, factory: Arc<dyn SegmentWriterFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Current queue depth (0 when stopped)
    pub fn queue_len(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    /// Create the output directory and spawn the worker. No-op when disabled or already running.
    pub fn start(&mut self) -> Result<()> {
        if !self.cfg.enabled {
            info!("recording_disabled");
            return Ok(());
        }
        if self.is_running() {
            return Ok(());
        }

        let out_dir = PathBuf::from(&self.cfg.output_dir);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create recording dir {}", out_dir.display()))?;

        let (tx, rx) = bounded(self.cfg.queue_size.max(1));
        let (done_tx, done_rx) = bounded(1);
        self.abort.store(false, Ordering::Relaxed);

        let worker = SegmentWorker {
            timestamp_format: checked_timestamp_format(&self.cfg.timestamp_format),
            segment_duration: self.cfg.segment_duration(),
            gap: self.cfg.gap(),
            fps: self.cfg.fps,
            prefix: self.cfg.filename_prefix.clone(),
            out_dir: out_dir.clone(),
            factory: self.factory.clone(),
            metrics: self.metrics.clone(),
            frame_size: self.cfg.frame_size,
            sink: None,
            path: None,
            segment_end: Instant::now(),
            gap_until: None,
            seq: 0,
        };
        let abort = self.abort.clone();

        let handle = thread::Builder::new()
            .name("segment-recorder".to_string())
            .spawn(move || {
                worker.run(rx, abort);
                let _ = done_tx.send(());
            })
            .context("failed to spawn recorder thread")?;

        self.tx = Some(tx);
        self.done_rx = Some(done_rx);
        self.worker = Some(handle);
        info!(
            out_dir = %out_dir.display(),
            segment_secs = self.cfg.segment_secs,
            gap_secs = self.cfg.gap_secs,
            queue = self.cfg.queue_size,
            "recording_started"
        );
        Ok(())
    }

    /// Offer a frame to the worker. Returns false if it was not queued.
    ///
    /// With `drop_when_full` this never blocks; otherwise it waits at most
    /// `put_timeout_ms` for queue space.
    pub fn push(&self, frame: &Frame, ts: f64) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if frame.width() == 0 || frame.height() == 0 {
            return false;
        }

        let queued = if self.cfg.drop_when_full {
            !tx.is_full() && tx.try_send((frame.clone(), ts)).is_ok()
        } else {
            tx.send_timeout((frame.clone(), ts), Duration::from_millis(self.cfg.put_timeout_ms))
                .is_ok()
        };

        if let Some(ref m) = self.metrics {
            if queued {
                m.record_rec_enqueued(tx.len());
            } else {
                m.record_rec_dropped();
            }
        }
        queued
    }

    /// Close the queue and give the worker `stop_grace_ms` to finish its segment.
    ///
    /// A worker that misses the deadline is told to abort and detached; the
    /// caller is never held past the grace period.
    pub fn stop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        drop(tx);

        let grace = Duration::from_millis(self.cfg.stop_grace_ms);
        let finished = match self.done_rx.take() {
            Some(done) => !matches!(done.recv_timeout(grace), Err(RecvTimeoutError::Timeout)),
            None => true,
        };

        if finished {
            if let Some(handle) = self.worker.take() {
                let _ = handle.join();
            }
            info!("recording_stopped");
        } else {
            self.abort.store(true, Ordering::Relaxed);
            self.worker = None;
            warn!(grace_ms = self.cfg.stop_grace_ms, "recording_stop_timeout");
        }
    }
}

impl Drop for SegmentedRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-owned segment state; nothing here is shared with the producer
struct SegmentWorker {
    timestamp_format: String,
    segment_duration: Duration,
    gap: Duration,
    fps: f64,
    prefix: String,
    out_dir: PathBuf,
    factory: Arc<dyn SegmentWriterFactory>,
    metrics: Option<Arc<Metrics>>,
    /// Configured size, or the first frame's size once seen
    frame_size: Option<(u32, u32)>,
    sink: Option<Box<dyn SegmentSink>>,
    path: Option<PathBuf>,
    segment_end: Instant,
    gap_until: Option<Instant>,
    seq: u32,
}

impl SegmentWorker {
    fn run(mut self, rx: Receiver<(Frame, f64)>, abort: Arc<AtomicBool>) {
        while !abort.load(Ordering::Relaxed) {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((frame, _ts)) => self.handle(frame, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    if self.sink.is_some() && now >= self.segment_end {
                        self.rotate(now);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.close_segment();
    }

    #[inline]
    fn in_gap(&self, now: Instant) -> bool {
        self.gap_until.is_some_and(|until| now < until)
    }

    fn handle(&mut self, frame: Frame, now: Instant) {
        if self.in_gap(now) {
            return;
        }

        if self.sink.is_some() && now >= self.segment_end {
            self.rotate(now);
            if self.in_gap(now) {
                return;
            }
        }

        if self.sink.is_none() {
            if let Err(e) = self.open_segment(&frame, now) {
                if let Some(ref m) = self.metrics {
                    m.record_rec_open_failure();
                }
                thread::sleep(OPEN_RETRY_BACKOFF);
                debug!(error = %e, "recording_open_retry");
                return;
            }
        }

        self.write_frame(frame);
    }

    fn next_path(&mut self) -> PathBuf {
        self.seq += 1;
        let stamp = chrono::Local::now().format(&self.timestamp_format);
        self.out_dir.join(format!(
            "{}_{}_{:04}.{}",
            self.prefix,
            stamp,
            self.seq,
            self.factory.extension()
        ))
    }

    fn open_segment(&mut self, first: &Frame, now: Instant) -> Result<()> {
        let size = *self.frame_size.get_or_insert((first.width(), first.height()));
        let path = self.next_path();

        let sink = self.factory.open(&path, size, self.fps).inspect_err(|e| {
            log_open_failed(&path, e);
        })?;

        info!(
            path = %path.display(),
            width = size.0,
            height = size.1,
            fps = self.fps,
            "recording_segment_started"
        );
        if let Some(ref m) = self.metrics {
            m.record_rec_segment_opened();
        }
        self.sink = Some(sink);
        self.path = Some(path);
        self.segment_end = now + self.segment_duration;
        self.gap_until = None;
        Ok(())
    }

    fn write_frame(&mut self, frame: Frame) {
        let Some((w, h)) = self.frame_size else {
            return;
        };
        let frame = if frame.width() != w || frame.height() != h {
            imageops::resize(&frame, w, h, FilterType::Triangle)
        } else {
            frame
        };

        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.write(&frame) {
            Ok(()) => {
                if let Some(ref m) = self.metrics {
                    m.record_rec_written();
                }
            }
            Err(e) => {
                if let Some(ref path) = self.path {
                    log_write_failed(path, &e);
                }
                self.close_segment();
                thread::sleep(WRITE_FAIL_BACKOFF);
            }
        }
    }

    fn rotate(&mut self, now: Instant) {
        self.close_segment();
        if !self.gap.is_zero() {
            self.gap_until = Some(now + self.gap);
        }
    }

    fn close_segment(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        let path = self.path.take().unwrap_or_default();
        if let Err(e) = sink.finish() {
            error!(path = %path.display(), error = %e, "recording_close_failed");
        }
        info!(path = %path.display(), "recording_segment_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::from_pixel(w, h, Rgb([40, 80, 120]))
    }

    fn cfg(dir: &Path) -> RecordingConfig {
        RecordingConfig {
            enabled: true,
            output_dir: dir.display().to_string(),
            segment_secs: 60.0,
            gap_secs: 0.0,
            queue_size: 64,
            stop_grace_ms: 2000,
            ..RecordingConfig::default()
        }
    }

    fn segment_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "mjpeg"))
            .collect();
        files.sort();
        files
    }

    /// Records the size of every frame written, per segment
    #[derive(Default)]
    struct CaptureFactory {
        segments: Arc<Mutex<Vec<Vec<(u32, u32)>>>>,
        fail_first_opens: AtomicU32,
    }

    struct CaptureSink {
        segments: Arc<Mutex<Vec<Vec<(u32, u32)>>>>,
        index: usize,
    }

    impl SegmentSink for CaptureSink {
        fn write(&mut self, frame: &Frame) -> Result<()> {
            self.segments.lock()[self.index].push(frame.dimensions());
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl SegmentWriterFactory for CaptureFactory {
        fn extension(&self) -> &str {
            "cap"
        }

        fn open(&self, _path: &Path, _size: (u32, u32), _fps: f64) -> Result<Box<dyn SegmentSink>> {
            if self.fail_first_opens.load(Ordering::Relaxed) > 0 {
                self.fail_first_opens.fetch_sub(1, Ordering::Relaxed);
                anyhow::bail!("device busy");
            }
            let mut segs = self.segments.lock();
            segs.push(Vec::new());
            Ok(Box::new(CaptureSink { segments: self.segments.clone(), index: segs.len() - 1 }))
        }
    }

    /// Sink whose writes block until the test releases them
    struct StallFactory {
        gate: Receiver<()>,
    }

    struct StallSink {
        gate: Receiver<()>,
    }

    impl SegmentSink for StallSink {
        fn write(&mut self, _frame: &Frame) -> Result<()> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl SegmentWriterFactory for StallFactory {
        fn extension(&self) -> &str {
            "stall"
        }

        fn open(&self, _path: &Path, _size: (u32, u32), _fps: f64) -> Result<Box<dyn SegmentSink>> {
            Ok(Box::new(StallSink { gate: self.gate.clone() }))
        }
    }

    #[test]
    fn test_disabled_recorder_accepts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = SegmentedRecorder::new(RecordingConfig {
            enabled: false,
            ..cfg(dir.path())
        });
        rec.start().unwrap();
        assert!(!rec.is_running());
        assert!(!rec.push(&frame(8, 8), 0.0));
    }

    #[test]
    fn test_writes_mjpeg_segment() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let mut rec = SegmentedRecorder::new(cfg(dir.path())).with_metrics(metrics.clone());
        rec.start().unwrap();

        for i in 0..5 {
            assert!(rec.push(&frame(32, 24), i as f64));
        }
        rec.stop();

        let files = segment_files(dir.path());
        assert_eq!(files.len(), 1);
        let bytes = fs::read(&files[0]).unwrap();
        // Five concatenated JPEGs, each starting with SOI
        let soi = bytes.windows(3).filter(|w| *w == [0xFF, 0xD8, 0xFF]).count();
        assert_eq!(soi, 5);
        assert_eq!(metrics.rec_frames_written(), 5);
        assert_eq!(metrics.rec_segments_opened(), 1);
    }

    #[test]
    fn test_rotation_produces_multiple_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = SegmentedRecorder::new(RecordingConfig {
            segment_secs: 0.1,
            ..cfg(dir.path())
        });
        rec.start().unwrap();

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(450) {
            rec.push(&frame(16, 16), 0.0);
            thread::sleep(Duration::from_millis(10));
        }
        rec.stop();

        let files = segment_files(dir.path());
        assert!(files.len() >= 3, "expected rotation, got {files:?}");
        for f in &files {
            assert!(fs::metadata(f).unwrap().len() > 0);
        }
    }

    #[test]
    fn test_gap_drops_frames_between_segments() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(CaptureFactory::default());
        let mut rec = SegmentedRecorder::new(RecordingConfig {
            segment_secs: 0.05,
            gap_secs: 10.0,
            ..cfg(dir.path())
        })
        .with_writer_factory(factory.clone());
        rec.start().unwrap();

        let start = Instant::now();
        let mut pushed = 0;
        while start.elapsed() < Duration::from_millis(300) {
            if rec.push(&frame(16, 16), 0.0) {
                pushed += 1;
            }
            thread::sleep(Duration::from_millis(5));
        }
        rec.stop();

        let segments = factory.segments.lock();
        // The long gap after the first rotation swallows everything else
        assert_eq!(segments.len(), 1);
        assert!(segments[0].len() < pushed);
    }

    #[test]
    fn test_mismatched_frames_are_resized() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(CaptureFactory::default());
        let mut rec = SegmentedRecorder::new(RecordingConfig {
            frame_size: Some((64, 48)),
            ..cfg(dir.path())
        })
        .with_writer_factory(factory.clone());
        rec.start().unwrap();

        rec.push(&frame(64, 48), 0.0);
        rec.push(&frame(320, 240), 0.1);
        rec.push(&frame(10, 10), 0.2);
        rec.stop();

        let segments = factory.segments.lock();
        assert_eq!(segments[0], vec![(64, 48); 3]);
    }

    #[test]
    fn test_first_frame_sets_size() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(CaptureFactory::default());
        let mut rec = SegmentedRecorder::new(cfg(dir.path())).with_writer_factory(factory.clone());
        rec.start().unwrap();

        rec.push(&frame(40, 30), 0.0);
        rec.push(&frame(80, 60), 0.1);
        rec.stop();

        assert_eq!(factory.segments.lock()[0], vec![(40, 30), (40, 30)]);
    }

    #[test]
    fn test_open_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(CaptureFactory::default());
        factory.fail_first_opens.store(1, Ordering::Relaxed);
        let metrics = Arc::new(Metrics::new());
        let mut rec = SegmentedRecorder::new(cfg(dir.path()))
            .with_writer_factory(factory.clone())
            .with_metrics(metrics.clone());
        rec.start().unwrap();

        rec.push(&frame(16, 16), 0.0);
        rec.push(&frame(16, 16), 0.1);
        rec.push(&frame(16, 16), 0.2);
        rec.stop();

        // First frame lost to the failed open, the rest land in one segment
        let segments = factory.segments.lock();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), 2);
        assert_eq!(metrics.rec_frames_written(), 2);
    }

    #[test]
    fn test_full_queue_never_blocks_producer() {
        let dir = tempfile::tempdir().unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let metrics = Arc::new(Metrics::new());
        let mut rec = SegmentedRecorder::new(RecordingConfig {
            queue_size: 2,
            stop_grace_ms: 100,
            ..cfg(dir.path())
        })
        .with_writer_factory(Arc::new(StallFactory { gate: release_rx }))
        .with_metrics(metrics.clone());
        rec.start().unwrap();

        let start = Instant::now();
        let accepted = (0..200).filter(|i| rec.push(&frame(16, 16), *i as f64)).count();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(accepted <= 3, "queue grew past capacity: {accepted}");
        assert!(rec.queue_len() <= 2);
        assert_eq!(metrics.rec_frames_dropped() as usize, 200 - accepted);

        // Stuck worker must not hold up shutdown beyond the grace period
        let stop_start = Instant::now();
        rec.stop();
        assert!(stop_start.elapsed() < Duration::from_secs(2));
        drop(release_tx);
    }

    #[test]
    fn test_full_queue_waits_put_timeout_then_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let metrics = Arc::new(Metrics::new());
        let mut rec = SegmentedRecorder::new(RecordingConfig {
            queue_size: 1,
            drop_when_full: false,
            put_timeout_ms: 50,
            stop_grace_ms: 100,
            ..cfg(dir.path())
        })
        .with_writer_factory(Arc::new(StallFactory { gate: release_rx }))
        .with_metrics(metrics.clone());
        rec.start().unwrap();

        // One frame stalls in the writer, one sits in the queue, the next must wait
        let mut rejected_after = None;
        for i in 0..10 {
            let start = Instant::now();
            if !rec.push(&frame(16, 16), i as f64) {
                rejected_after = Some(start.elapsed());
                break;
            }
        }
        let waited = rejected_after.expect("queue never filled");
        assert!(waited >= Duration::from_millis(45), "gave up early: {waited:?}");
        assert!(waited < Duration::from_secs(1), "blocked too long: {waited:?}");
        assert_eq!(metrics.rec_frames_dropped(), 1);

        rec.stop();
        drop(release_tx);
    }

    #[test]
    fn test_bad_timestamp_format_falls_back() {
        assert_eq!(checked_timestamp_format("%Y-%m-%d"), "%Y-%m-%d");
        assert_eq!(checked_timestamp_format("%Q%"), DEFAULT_TIMESTAMP_FORMAT);
        assert_eq!(checked_timestamp_format(""), DEFAULT_TIMESTAMP_FORMAT);
    }
}

//! Castline - decision daemon for a pipe casting line
//!
//! Reads tracked detections per frame, decides gate state and pipe flow,
//! pulses the PLC and records what happened.
//!
//! Module structure:
//! - `domain/` - value types, events, ROI geometry
//! - `io/` - PLC clients, store, recorder, detector feed
//! - `services/` - gate sources, gate FSM, pipe-flow FSM, control loop
//! - `infra/` - config, metrics

use anyhow::{Context, Result};
use castline::domain::RoiManager;
use castline::infra::config::{LogFormat, LoggingConfig};
use castline::infra::{Config, Metrics};
use castline::io::{create_plc, DetectionSource, MemoryStore, SegmentedRecorder, SqliteStore, Store};
use castline::services::ControlLoop;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// How long Ctrl+C waits for the decision thread to finish its tick and shut down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Castline - pipe casting line decision daemon
#[derive(Parser, Debug)]
#[command(name = "castline", version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"), about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Detector feed: JSON-lines file, or "-" for stdin (overrides runtime.detections)
    #[arg(short, long)]
    detections: Option<String>,

    /// Keep pipes, events and settings in memory only
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(cfg: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::from_file(&config_path)?;
    init_logging(config.logging());

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "castline_starting");
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        plc_mode = %config.plc().mode,
        gate_source_default = %config.gate().source_default,
        stable_frames = config.gate().stable_frames,
        max_fps = config.runtime().max_fps,
        frame_skip = config.runtime().frame_skip,
        recording = config.recording().enabled,
        "config_loaded"
    );

    // Startup failures below are fatal: nothing may be pulsed on a half-built line
    let rois_file = config.runtime().rois_file.clone();
    let rois = Arc::new(
        RoiManager::from_file(&rois_file).with_context(|| format!("failed to load ROIs from {rois_file}"))?,
    );
    info!(path = %rois_file, count = rois.len(), "rois_loaded");

    let plc = create_plc(config.plc()).context("failed to create PLC client")?;
    let metrics = Arc::new(Metrics::new());

    let store: Box<dyn Store> = if args.dry_run {
        warn!("dry_run_memory_store");
        Box::new(MemoryStore::new())
    } else {
        Box::new(SqliteStore::open(&config.storage().db_path)?)
    };

    let mut recorder = SegmentedRecorder::new(config.recording().clone()).with_metrics(metrics.clone());
    recorder.start()?;

    let feed = args.detections.clone().unwrap_or_else(|| config.runtime().detections.clone());
    let source = DetectionSource::open(&feed)?;
    info!(feed = %feed, "detections_opened");

    let metrics_interval = config.metrics_interval_secs();
    let mut control = ControlLoop::new(config, rois, plc, store, metrics.clone())?.with_recorder(recorder);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic metrics summary
    if metrics_interval > 0 {
        let reporter_metrics = metrics.clone();
        let mut reporter_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => reporter_metrics.report().log(),
                    _ = reporter_shutdown.changed() => break,
                }
            }
        });
    }

    // The decision loop is synchronous and may block on stdin or PLC pulses,
    // so it gets its own thread rather than the runtime's blocking pool
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, mut done_rx) = oneshot::channel();
    let loop_stop = stop.clone();
    thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || {
            let frames = control.run(source, &loop_stop);
            control.shutdown();
            let _ = done_tx.send(frames);
        })
        .context("failed to spawn control loop thread")?;

    let finished = tokio::select! {
        res = &mut done_rx => Some(res),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            stop.store(true, Ordering::Relaxed);
            None
        }
    };
    let finished = match finished {
        Some(res) => Some(res),
        // The loop checks the flag between ticks; a read blocked on an idle
        // feed is abandoned after the grace period
        None => tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await.ok(),
    };
    match finished {
        Some(Ok(frames)) => info!(frames, "control_loop_finished"),
        Some(Err(_)) => error!("control_loop_thread_died"),
        None => warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "control_loop_shutdown_timeout"),
    }
    let _ = shutdown_tx.send(true);

    metrics.report().log();
    info!("castline shutdown complete");
    Ok(())
}

//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Unlike ROIs, every section is optional and falls back to its defaults.
//! A file that cannot be read or parsed is an error: the line must not
//! start driving hardware on guessed settings.

use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Line identifier, also the pipe_uid prefix
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "caster5".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on decision-loop rate (0 = unbounded)
    pub max_fps: u32,
    /// Process one frame out of every `frame_skip + 1`
    pub frame_skip: u32,
    pub db_flush_interval_s: f64,
    pub settings_poll_interval_s: f64,
    pub rois_file: String,
    /// JSON-lines detector feed, "-" for stdin
    pub detections: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_fps: 15,
            frame_skip: 0,
            db_flush_interval_s: 1.0,
            settings_poll_interval_s: 2.0,
            rois_file: "config/rois.toml".to_string(),
            detections: "-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipeFlowConfig {
    pub origin_confirm_frames: u32,
    pub loadcell_enter_confirm_frames: u32,
    pub loadcell_exit_confirm_frames: u32,
    pub stale_track_frames: u64,
    pub rearm_empty_frames: u64,
    pub pipe_class: String,
}

impl Default for PipeFlowConfig {
    fn default() -> Self {
        Self {
            origin_confirm_frames: 2,
            loadcell_enter_confirm_frames: 1,
            loadcell_exit_confirm_frames: 2,
            stale_track_frames: 45,
            rearm_empty_frames: 10,
            pipe_class: "pipe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Initial value of the live `gate_source` setting
    pub source_default: String,
    pub stable_frames: u32,
    pub min_conf: f64,
    pub max_area_ratio_vs_closed: f64,
    pub max_w_over_h: f64,
    pub human_iou_occlusion: f64,
    pub names: Vec<String>,
    /// Pulse the gate's PLC tag on a debounced open
    pub signal_on_open: bool,
    pub human_classes: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            source_default: "geometry".to_string(),
            stable_frames: 3,
            min_conf: 0.25,
            max_area_ratio_vs_closed: 0.85,
            max_w_over_h: 0.9,
            human_iou_occlusion: 0.10,
            names: vec!["gate1".to_string(), "gate2".to_string()],
            signal_on_open: true,
            human_classes: vec!["human".to_string(), "humans".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
    /// Tag name -> coil address
    pub coils: HashMap<String, u16>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 1000,
            coils: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    /// "mock" | "simulated" | "modbus"
    pub mode: String,
    pub pulse_ms: u64,
    /// Role -> tag name, e.g. caster_new = "caster_5_new"
    pub tags: HashMap<String, String>,
    pub modbus: ModbusConfig,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            mode: "mock".to_string(),
            pulse_ms: 300,
            tags: HashMap::new(),
            modbus: ModbusConfig::default(),
        }
    }
}

impl PlcConfig {
    pub fn tag(&self, role: &str) -> Option<&str> {
        self.tags.get(role).map(String::as_str).filter(|t| !t.is_empty())
    }

    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    /// Gate name -> tag pulsed when the gate opens (`<gate>_open` role)
    pub fn gate_pulse_tags(&self, gates: &[String]) -> FxHashMap<String, String> {
        gates
            .iter()
            .filter_map(|g| self.tag(&format!("{g}_open")).map(|t| (g.clone(), t.to_string())))
            .collect()
    }

    /// Gate name -> tag read back for the gate position (`<gate>_is_open` role)
    pub fn gate_status_tags(&self, gates: &[String]) -> FxHashMap<String, String> {
        gates
            .iter()
            .filter_map(|g| self.tag(&format!("{g}_is_open")).map(|t| (g.clone(), t.to_string())))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: "var/pipes.db".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_dir: String,
    pub segment_secs: f64,
    /// Frames are dropped for this long after a segment closes
    pub gap_secs: f64,
    pub fps: f64,
    /// (width, height); None = first frame's size
    pub frame_size: Option<(u32, u32)>,
    pub queue_size: usize,
    pub drop_when_full: bool,
    /// Producer wait when `drop_when_full` is off
    pub put_timeout_ms: u64,
    pub filename_prefix: String,
    pub timestamp_format: String,
    pub jpeg_quality: u8,
    pub stop_grace_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: "var/video".to_string(),
            segment_secs: 600.0,
            gap_secs: 0.0,
            fps: 10.0,
            frame_size: None,
            queue_size: 240,
            drop_when_full: true,
            put_timeout_ms: 10,
            filename_prefix: "cam".to_string(),
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
            jpeg_quality: 85,
            stop_grace_ms: 2000,
        }
    }
}

impl RecordingConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs_f64(self.segment_secs.max(0.001))
    }

    pub fn gap(&self) -> Duration {
        Duration::from_secs_f64(self.gap_secs.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when RUST_LOG is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub runtime: RuntimeConfig,
    pub pipe_flow: PipeFlowConfig,
    pub gate: GateConfig,
    pub plc: PlcConfig,
    pub storage: StorageConfig,
    pub recording: RecordingConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site: SiteConfig,
    runtime: RuntimeConfig,
    pipe_flow: PipeFlowConfig,
    gate: GateConfig,
    plc: PlcConfig,
    storage: StorageConfig,
    recording: RecordingConfig,
    logging: LoggingConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site: toml_config.site,
            runtime: toml_config.runtime,
            pipe_flow: toml_config.pipe_flow,
            gate: toml_config.gate,
            plc: toml_config.plc,
            storage: toml_config.storage,
            recording: toml_config.recording,
            logging: toml_config.logging,
            metrics: toml_config.metrics,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would silently disable a safety mechanism
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gate.stable_frames == 0 {
            bail!("gate.stable_frames must be at least 1");
        }
        if self.pipe_flow.origin_confirm_frames == 0
            || self.pipe_flow.loadcell_enter_confirm_frames == 0
            || self.pipe_flow.loadcell_exit_confirm_frames == 0
        {
            bail!("pipe_flow confirmation frame counts must be at least 1");
        }
        if self.gate.names.is_empty() {
            bail!("gate.names must list at least one gate");
        }
        if self.recording.enabled {
            if self.recording.segment_secs <= 0.0 {
                bail!("recording.segment_secs must be positive");
            }
            if self.recording.queue_size == 0 {
                bail!("recording.queue_size must be at least 1");
            }
        }
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site.id
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn pipe_flow(&self) -> &PipeFlowConfig {
        &self.pipe_flow
    }

    pub fn gate(&self) -> &GateConfig {
        &self.gate
    }

    pub fn plc(&self) -> &PlcConfig {
        &self.plc
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn recording(&self) -> &RecordingConfig {
        &self.recording
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn db_flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.runtime.db_flush_interval_s.max(0.0))
    }

    pub fn settings_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.runtime.settings_poll_interval_s.max(0.0))
    }

    /// Builder methods for tests and simulated runs
    pub fn with_pipe_flow(mut self, pipe_flow: PipeFlowConfig) -> Self {
        self.pipe_flow = pipe_flow;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_plc(mut self, plc: PlcConfig) -> Self {
        self.plc = plc;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

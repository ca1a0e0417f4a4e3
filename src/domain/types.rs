//! Shared types for the casting-line controller

use serde::{Deserialize, Serialize};

/// Decoded camera frame, in the same pixel frame as every BBox and ROI.
pub type Frame = image::RgbImage;

/// Seconds since epoch with millisecond precision
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Newtype wrapper for tracker IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackId(pub i64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned box (x1, y1, x2, y2) in original camera pixels.
///
/// Serialized as a plain `[x1, y1, x2, y2]` array, which is what the
/// detector emits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    #[inline]
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width, clamped to zero for inverted boxes
    #[inline]
    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    /// Height, clamped to zero for inverted boxes
    #[inline]
    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    #[inline]
    pub fn centroid(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One detection-with-identity for one frame, as produced by the upstream tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDet {
    /// Class label ("pipe", "gate1", "human", ...)
    pub cls: String,
    /// Detector confidence in [0, 1]
    pub conf: f64,
    /// Absent means detected but not trackable
    #[serde(default)]
    pub track_id: Option<TrackId>,
    pub bbox: BBox,
}

impl TrackDet {
    pub fn new(cls: impl Into<String>, conf: f64, track_id: Option<i64>, bbox: BBox) -> Self {
        Self { cls: cls.into(), conf, track_id: track_id.map(TrackId), bbox }
    }

    /// Case-insensitive class match
    #[inline]
    pub fn is_class(&self, cls: &str) -> bool {
        self.cls.eq_ignore_ascii_case(cls)
    }
}

/// Where a pipe came from. Unset until confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeOrigin {
    Caster,
    Other,
}

impl PipeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeOrigin::Caster => "caster",
            PipeOrigin::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeState {
    Moving,
    OnLoadcell,
    Parked,
}

impl PipeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeState::Moving => "moving",
            PipeState::OnLoadcell => "on_loadcell",
            PipeState::Parked => "parked",
        }
    }
}

/// Observed gate position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePosition {
    Open,
    Closed,
    Unknown,
}

impl GatePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatePosition::Open => "open",
            GatePosition::Closed => "closed",
            GatePosition::Unknown => "unknown",
        }
    }
}

/// Per-pipe state, keyed by tracker ID while the track is alive
#[derive(Debug, Clone, PartialEq)]
pub struct PipeStats {
    /// Process-lifetime-unique identity, independent of tracker ID reuse
    pub pipe_uid: String,
    pub tracker_id: TrackId,

    pub origin: Option<PipeOrigin>,
    pub state: PipeState,

    /// Epoch seconds, each latched at most once
    pub t_origin: Option<f64>,
    pub t_loadcell_enter: Option<f64>,
    pub t_loadcell_exit: Option<f64>,

    pub frames_seen: u64,
    pub frames_missing: u64,

    pub conf_sum_full: f64,
    pub conf_count_full: u64,
    pub conf_sum_till_gate: f64,
    pub conf_count_till_gate: u64,
    pub reached_gate_zone: bool,

    pub last_seen_frame: u64,
    pub last_seen_ts: f64,

    /// PLC trigger fired for this pipe
    pub counted: bool,
    pub origin_hits: u32,
    pub loadcell_hits: u32,
    pub loadcell_exit_misses: u32,
}

impl PipeStats {
    #[inline]
    pub fn new(pipe_uid: String, tracker_id: TrackId) -> Self {
        Self {
            pipe_uid,
            tracker_id,
            origin: None,
            state: PipeState::Moving,
            t_origin: None,
            t_loadcell_enter: None,
            t_loadcell_exit: None,
            frames_seen: 0,
            frames_missing: 0,
            conf_sum_full: 0.0,
            conf_count_full: 0,
            conf_sum_till_gate: 0.0,
            conf_count_till_gate: 0,
            reached_gate_zone: false,
            last_seen_frame: 0,
            last_seen_ts: 0.0,
            counted: false,
            origin_hits: 0,
            loadcell_hits: 0,
            loadcell_exit_misses: 0,
        }
    }

    pub fn avg_conf_full(&self) -> f64 {
        if self.conf_count_full > 0 {
            self.conf_sum_full / self.conf_count_full as f64
        } else {
            0.0
        }
    }

    pub fn avg_conf_till_gate(&self) -> f64 {
        if self.conf_count_till_gate > 0 {
            self.conf_sum_till_gate / self.conf_count_till_gate as f64
        } else {
            0.0
        }
    }

    /// Entered the load-cell and not yet seen leaving it
    #[inline]
    pub fn on_loadcell(&self) -> bool {
        self.t_loadcell_enter.is_some() && self.t_loadcell_exit.is_none()
    }
}

/// Immutable projection of a [`PipeStats`] handed to persistence each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeRecord {
    pub pipe_uid: String,
    pub tracker_id: TrackId,
    pub origin: Option<PipeOrigin>,
    pub state: PipeState,
    pub t_origin: Option<f64>,
    pub t_loadcell_enter: Option<f64>,
    pub t_loadcell_exit: Option<f64>,
    pub avg_conf_full: f64,
    pub conf_count_full: u64,
    pub avg_conf_till_gate: f64,
    pub conf_count_till_gate: u64,
    pub frames_missing: u64,
    pub last_seen_ts: f64,
    pub reached_gate_zone: bool,
}

impl From<&PipeStats> for PipeRecord {
    fn from(p: &PipeStats) -> Self {
        Self {
            pipe_uid: p.pipe_uid.clone(),
            tracker_id: p.tracker_id,
            origin: p.origin,
            state: p.state,
            t_origin: p.t_origin,
            t_loadcell_enter: p.t_loadcell_enter,
            t_loadcell_exit: p.t_loadcell_exit,
            avg_conf_full: p.avg_conf_full(),
            conf_count_full: p.conf_count_full,
            avg_conf_till_gate: p.avg_conf_till_gate(),
            conf_count_till_gate: p.conf_count_till_gate,
            frames_missing: p.frames_missing,
            last_seen_ts: p.last_seen_ts,
            reached_gate_zone: p.reached_gate_zone,
        }
    }
}

/// Debounced per-gate state
#[derive(Debug, Clone, PartialEq)]
pub struct GateStatus {
    pub name: String,
    pub position: GatePosition,
    /// Consecutive frames at `position`
    pub stable: u32,
    pub last_ts: f64,
}

impl GateStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), position: GatePosition::Unknown, stable: 0, last_ts: 0.0 }
    }
}

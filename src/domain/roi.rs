//! Named regions of interest
//!
//! ROIs are loaded once at startup from a TOML document mapping each name to
//! an ordered list of `[x, y]` integer vertices, e.g.
//!
//! ```toml
//! roi_loadcell = [[410, 220], [620, 220], [620, 400], [410, 400]]
//! ```
//!
//! The set is fixed for the run. Looking up a name that was never loaded is a
//! programming error, not a runtime condition: required names are validated
//! before any FSM is built.

use crate::domain::geometry::{self, Point};
use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Well-known ROI names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoiName {
    Loadcell,
    CasterOrigin,
    LeftOrigin,
    RightOrigin,
    SafetyCritical,
    Gate1Open,
    Gate2Open,
    Gate1Closed,
    Gate2Closed,
}

impl RoiName {
    pub const REQUIRED: [RoiName; 9] = [
        RoiName::Loadcell,
        RoiName::CasterOrigin,
        RoiName::LeftOrigin,
        RoiName::RightOrigin,
        RoiName::SafetyCritical,
        RoiName::Gate1Open,
        RoiName::Gate2Open,
        RoiName::Gate1Closed,
        RoiName::Gate2Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoiName::Loadcell => "roi_loadcell",
            RoiName::CasterOrigin => "roi_caster5_origin",
            RoiName::LeftOrigin => "roi_left_origin",
            RoiName::RightOrigin => "roi_right_origin",
            RoiName::SafetyCritical => "roi_safety_critical",
            RoiName::Gate1Open => "roi_gate1_open",
            RoiName::Gate2Open => "roi_gate2_open",
            RoiName::Gate1Closed => "roi_gate1_closed",
            RoiName::Gate2Closed => "roi_gate2_closed",
        }
    }
}

/// ROI name for a gate's open reference zone
pub fn gate_open_roi(gate: &str) -> String {
    format!("roi_{gate}_open")
}

/// ROI name for a gate's closed reference zone
pub fn gate_closed_roi(gate: &str) -> String {
    format!("roi_{gate}_closed")
}

/// Named polygon, immutable after load
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonRoi {
    name: String,
    points: Vec<Point>,
}

impl PolygonRoi {
    pub fn new(name: impl Into<String>, points: Vec<Point>) -> anyhow::Result<Self> {
        let name = name.into();
        if points.len() < 3 {
            bail!("ROI {name} has {} vertices, at least 3 required", points.len());
        }
        Ok(Self { name, points })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        geometry::contains(&self.points, x, y)
    }

    pub fn area(&self) -> f64 {
        geometry::area(&self.points)
    }

    pub fn centroid(&self) -> (f64, f64) {
        geometry::centroid(&self.points)
    }

    pub fn bbox(&self) -> (i32, i32, i32, i32) {
        geometry::bounds(&self.points)
    }
}

/// Index of named polygons
#[derive(Debug, Clone, Default)]
pub struct RoiManager {
    rois: FxHashMap<String, PolygonRoi>,
}

impl RoiManager {
    /// Build from a name -> vertices mapping
    pub fn new<I>(rois: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<Point>)>,
    {
        let mut map = FxHashMap::default();
        for (name, points) in rois {
            let roi = PolygonRoi::new(name.clone(), points)?;
            map.insert(name, roi);
        }
        Ok(Self { rois: map })
    }

    /// Load ROIs from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read ROI file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse ROI file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw: BTreeMap<String, Vec<[i32; 2]>> = toml::from_str(content)?;
        Self::new(
            raw.into_iter()
                .map(|(name, pts)| (name, pts.into_iter().map(|[x, y]| (x, y)).collect())),
        )
    }

    /// Fail if any of `names` is missing
    pub fn require<'a, I>(&self, names: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let missing: Vec<&str> =
            names.into_iter().filter(|n| !self.rois.contains_key(*n)).collect();
        if !missing.is_empty() {
            bail!("Missing required ROI(s): {}", missing.join(", "));
        }
        Ok(())
    }

    /// Fail unless the fixed required set plus open/closed zones for every gate exist
    pub fn validate(&self, gate_names: &[String]) -> anyhow::Result<()> {
        let gate_rois: Vec<String> = gate_names
            .iter()
            .flat_map(|g| [gate_open_roi(g), gate_closed_roi(g)])
            .collect();
        let mut names: Vec<&str> = RoiName::REQUIRED.iter().map(|r| r.as_str()).collect();
        names.extend(gate_rois.iter().map(String::as_str));
        self.require(names)
    }

    pub fn get(&self, name: &str) -> Option<&PolygonRoi> {
        self.rois.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.rois.contains_key(name)
    }

    /// # Panics
    ///
    /// Panics if `name` was never loaded.
    pub fn roi(&self, name: &str) -> &PolygonRoi {
        match self.rois.get(name) {
            Some(roi) => roi,
            None => panic!("ROI {name} is not loaded"),
        }
    }

    /// # Panics
    ///
    /// Panics if `name` was never loaded.
    #[inline]
    pub fn contains(&self, name: &str, x: f64, y: f64) -> bool {
        self.roi(name).contains(x, y)
    }

    #[inline]
    pub fn contains_named(&self, name: RoiName, x: f64, y: f64) -> bool {
        self.contains(name.as_str(), x, y)
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }
}

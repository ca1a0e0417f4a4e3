//! Gate position strategies
//!
//! Every source answers "open", "closed" or "unknown" for one gate per
//! frame, plus a small map of numeric diagnostics. Sources never guess: any
//! missing input, failed read or unsafe observation is "unknown", which the
//! gate FSM treats as "no information".

use crate::domain::geometry::iou;
use crate::domain::roi::{gate_closed_roi, gate_open_roi, RoiManager, RoiName};
use crate::domain::types::{Frame, GatePosition, TrackDet};
use crate::infra::config::Config;
use crate::io::plc::PlcClient;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Free-form numeric diagnostics from one position query
pub type GateMetrics = FxHashMap<&'static str, f64>;

/// Selectable source, as stored in the `gate_source` setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSourceKind {
    Geometry,
    Protocol,
    VisionPlaceholder,
}

impl GateSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateSourceKind::Geometry => "geometry",
            GateSourceKind::Protocol => "protocol",
            GateSourceKind::VisionPlaceholder => "vision-placeholder",
        }
    }
}

impl std::str::FromStr for GateSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "geometry" => GateSourceKind::Geometry,
            "protocol" | "plc" => GateSourceKind::Protocol,
            "vision-placeholder" | "vision" => GateSourceKind::VisionPlaceholder,
            other => anyhow::bail!("unknown gate source '{other}'"),
        })
    }
}

/// Gate position strategy
pub trait GateStatusSource: Send {
    fn kind(&self) -> GateSourceKind;

    fn position(
        &self,
        gate: &str,
        frame: Option<&Frame>,
        dets: Option<&[TrackDet]>,
    ) -> (GatePosition, GateMetrics);
}

/// Reads the gate's `<gate>_is_open` tag from the PLC
pub struct ProtocolGateSource {
    plc: Arc<dyn PlcClient>,
    /// Gate name -> status tag
    tags: FxHashMap<String, String>,
}

impl ProtocolGateSource {
    pub fn new(plc: Arc<dyn PlcClient>, tags: FxHashMap<String, String>) -> Self {
        Self { plc, tags }
    }
}

impl GateStatusSource for ProtocolGateSource {
    fn kind(&self) -> GateSourceKind {
        GateSourceKind::Protocol
    }

    fn position(
        &self,
        gate: &str,
        _frame: Option<&Frame>,
        _dets: Option<&[TrackDet]>,
    ) -> (GatePosition, GateMetrics) {
        let metrics = GateMetrics::default();
        let Some(tag) = self.tags.get(gate) else {
            debug!(gate = %gate, "gate_status_tag_missing");
            return (GatePosition::Unknown, metrics);
        };
        match self.plc.read_bool(tag) {
            Ok(true) => (GatePosition::Open, metrics),
            Ok(false) => (GatePosition::Closed, metrics),
            Err(e) => {
                error!(gate = %gate, tag = %tag, error = %e, "gate_status_read_failed");
                (GatePosition::Unknown, metrics)
            }
        }
    }
}

/// Thresholds for the geometry classifier
#[derive(Debug, Clone)]
pub struct GeometryParams {
    pub min_conf: f64,
    pub max_area_ratio_vs_closed: f64,
    pub max_w_over_h: f64,
    pub human_iou_occlusion: f64,
    pub human_classes: Vec<String>,
}

impl GeometryParams {
    pub fn from_config(config: &Config) -> Self {
        let g = config.gate();
        Self {
            min_conf: g.min_conf,
            max_area_ratio_vs_closed: g.max_area_ratio_vs_closed,
            max_w_over_h: g.max_w_over_h,
            human_iou_occlusion: g.human_iou_occlusion,
            human_classes: g.human_classes.clone(),
        }
    }
}

/// Classifies a gate from its own detection against reference ROIs.
///
/// Open iff the gate box centroid is in `roi_<gate>_open`, its w/h is
/// below `max_w_over_h` and its area relative to `roi_<gate>_closed` is
/// below `max_area_ratio_vs_closed`. Anything else with a usable detection
/// is closed. A human near the gate forces unknown.
pub struct GeometryGateSource {
    rois: Arc<RoiManager>,
    params: GeometryParams,
}

impl GeometryGateSource {
    pub fn new(rois: Arc<RoiManager>, params: GeometryParams) -> Self {
        Self { rois, params }
    }

    fn best_detection<'a>(&self, dets: &'a [TrackDet], gate: &str) -> Option<&'a TrackDet> {
        dets.iter()
            .filter(|d| d.is_class(gate) && d.conf >= self.params.min_conf)
            .max_by(|a, b| a.conf.total_cmp(&b.conf))
    }

    fn is_human(&self, det: &TrackDet) -> bool {
        self.params.human_classes.iter().any(|c| det.is_class(c))
    }

    /// Reason a human makes the gate unobservable, if any
    fn occlusion(&self, gate_det: &TrackDet, closed_roi: &str, dets: &[TrackDet]) -> Option<&'static str> {
        let threshold = self.params.human_iou_occlusion;
        let safety = self.rois.get(RoiName::SafetyCritical.as_str());

        for human in dets.iter().filter(|d| self.is_human(d)) {
            let overlap = iou(&human.bbox, &gate_det.bbox);
            let (hx, hy) = human.bbox.centroid();

            if overlap >= threshold {
                return Some("iou");
            }
            if self.rois.get(closed_roi).is_some_and(|r| r.contains(hx, hy)) {
                return Some("closed_roi");
            }
            if safety.is_some_and(|r| r.contains(hx, hy)) && overlap >= threshold {
                return Some("safety_roi");
            }
        }
        None
    }
}

impl GateStatusSource for GeometryGateSource {
    fn kind(&self) -> GateSourceKind {
        GateSourceKind::Geometry
    }

    fn position(
        &self,
        gate: &str,
        _frame: Option<&Frame>,
        dets: Option<&[TrackDet]>,
    ) -> (GatePosition, GateMetrics) {
        let mut metrics = GateMetrics::default();
        let Some(dets) = dets else {
            return (GatePosition::Unknown, metrics);
        };
        let Some(gate_det) = self.best_detection(dets, gate) else {
            debug!(gate = %gate, min_conf = self.params.min_conf, "gate_not_detected");
            return (GatePosition::Unknown, metrics);
        };

        let open_name = gate_open_roi(gate);
        let closed_name = gate_closed_roi(gate);
        let (Some(open_roi), Some(closed_roi)) = (self.rois.get(&open_name), self.rois.get(&closed_name))
        else {
            debug!(gate = %gate, "gate_rois_missing");
            return (GatePosition::Unknown, metrics);
        };

        if let Some(reason) = self.occlusion(gate_det, &closed_name, dets) {
            debug!(gate = %gate, reason, "gate_occluded_by_human");
            return (GatePosition::Unknown, metrics);
        }

        let bbox = &gate_det.bbox;
        let (cx, cy) = bbox.centroid();
        let in_open = open_roi.contains(cx, cy);
        let closed_area = closed_roi.area().max(1.0);
        let area_ratio = bbox.area() / closed_area;
        let w_over_h = bbox.width() / bbox.height().max(1.0);

        metrics.insert("conf", gate_det.conf);
        metrics.insert("closed_area", closed_area);
        metrics.insert("area_ratio", area_ratio);
        metrics.insert("w_over_h", w_over_h);

        let open = in_open
            && w_over_h < self.params.max_w_over_h
            && area_ratio < self.params.max_area_ratio_vs_closed;
        let position = if open { GatePosition::Open } else { GatePosition::Closed };
        debug!(
            gate = %gate,
            position = position.as_str(),
            conf = gate_det.conf,
            in_open,
            w_over_h,
            area_ratio,
            "gate_geometry"
        );
        (position, metrics)
    }
}

/// Reserved for an image classifier; always unknown
#[derive(Debug, Default)]
pub struct VisionPlaceholderSource;

impl GateStatusSource for VisionPlaceholderSource {
    fn kind(&self) -> GateSourceKind {
        GateSourceKind::VisionPlaceholder
    }

    fn position(
        &self,
        _gate: &str,
        _frame: Option<&Frame>,
        _dets: Option<&[TrackDet]>,
    ) -> (GatePosition, GateMetrics) {
        (GatePosition::Unknown, GateMetrics::default())
    }
}

/// Build the source for `kind` from shared line resources
pub fn build_gate_source(
    kind: GateSourceKind,
    config: &Config,
    rois: &Arc<RoiManager>,
    plc: &Arc<dyn PlcClient>,
) -> Box<dyn GateStatusSource> {
    match kind {
        GateSourceKind::Geometry => Box::new(GeometryGateSource::new(
            rois.clone(),
            GeometryParams::from_config(config),
        )),
        GateSourceKind::Protocol => Box::new(ProtocolGateSource::new(
            plc.clone(),
            config.plc().gate_status_tags(&config.gate().names),
        )),
        GateSourceKind::VisionPlaceholder => Box::new(VisionPlaceholderSource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BBox;
    use crate::io::plc::SimulatedPlc;

    /// gate1 open zone: x 200..260, closed zone: x 180..300 (area 120 x 100 = 12000)
    const ROIS: &str = r#"
roi_loadcell = [[400, 200], [600, 200], [600, 400], [400, 400]]
roi_caster5_origin = [[0, 0], [100, 0], [100, 100], [0, 100]]
roi_left_origin = [[0, 500], [100, 500], [100, 600], [0, 600]]
roi_right_origin = [[900, 500], [1000, 500], [1000, 600], [900, 600]]
roi_safety_critical = [[150, 0], [350, 0], [350, 150], [150, 150]]
roi_gate1_open = [[200, 200], [260, 200], [260, 300], [200, 300]]
roi_gate1_closed = [[180, 200], [300, 200], [300, 300], [180, 300]]
roi_gate2_open = [[700, 200], [760, 200], [760, 300], [700, 300]]
roi_gate2_closed = [[680, 200], [800, 200], [800, 300], [680, 300]]
"#;

    fn source() -> GeometryGateSource {
        let rois = Arc::new(RoiManager::from_toml_str(ROIS).unwrap());
        GeometryGateSource::new(rois, GeometryParams::from_config(&Config::default()))
    }

    /// Tall narrow gate box centred in the open zone: 30 wide, 80 high
    fn open_gate() -> TrackDet {
        TrackDet::new("gate1", 0.8, None, BBox::new(215.0, 210.0, 245.0, 290.0))
    }

    /// Wide gate box covering the closed zone
    fn closed_gate() -> TrackDet {
        TrackDet::new("gate1", 0.8, None, BBox::new(180.0, 220.0, 300.0, 280.0))
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("geometry".parse::<GateSourceKind>().unwrap(), GateSourceKind::Geometry);
        assert_eq!("PLC".parse::<GateSourceKind>().unwrap(), GateSourceKind::Protocol);
        assert_eq!(
            "vision-placeholder".parse::<GateSourceKind>().unwrap(),
            GateSourceKind::VisionPlaceholder
        );
        assert!("lidar".parse::<GateSourceKind>().is_err());
    }

    #[test]
    fn test_geometry_open_and_closed() {
        let src = source();

        let (pos, metrics) = src.position("gate1", None, Some(&[open_gate()]));
        assert_eq!(pos, GatePosition::Open);
        assert_eq!(metrics["closed_area"], 12000.0);
        assert!((metrics["w_over_h"] - 30.0 / 80.0).abs() < 1e-9);

        let (pos, _) = src.position("gate1", None, Some(&[closed_gate()]));
        assert_eq!(pos, GatePosition::Closed);
    }

    #[test]
    fn test_geometry_unknown_without_detection() {
        let src = source();
        assert_eq!(src.position("gate1", None, None).0, GatePosition::Unknown);
        assert_eq!(src.position("gate1", None, Some(&[])).0, GatePosition::Unknown);

        // Below min_conf is the same as absent
        let weak = TrackDet::new("gate1", 0.1, None, open_gate().bbox);
        assert_eq!(src.position("gate1", None, Some(&[weak])).0, GatePosition::Unknown);

        // Another gate's detection does not count
        assert_eq!(src.position("gate2", None, Some(&[open_gate()])).0, GatePosition::Unknown);
    }

    #[test]
    fn test_geometry_picks_highest_confidence() {
        let src = source();
        let mut weak_closed = closed_gate();
        weak_closed.conf = 0.5;
        let dets = [weak_closed, open_gate()];
        let (pos, metrics) = src.position("gate1", None, Some(&dets));
        assert_eq!(pos, GatePosition::Open);
        assert_eq!(metrics["conf"], 0.8);
    }

    #[test]
    fn test_human_overlapping_gate_forces_unknown() {
        let src = source();
        let human = TrackDet::new("Human", 0.9, Some(11), BBox::new(210.0, 200.0, 250.0, 290.0));
        let (pos, _) = src.position("gate1", None, Some(&[open_gate(), human]));
        assert_eq!(pos, GatePosition::Unknown);
    }

    #[test]
    fn test_human_in_closed_zone_forces_unknown() {
        let src = source();
        // Small box, no overlap with the gate box, centroid inside roi_gate1_closed
        let human = TrackDet::new("humans", 0.9, Some(11), BBox::new(285.0, 280.0, 295.0, 296.0));
        assert_eq!(iou(&human.bbox, &open_gate().bbox), 0.0);
        let (pos, _) = src.position("gate1", None, Some(&[open_gate(), human]));
        assert_eq!(pos, GatePosition::Unknown);
    }

    #[test]
    fn test_distant_human_does_not_block() {
        let src = source();
        let human = TrackDet::new("human", 0.9, Some(11), BBox::new(850.0, 500.0, 880.0, 580.0));
        let (pos, _) = src.position("gate1", None, Some(&[open_gate(), human]));
        assert_eq!(pos, GatePosition::Open);
    }

    #[test]
    fn test_protocol_source() {
        let plc = Arc::new(SimulatedPlc::new());
        let mut tags = FxHashMap::default();
        tags.insert("gate1".to_string(), "gate1_state".to_string());
        let src = ProtocolGateSource::new(plc.clone(), tags);

        assert_eq!(src.position("gate1", None, None).0, GatePosition::Closed);
        plc.set_bool("gate1_state", true);
        assert_eq!(src.position("gate1", None, None).0, GatePosition::Open);
        // No tag configured for gate2
        assert_eq!(src.position("gate2", None, None).0, GatePosition::Unknown);
    }

    #[test]
    fn test_protocol_read_failure_is_unknown() {
        struct BrokenPlc;
        impl PlcClient for BrokenPlc {
            fn pulse(&self, _tag: &str, _d: std::time::Duration) -> anyhow::Result<()> {
                anyhow::bail!("link down")
            }
            fn read_bool(&self, _tag: &str) -> anyhow::Result<bool> {
                anyhow::bail!("link down")
            }
            fn close(&self) {}
        }

        let mut tags = FxHashMap::default();
        tags.insert("gate1".to_string(), "gate1_state".to_string());
        let src = ProtocolGateSource::new(Arc::new(BrokenPlc), tags);
        assert_eq!(src.position("gate1", None, None).0, GatePosition::Unknown);
    }

    #[test]
    fn test_placeholder_always_unknown() {
        let (pos, metrics) =
            VisionPlaceholderSource.position("gate1", None, Some(&[open_gate()]));
        assert_eq!(pos, GatePosition::Unknown);
        assert!(metrics.is_empty());
    }
}

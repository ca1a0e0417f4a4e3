//! Debounced gate state machine
//!
//! One [`GateStatus`] per configured gate. Each tick the active
//! [`GateStatusSource`] is queried; a position must be observed
//! `stable_frames` times in a row before an open is reported, and the
//! report fires on the edge only. "Unknown" freezes the gate.
//!
//! Switching the source means building a new FSM: debounce counters are
//! not carried over.

use crate::domain::events::GateOpenedEvent;
use crate::domain::types::{Frame, GatePosition, GateStatus, TrackDet};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::plc::PlcClient;
use crate::services::gate_sources::{GateSourceKind, GateStatusSource};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct GateFsm {
    source: Box<dyn GateStatusSource>,
    plc: Arc<dyn PlcClient>,
    pulse: Duration,
    stable_frames: u32,
    signal_on_open: bool,
    /// Gate name -> tag pulsed on a debounced open
    pulse_tags: FxHashMap<String, String>,
    /// In configured order
    gates: Vec<GateStatus>,
    metrics: Option<Arc<Metrics>>,
}

impl GateFsm {
    pub fn new(source: Box<dyn GateStatusSource>, plc: Arc<dyn PlcClient>, config: &Config) -> Self {
        let gate_cfg = config.gate();
        Self {
            source,
            plc,
            pulse: config.plc().pulse(),
            stable_frames: gate_cfg.stable_frames,
            signal_on_open: gate_cfg.signal_on_open,
            pulse_tags: config.plc().gate_pulse_tags(&gate_cfg.names),
            gates: gate_cfg.names.iter().map(GateStatus::new).collect(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn source_kind(&self) -> GateSourceKind {
        self.source.kind()
    }

    pub fn gates(&self) -> &[GateStatus] {
        &self.gates
    }

    pub fn gate(&self, name: &str) -> Option<&GateStatus> {
        self.gates.iter().find(|g| g.name == name)
    }

    /// Run one tick over every gate, returning the debounced opens
    pub fn update(
        &mut self,
        ts: f64,
        frame: Option<&Frame>,
        dets: Option<&[TrackDet]>,
    ) -> Vec<GateOpenedEvent> {
        let mut events = Vec::new();

        for idx in 0..self.gates.len() {
            let (pos, diag) = self.source.position(&self.gates[idx].name, frame, dets);
            let gs = &mut self.gates[idx];
            debug!(gate = %gs.name, pos = pos.as_str(), stable = gs.stable, diag = ?diag, "gate_read");

            gs.last_ts = ts;
            if pos == GatePosition::Unknown {
                continue;
            }

            if pos == gs.position {
                gs.stable = gs.stable.saturating_add(1);
            } else {
                info!(
                    gate = %gs.name,
                    from = gs.position.as_str(),
                    to = pos.as_str(),
                    "gate_state_change"
                );
                gs.position = pos;
                gs.stable = 1;
            }

            if gs.position == GatePosition::Open && gs.stable == self.stable_frames {
                let name = gs.name.clone();
                info!(gate = %name, ts, "gate_opened");
                self.signal_open(&name);
                if let Some(ref m) = self.metrics {
                    m.record_gate_open();
                }
                events.push(GateOpenedEvent { gate_name: name, t_open: ts });
            }
        }
        events
    }

    fn signal_open(&self, gate: &str) {
        if !self.signal_on_open {
            return;
        }
        let Some(tag) = self.pulse_tags.get(gate) else {
            return;
        };
        let result = self.plc.pulse(tag, self.pulse);
        if let Err(ref e) = result {
            error!(gate = %gate, tag = %tag, error = %e, "gate_pulse_failed");
        }
        if let Some(ref m) = self.metrics {
            m.record_plc_pulse(result.is_ok());
        }
    }
}

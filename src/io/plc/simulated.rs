//! In-memory PLC for development and tests

use super::PlcClient;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::thread;
use std::time::Duration;
use tracing::info;

/// Keeps a tag table and a pulse counter; pulses still take their full width
#[derive(Default)]
pub struct SimulatedPlc {
    state: Mutex<FxHashMap<String, bool>>,
    pulses: Mutex<FxHashMap<String, u32>>,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a tag value, e.g. a gate's position feedback
    pub fn set_bool(&self, tag: &str, value: bool) {
        self.state.lock().insert(tag.to_string(), value);
    }

    /// Number of completed pulses on `tag`
    pub fn pulse_count(&self, tag: &str) -> u32 {
        self.pulses.lock().get(tag).copied().unwrap_or(0)
    }
}

impl PlcClient for SimulatedPlc {
    fn pulse(&self, tag: &str, duration: Duration) -> anyhow::Result<()> {
        info!(tag = %tag, ms = duration.as_millis() as u64, "plc_sim_pulse");
        self.set_bool(tag, true);
        thread::sleep(duration);
        self.set_bool(tag, false);
        *self.pulses.lock().entry(tag.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn read_bool(&self, tag: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().get(tag).copied().unwrap_or(false))
    }

    fn close(&self) {
        info!("plc_sim_closed");
    }
}

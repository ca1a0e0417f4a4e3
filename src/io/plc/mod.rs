//! PLC clients
//!
//! Two implementations of one blocking contract:
//! - `simulated` - in-memory tag table, no physical side effects
//! - `modbus` - Modbus/TCP coils over a persistent session
//!
//! `pulse` blocks the caller for the whole pulse width. Pulse width is a
//! hardware timing contract, so it is never turned into fire-and-forget and
//! an in-flight pulse is never cancelled.

pub mod modbus;
pub mod simulated;

use crate::infra::config::PlcConfig;
use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use modbus::ModbusPlc;
pub use simulated::SimulatedPlc;

/// Blocking PLC capability shared by the decision loop and gate sources
pub trait PlcClient: Send + Sync {
    /// Drive `tag` high, wait `duration`, drive it low.
    ///
    /// A tag with no configured address is skipped with a warning and
    /// returns `Ok`, since partial wiring is a valid deployment.
    fn pulse(&self, tag: &str, duration: Duration) -> anyhow::Result<()>;

    /// Read a boolean tag. Unconfigured tags read as `false`.
    fn read_bool(&self, tag: &str) -> anyhow::Result<bool>;

    fn close(&self);
}

/// Build the PLC client selected by `plc.mode`.
///
/// Fails on an unknown mode or when the field connection cannot be
/// established: the line must not run believing a dead PLC is live.
pub fn create_plc(cfg: &PlcConfig) -> anyhow::Result<Arc<dyn PlcClient>> {
    match cfg.mode.to_ascii_lowercase().as_str() {
        "mock" | "simulated" => {
            info!(mode = %cfg.mode, "plc_simulated");
            Ok(Arc::new(SimulatedPlc::new()))
        }
        "modbus" => {
            let client = ModbusPlc::connect(&cfg.modbus)?;
            Ok(Arc::new(client))
        }
        other => bail!("Unsupported PLC mode: {other}"),
    }
}

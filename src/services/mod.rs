//! Services - decision logic
//!
//! - `gate_sources` - gate position strategies (geometry, PLC, placeholder)
//! - `gate_fsm` - debounced gate open detection
//! - `pipe_fsm` - pipe origin eligibility and load-cell triggering
//! - `control_loop` - per-frame orchestration, persistence and settings

pub mod control_loop;
pub mod gate_fsm;
pub mod gate_sources;
pub mod pipe_fsm;

pub use control_loop::{ControlLoop, RateLimiter, TickReport};
pub use gate_fsm::GateFsm;
pub use gate_sources::{build_gate_source, GateSourceKind, GateStatusSource};
pub use pipe_fsm::{PipeFlowFsm, PipeUpdate};

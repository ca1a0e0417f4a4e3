//! Castline library
//!
//! Decision layer for a pipe casting line: ROI geometry, gate and pipe-flow
//! state machines, PLC signaling, persistence and segmented recording.
//! Exposed as a library for integration tests and the bundled binaries.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;

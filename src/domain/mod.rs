//! Domain models - core line types, events and geometry
//!
//! - `types` - detections, pipe and gate state
//! - `events` - values emitted by the state machines
//! - `geometry` - polygon and box math
//! - `roi` - named regions of interest loaded at startup

pub mod events;
pub mod geometry;
pub mod roi;
pub mod types;

pub use roi::{RoiManager, RoiName};
pub use types::{BBox, Frame, GatePosition, PipeRecord, TrackDet, TrackId};

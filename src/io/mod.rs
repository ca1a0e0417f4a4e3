//! IO modules - external system interfaces
//!
//! - `plc` - PLC clients (simulated, Modbus/TCP) and factory
//! - `store` - pipe/event/settings persistence
//! - `recorder` - background segmented video recorder
//! - `overlay` - ROI and detection annotation of recorded frames
//! - `detections` - JSON-lines detector feed

pub mod detections;
pub mod overlay;
pub mod plc;
pub mod recorder;
pub mod store;

pub use detections::{DetectionFrame, DetectionSource};
pub use overlay::Overlay;
pub use plc::{create_plc, PlcClient};
pub use recorder::SegmentedRecorder;
pub use store::{MemoryStore, SqliteStore, Store};

//! Domain events emitted by the state machines
//!
//! Events are immutable values: emitted once per tick, consumed by the
//! control loop for persistence and PLC signaling, never stored by the FSMs.

use crate::domain::types::TrackId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeEnteredLoadcellEvent {
    pub pipe_uid: String,
    pub tracker_id: TrackId,
    pub t_enter: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeExitedLoadcellEvent {
    pub pipe_uid: String,
    pub tracker_id: TrackId,
    pub t_exit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOpenedEvent {
    pub gate_name: String,
    pub t_open: f64,
}

/// Events produced by the pipe-flow FSM
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipeEvent {
    Entered(PipeEnteredLoadcellEvent),
    Exited(PipeExitedLoadcellEvent),
}

impl PipeEvent {
    pub fn pipe_uid(&self) -> &str {
        match self {
            PipeEvent::Entered(e) => &e.pipe_uid,
            PipeEvent::Exited(e) => &e.pipe_uid,
        }
    }

    pub fn tracker_id(&self) -> TrackId {
        match self {
            PipeEvent::Entered(e) => e.tracker_id,
            PipeEvent::Exited(e) => e.tracker_id,
        }
    }

    pub fn ts(&self) -> f64 {
        match self {
            PipeEvent::Entered(e) => e.t_enter,
            PipeEvent::Exited(e) => e.t_exit,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            PipeEvent::Entered(_) => EventKind::PipeEnterLoadcell,
            PipeEvent::Exited(_) => EventKind::PipeExitLoadcell,
        }
    }
}

/// Event types as persisted in the append-only event log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    GateOpen,
    PipeEnterLoadcell,
    PipeExitLoadcell,
    SettingChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::GateOpen => "gate_open",
            EventKind::PipeEnterLoadcell => "pipe_enter_loadcell",
            EventKind::PipeExitLoadcell => "pipe_exit_loadcell",
            EventKind::SettingChanged => "setting_changed",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "gate_open" => EventKind::GateOpen,
            "pipe_enter_loadcell" => EventKind::PipeEnterLoadcell,
            "pipe_exit_loadcell" => EventKind::PipeExitLoadcell,
            "setting_changed" => EventKind::SettingChanged,
            other => anyhow::bail!("unknown event kind '{other}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("gate_open".parse::<EventKind>().unwrap(), EventKind::GateOpen);
        assert_eq!(
            "pipe_exit_loadcell".parse::<EventKind>().unwrap(),
            EventKind::PipeExitLoadcell
        );
        assert!("door_open".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_pipe_event_accessors() {
        let ev = PipeEvent::Exited(PipeExitedLoadcellEvent {
            pipe_uid: "caster5_1_000001".to_string(),
            tracker_id: TrackId(4),
            t_exit: 12.5,
        });
        assert_eq!(ev.pipe_uid(), "caster5_1_000001");
        assert_eq!(ev.tracker_id(), TrackId(4));
        assert_eq!(ev.ts(), 12.5);
        assert_eq!(ev.kind(), EventKind::PipeExitLoadcell);
    }
}

//! Pipe and event persistence
//!
//! The decision loop owns its store and calls it synchronously. Writes are
//! batched into one open transaction and made durable by `commit`, which the
//! loop calls on a fixed interval. Settings writes commit immediately so an
//! operator change is visible to the next poll.

use crate::domain::events::EventKind;
use crate::domain::types::{now_ts, PipeOrigin, PipeRecord, PipeState, TrackId};
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::{debug, error, info};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS pipes (
  pipe_uid TEXT PRIMARY KEY,
  tracker_id INTEGER NOT NULL,
  origin TEXT,
  state TEXT NOT NULL,
  t_origin REAL,
  t_loadcell_enter REAL,
  t_loadcell_exit REAL,
  avg_conf_full REAL NOT NULL,
  conf_count_full INTEGER NOT NULL,
  avg_conf_till_gate REAL NOT NULL,
  conf_count_till_gate INTEGER NOT NULL,
  frames_missing INTEGER NOT NULL,
  last_seen_ts REAL NOT NULL,
  reached_gate_zone INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipes_origin_t ON pipes(origin, t_origin);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts REAL NOT NULL,
  event_type TEXT NOT NULL,
  pipe_uid TEXT,
  details TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at REAL NOT NULL
);
";

/// Persisted event row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub ts: f64,
    pub kind: EventKind,
    pub pipe_uid: Option<String>,
    pub details: String,
}

/// Persistence operations the decision loop needs
pub trait Store: Send {
    /// Insert or replace the row keyed by `pipe_uid`
    fn upsert_pipe(&mut self, pipe: &PipeRecord) -> Result<()>;

    /// Append to the event log
    fn insert_event(
        &mut self,
        ts: f64,
        kind: EventKind,
        pipe_uid: Option<&str>,
        details: &str,
    ) -> Result<()>;

    /// Make pending writes durable
    fn commit(&mut self) -> Result<()>;

    fn get_setting(&self, key: &str, default: &str) -> Result<String>;

    fn set_setting(&mut self, key: &str, value: &str) -> Result<()>;

    /// Most recent pipes first, ordered by origin time
    fn recent_pipes(&self, limit: usize) -> Result<Vec<PipeRecord>>;

    /// Most recent events first
    fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>>;

    /// Caster-origin pipes with `t_origin >= cutoff_ts`
    fn caster_count_since(&self, cutoff_ts: f64) -> Result<u64>;

    /// Mean full-lifetime confidence of caster-origin pipes since `cutoff_ts`, 0 if none
    fn caster_avg_conf_since(&self, cutoff_ts: f64) -> Result<f64>;

    fn close(&mut self) -> Result<()>;
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("column {column} is negative: {value}"))
}

fn origin_from_str(value: &str) -> Result<PipeOrigin> {
    match value {
        "caster" => Ok(PipeOrigin::Caster),
        "other" => Ok(PipeOrigin::Other),
        _ => Err(anyhow!("unknown pipe origin '{value}'")),
    }
}

fn state_from_str(value: &str) -> Result<PipeState> {
    match value {
        "moving" => Ok(PipeState::Moving),
        "on_loadcell" => Ok(PipeState::OnLoadcell),
        "parked" => Ok(PipeState::Parked),
        _ => Err(anyhow!("unknown pipe state '{value}'")),
    }
}

fn row_to_pipe(row: &Row) -> Result<PipeRecord> {
    let origin: Option<String> = row.get("origin")?;
    let state: String = row.get("state")?;
    let conf_count_full: i64 = row.get("conf_count_full")?;
    let conf_count_till_gate: i64 = row.get("conf_count_till_gate")?;
    let frames_missing: i64 = row.get("frames_missing")?;

    Ok(PipeRecord {
        pipe_uid: row.get("pipe_uid")?,
        tracker_id: TrackId(row.get("tracker_id")?),
        origin: origin.as_deref().map(origin_from_str).transpose()?,
        state: state_from_str(&state)?,
        t_origin: row.get("t_origin")?,
        t_loadcell_enter: row.get("t_loadcell_enter")?,
        t_loadcell_exit: row.get("t_loadcell_exit")?,
        avg_conf_full: row.get("avg_conf_full")?,
        conf_count_full: to_u64(conf_count_full, "conf_count_full")?,
        avg_conf_till_gate: row.get("avg_conf_till_gate")?,
        conf_count_till_gate: to_u64(conf_count_till_gate, "conf_count_till_gate")?,
        frames_missing: to_u64(frames_missing, "frames_missing")?,
        last_seen_ts: row.get("last_seen_ts")?,
        reached_gate_zone: row.get("reached_gate_zone")?,
    })
}

fn row_to_event(row: &Row) -> Result<StoredEvent> {
    let kind: String = row.get("event_type")?;
    Ok(StoredEvent {
        ts: row.get("ts")?,
        kind: kind.parse()?,
        pipe_uid: row.get("pipe_uid")?,
        details: row.get("details")?,
    })
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        );
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().context("failed to open migration transaction")?;
    tx.execute_batch(SCHEMA_V1).context("failed to create schema")?;
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;
    Ok(())
}

/// SQLite-backed store (WAL journal, batched writes)
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database, creating parent directories as needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "db_opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!(error = %e, "db_wal_failed");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        run_migrations(&mut conn).context("failed to run database migrations")?;
        Ok(Self { conn })
    }

    /// Open the write batch if none is pending
    fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn upsert_pipe(&mut self, p: &PipeRecord) -> Result<()> {
        self.begin()?;
        self.conn
            .execute(
                "INSERT INTO pipes (pipe_uid, tracker_id, origin, state, t_origin,
                    t_loadcell_enter, t_loadcell_exit, avg_conf_full, conf_count_full,
                    avg_conf_till_gate, conf_count_till_gate, frames_missing,
                    last_seen_ts, reached_gate_zone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(pipe_uid) DO UPDATE SET
                    tracker_id = excluded.tracker_id,
                    origin = excluded.origin,
                    state = excluded.state,
                    t_origin = excluded.t_origin,
                    t_loadcell_enter = excluded.t_loadcell_enter,
                    t_loadcell_exit = excluded.t_loadcell_exit,
                    avg_conf_full = excluded.avg_conf_full,
                    conf_count_full = excluded.conf_count_full,
                    avg_conf_till_gate = excluded.avg_conf_till_gate,
                    conf_count_till_gate = excluded.conf_count_till_gate,
                    frames_missing = excluded.frames_missing,
                    last_seen_ts = excluded.last_seen_ts,
                    reached_gate_zone = excluded.reached_gate_zone",
                params![
                    p.pipe_uid,
                    p.tracker_id.0,
                    p.origin.map(|o| o.as_str()),
                    p.state.as_str(),
                    p.t_origin,
                    p.t_loadcell_enter,
                    p.t_loadcell_exit,
                    p.avg_conf_full,
                    to_i64(p.conf_count_full)?,
                    p.avg_conf_till_gate,
                    to_i64(p.conf_count_till_gate)?,
                    to_i64(p.frames_missing)?,
                    p.last_seen_ts,
                    p.reached_gate_zone,
                ],
            )
            .with_context(|| format!("failed to upsert pipe {}", p.pipe_uid))?;
        debug!(
            pipe_uid = %p.pipe_uid,
            origin = p.origin.map(|o| o.as_str()).unwrap_or("-"),
            state = p.state.as_str(),
            "db_upsert_pipe"
        );
        Ok(())
    }

    fn insert_event(
        &mut self,
        ts: f64,
        kind: EventKind,
        pipe_uid: Option<&str>,
        details: &str,
    ) -> Result<()> {
        self.begin()?;
        self.conn
            .execute(
                "INSERT INTO events (ts, event_type, pipe_uid, details) VALUES (?1, ?2, ?3, ?4)",
                params![ts, kind.as_str(), pipe_uid, details],
            )
            .with_context(|| format!("failed to insert {} event", kind.as_str()))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT").context("failed to commit batch")?;
            debug!("db_commit");
        }
        Ok(())
    }

    fn get_setting(&self, key: &str, default: &str) -> Result<String> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value.unwrap_or_else(|| default.to_string()))
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_ts()],
        )?;
        self.commit()
    }

    fn recent_pipes(&self, limit: usize) -> Result<Vec<PipeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM pipes ORDER BY COALESCE(t_origin, 0) DESC, last_seen_ts DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![to_i64(limit as u64)?])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_pipe(row)?);
        }
        Ok(out)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ts, event_type, pipe_uid, details FROM events ORDER BY id DESC LIMIT ?1")?;
        let mut rows = stmt.query(params![to_i64(limit as u64)?])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_event(row)?);
        }
        Ok(out)
    }

    fn caster_count_since(&self, cutoff_ts: f64) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pipes
             WHERE origin = 'caster' AND t_origin IS NOT NULL AND t_origin >= ?1",
            params![cutoff_ts],
            |row| row.get(0),
        )?;
        to_u64(count, "count")
    }

    fn caster_avg_conf_since(&self, cutoff_ts: f64) -> Result<f64> {
        let avg: Option<f64> = self.conn.query_row(
            "SELECT AVG(avg_conf_full) FROM pipes
             WHERE origin = 'caster' AND t_origin IS NOT NULL AND t_origin >= ?1",
            params![cutoff_ts],
            |row| row.get(0),
        )?;
        Ok(avg.unwrap_or(0.0))
    }

    fn close(&mut self) -> Result<()> {
        self.commit()?;
        info!("db_closed");
        Ok(())
    }
}

/// Volatile store for tests and dry runs; same semantics, nothing on disk
#[derive(Debug, Default)]
pub struct MemoryStore {
    pipes: FxHashMap<String, PipeRecord>,
    events: Vec<StoredEvent>,
    settings: FxHashMap<String, String>,
    commits: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipe(&self, pipe_uid: &str) -> Option<&PipeRecord> {
        self.pipes.get(pipe_uid)
    }

    pub fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    fn caster_since(&self, cutoff_ts: f64) -> impl Iterator<Item = &PipeRecord> {
        self.pipes.values().filter(move |p| {
            p.origin == Some(PipeOrigin::Caster) && p.t_origin.is_some_and(|t| t >= cutoff_ts)
        })
    }
}

impl Store for MemoryStore {
    fn upsert_pipe(&mut self, pipe: &PipeRecord) -> Result<()> {
        self.pipes.insert(pipe.pipe_uid.clone(), pipe.clone());
        Ok(())
    }

    fn insert_event(
        &mut self,
        ts: f64,
        kind: EventKind,
        pipe_uid: Option<&str>,
        details: &str,
    ) -> Result<()> {
        self.events.push(StoredEvent {
            ts,
            kind,
            pipe_uid: pipe_uid.map(str::to_string),
            details: details.to_string(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }

    fn get_setting(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.settings.get(key).cloned().unwrap_or_else(|| default.to_string()))
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn recent_pipes(&self, limit: usize) -> Result<Vec<PipeRecord>> {
        let mut pipes: Vec<PipeRecord> = self.pipes.values().cloned().collect();
        pipes.sort_by(|a, b| {
            let ka = (a.t_origin.unwrap_or(0.0), a.last_seen_ts);
            let kb = (b.t_origin.unwrap_or(0.0), b.last_seen_ts);
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });
        pipes.truncate(limit);
        Ok(pipes)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        Ok(self.events.iter().rev().take(limit).cloned().collect())
    }

    fn caster_count_since(&self, cutoff_ts: f64) -> Result<u64> {
        Ok(self.caster_since(cutoff_ts).count() as u64)
    }

    fn caster_avg_conf_since(&self, cutoff_ts: f64) -> Result<f64> {
        let (sum, n) = self
            .caster_since(cutoff_ts)
            .fold((0.0, 0u64), |(s, n), p| (s + p.avg_conf_full, n + 1));
        Ok(if n > 0 { sum / n as f64 } else { 0.0 })
    }

    fn close(&mut self) -> Result<()> {
        self.commit()
    }
}

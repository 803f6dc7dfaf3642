//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use super::models::*;
use crate::alarm::{AlarmEvent, AlarmHistory, AlarmState, AlarmStateStore, StateValue};
use crate::metrics::{Dimensions, MetricSample, MetricsSink, SampleSource, SinkError};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: stored state changed concurrently")]
    Conflict,
    #[error("Database lock poisoned")]
    Poisoned,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str = "id, url, active, tags, notes, created_at, updated_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;

        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000002_alarms.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target CRUD ---

    /// Create a target with a fresh id.
    pub fn add_target(&self, new: &NewTarget) -> Result<Target, DbError> {
        let url = new.url.trim();
        if url.is_empty() {
            return Err(DbError::Validation("url is required".to_string()));
        }

        let now = Utc::now();
        let target = Target {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            active: new.active.unwrap_or(true),
            tags: new.tags.clone().unwrap_or_default(),
            notes: new.notes.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (id, url, active, tags, notes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                target.id,
                target.url,
                target.active,
                serde_json::to_string(&target.tags)?,
                target.notes,
                format_db_time(&target.created_at),
                format_db_time(&target.updated_at),
            ],
        )?;
        Ok(target)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: &str) -> Result<Target, DbError> {
        let conn = self.conn()?;
        query_target(&conn, id)?.ok_or(DbError::NotFound)
    }

    /// List targets, optionally only those with the given active flag.
    pub fn list_targets(&self, active: Option<bool>) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let targets = match active {
            Some(flag) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM targets WHERE active = ?1 ORDER BY created_at ASC",
                    TARGET_COLUMNS
                ))?;
                let rows = stmt.query_map(params![flag], target_from_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM targets ORDER BY created_at ASC",
                    TARGET_COLUMNS
                ))?;
                let rows = stmt.query_map([], target_from_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };
        Ok(targets)
    }

    /// Apply a partial update to an existing target.
    pub fn update_target(&self, id: &str, patch: &TargetPatch) -> Result<Target, DbError> {
        patch.validate().map_err(DbError::Validation)?;

        let conn = self.conn()?;
        let mut target = query_target(&conn, id)?.ok_or(DbError::NotFound)?;
        patch.apply_to(&mut target);
        target.updated_at = Utc::now();

        let changed = conn.execute(
            "UPDATE targets SET url=?1, active=?2, tags=?3, notes=?4, updated_at=?5 WHERE id=?6",
            params![
                target.url,
                target.active,
                serde_json::to_string(&target.tags)?,
                target.notes,
                format_db_time(&target.updated_at),
                target.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(target)
    }

    /// Delete a target. Deleting a missing target is `NotFound`.
    pub fn delete_target(&self, id: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Metric samples ---

    /// Add metric samples in batch.
    pub fn add_metric_samples(&self, samples: &[MetricSample]) -> Result<usize, DbError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_samples (time, namespace, metric_name, dimensions, value, unit) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            )?;

            for s in samples {
                stmt.execute(params![
                    format_db_time(&s.timestamp),
                    s.namespace,
                    s.metric_name,
                    serde_json::to_string(&s.dimensions)?,
                    s.value,
                    s.unit.as_str(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(samples.len())
    }

    /// Get sample values for one series with `start <= time <= end`.
    pub fn get_sample_values(
        &self,
        namespace: &str,
        metric_name: &str,
        dimensions: &Dimensions,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT value FROM metric_samples
             WHERE namespace = ?1 AND metric_name = ?2 AND dimensions = ?3 AND time >= ?4 AND time <= ?5
             ORDER BY time ASC"
        )?;

        let values = stmt
            .query_map(
                params![
                    namespace,
                    metric_name,
                    serde_json::to_string(dimensions)?,
                    format_db_time(&start),
                    format_db_time(&end),
                ],
                |row| row.get(0),
            )?
            .collect::<SqlResult<Vec<f64>>>()?;

        Ok(values)
    }

    /// Delete samples older than the cutoff. Returns the number removed.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM metric_samples WHERE time < ?1",
            params![format_db_time(&cutoff)],
        )?;
        Ok(removed)
    }

    // --- Alarm state ---

    fn query_alarm_state(conn: &Connection, alarm_name: &str) -> Result<Option<AlarmState>, DbError> {
        let state = conn
            .query_row(
                "SELECT alarm_name, metric_name, dimensions, state, consecutive_breach_count, last_evaluated_at
                 FROM alarm_states WHERE alarm_name = ?1",
                params![alarm_name],
                alarm_state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    // --- Status ---

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }
}

impl MetricsSink for Store {
    fn put_metric_data(&self, samples: &[MetricSample]) -> Result<usize, SinkError> {
        self.add_metric_samples(samples)
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

impl SampleSource for Store {
    fn sample_values(
        &self,
        namespace: &str,
        metric_name: &str,
        dimensions: &Dimensions,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, SinkError> {
        self.get_sample_values(namespace, metric_name, dimensions, start, end)
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

impl AlarmStateStore for Store {
    fn get_alarm_state(&self, alarm_name: &str) -> Result<Option<AlarmState>, DbError> {
        let conn = self.conn()?;
        Self::query_alarm_state(&conn, alarm_name)
    }

    fn put_alarm_state(&self, state: &AlarmState, expected: Option<&AlarmState>) -> Result<(), DbError> {
        let conn = self.conn()?;
        let dims = serde_json::to_string(&state.dimensions)?;
        let last = state.last_evaluated_at.as_ref().map(format_db_time);

        let changed = match expected {
            None => conn.execute(
                "INSERT INTO alarm_states (alarm_name, metric_name, dimensions, state, consecutive_breach_count, last_evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(alarm_name) DO NOTHING",
                params![
                    state.alarm_name,
                    state.metric_name,
                    dims,
                    state.state.as_str(),
                    state.consecutive_breach_count,
                    last,
                ],
            )?,
            Some(prev) => conn.execute(
                "UPDATE alarm_states SET state=?1, consecutive_breach_count=?2, last_evaluated_at=?3
                 WHERE alarm_name=?4 AND state=?5 AND consecutive_breach_count=?6",
                params![
                    state.state.as_str(),
                    state.consecutive_breach_count,
                    last,
                    state.alarm_name,
                    prev.state.as_str(),
                    prev.consecutive_breach_count,
                ],
            )?,
        };

        if changed == 0 {
            return Err(DbError::Conflict);
        }
        Ok(())
    }

    fn list_alarm_states(&self) -> Result<Vec<AlarmState>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT alarm_name, metric_name, dimensions, state, consecutive_breach_count, last_evaluated_at
             FROM alarm_states ORDER BY alarm_name ASC"
        )?;
        let states = stmt
            .query_map([], alarm_state_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(states)
    }
}

impl AlarmHistory for Store {
    fn put_alarm_event(&self, event: &AlarmEvent) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alarm_events (alarm_name, state_change_time, new_state, reason, metric_namespace, metric_name, dimensions, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(alarm_name, state_change_time) DO UPDATE SET
             new_state=excluded.new_state, reason=excluded.reason, metric_namespace=excluded.metric_namespace,
             metric_name=excluded.metric_name, dimensions=excluded.dimensions, raw=excluded.raw",
            params![
                event.alarm_name,
                event.state_change_time,
                event.new_state,
                event.reason,
                event.metric_namespace,
                event.metric_name,
                serde_json::to_string(&event.dimensions)?,
                event.raw.to_string(),
            ],
        )?;
        Ok(())
    }

    fn alarm_events(&self, alarm_name: &str, start: &str, end: &str) -> Result<Vec<AlarmEvent>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT alarm_name, state_change_time, new_state, reason, metric_namespace, metric_name, dimensions, raw
             FROM alarm_events
             WHERE alarm_name = ?1 AND state_change_time >= ?2 AND state_change_time <= ?3
             ORDER BY state_change_time ASC"
        )?;

        let events = stmt
            .query_map(params![alarm_name, start, end], |row| {
                let dims: String = row.get(6)?;
                let raw: String = row.get(7)?;
                Ok(AlarmEvent {
                    alarm_name: row.get(0)?,
                    state_change_time: row.get(1)?,
                    new_state: row.get(2)?,
                    reason: row.get(3)?,
                    metric_namespace: row.get(4)?,
                    metric_name: row.get(5)?,
                    dimensions: serde_json::from_str(&dims).unwrap_or_default(),
                    raw: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }
}

fn query_target(conn: &Connection, id: &str) -> Result<Option<Target>, DbError> {
    let target = conn
        .query_row(
            &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
            params![id],
            target_from_row,
        )
        .optional()?;
    Ok(target)
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    let tags: String = row.get(3)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok(Target {
        id: row.get(0)?,
        url: row.get(1)?,
        active: row.get(2)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        notes: row.get(4)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated).unwrap_or_else(Utc::now),
    })
}

fn alarm_state_from_row(row: &Row<'_>) -> SqlResult<AlarmState> {
    let dims: String = row.get(2)?;
    let state: String = row.get(3)?;
    let last: Option<String> = row.get(5)?;
    Ok(AlarmState {
        alarm_name: row.get(0)?,
        metric_name: row.get(1)?,
        dimensions: serde_json::from_str(&dims).unwrap_or_default(),
        state: StateValue::parse(&state).unwrap_or(StateValue::InsufficientData),
        consecutive_breach_count: row.get(4)?,
        last_evaluated_at: last.as_deref().and_then(parse_db_time),
    })
}

fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

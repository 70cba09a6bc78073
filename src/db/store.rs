//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Url;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid input: {0}")]
    Invalid(String),
    #[error("Owner already monitors {0} targets")]
    LimitReached(usize),
    #[error("Target is already monitored")]
    Duplicate,
    #[error("Store task failed: {0}")]
    Task(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

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

    /// Enable foreign keys and run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Task("store mutex poisoned".to_string()))
    }

    // --- Targets ---

    /// Register a new target in `pending` state.
    ///
    /// The URL is stored in normalized form; an owner may not register the
    /// same URL twice or exceed `max_per_owner` targets.
    pub fn register_target(
        &self,
        owner_id: &str,
        url: &str,
        max_per_owner: usize,
    ) -> Result<MonitoredTarget, DbError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(DbError::Invalid("owner id is required".to_string()));
        }
        let url = normalize_target_url(url)?;
        let created_at = Utc::now();

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM targets WHERE owner_id = ?1",
            params![owner_id],
            |r| r.get(0),
        )?;
        if count as usize >= max_per_owner {
            return Err(DbError::LimitReached(max_per_owner));
        }

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM targets WHERE owner_id = ?1 AND url = ?2",
                params![owner_id, url],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(DbError::Duplicate);
        }

        tx.execute(
            "INSERT INTO targets (owner_id, url, current_status, last_checked_at, created_at) VALUES (?1, ?2, ?3, NULL, ?4)",
            params![owner_id, url, Status::Pending.as_str(), fmt_db_time(&created_at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(MonitoredTarget {
            id,
            owner_id: owner_id.to_string(),
            url,
            current_status: Status::Pending,
            last_checked_at: None,
            created_at,
        })
    }

    /// Get all targets as one consistent snapshot.
    pub fn get_targets(&self) -> Result<Vec<MonitoredTarget>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, url, current_status, last_checked_at, created_at FROM targets ORDER BY id",
        )?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<MonitoredTarget, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, owner_id, url, current_status, last_checked_at, created_at FROM targets WHERE id = ?1",
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// List an owner's targets, newest first, each with its latest history.
    pub fn get_targets_for_owner(
        &self,
        owner_id: &str,
        history_limit: usize,
    ) -> Result<Vec<TargetWithHistory>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, url, current_status, last_checked_at, created_at FROM targets
             WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let targets = stmt
            .query_map(params![owner_id], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        targets
            .into_iter()
            .map(|target| -> Result<TargetWithHistory, DbError> {
                let history = query_history(&conn, target.id, history_limit)?;
                Ok(TargetWithHistory { target, history })
            })
            .collect()
    }

    /// Delete a target; its history goes with it.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a target only if it belongs to `owner_id`.
    pub fn delete_owned_target(&self, id: i64, owner_id: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM targets WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Probe outcomes ---

    /// Atomically set the target's status pair and append one history entry.
    ///
    /// Fails with `NotFound`, writing nothing, if the target no longer exists.
    pub fn commit_probe_outcome(
        &self,
        target_id: i64,
        status: Status,
        latency_millis: Option<i64>,
        observed_at: DateTime<Utc>,
    ) -> Result<HistoryEntry, DbError> {
        if status == Status::Pending {
            return Err(DbError::Invalid("cannot commit a pending status".to_string()));
        }
        let observed = fmt_db_time(&observed_at);

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let updated = tx.execute(
            "UPDATE targets SET current_status = ?1, last_checked_at = ?2 WHERE id = ?3",
            params![status.as_str(), observed, target_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }

        tx.execute(
            "INSERT INTO history (target_id, status, latency_millis, observed_at) VALUES (?1, ?2, ?3, ?4)",
            params![target_id, status.as_str(), latency_millis, observed],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(HistoryEntry {
            id,
            target_id,
            status,
            latency_millis,
            observed_at,
        })
    }

    /// Get a target's history, newest first.
    pub fn get_history(&self, target_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, DbError> {
        let conn = self.conn()?;
        query_history(&conn, target_id, limit)
    }

    // --- Cycle ledger ---

    /// Record a completed cycle.
    pub fn record_cycle(
        &self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        targets_processed: usize,
        targets_failed: usize,
    ) -> Result<CycleRecord, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ping_cycles (started_at, finished_at, targets_processed, targets_failed) VALUES (?1, ?2, ?3, ?4)",
            params![
                fmt_db_time(&started_at),
                fmt_db_time(&finished_at),
                targets_processed as i64,
                targets_failed as i64,
            ],
        )?;
        Ok(CycleRecord {
            id: conn.last_insert_rowid(),
            started_at,
            finished_at,
            targets_processed: targets_processed as i64,
            targets_failed: targets_failed as i64,
        })
    }

    /// Get the most recently finished cycle, if any.
    pub fn last_cycle(&self) -> Result<Option<CycleRecord>, DbError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, started_at, finished_at, targets_processed, targets_failed FROM ping_cycles
                 ORDER BY finished_at DESC, id DESC LIMIT 1",
                [],
                |row| {
                    Ok(CycleRecord {
                        id: row.get(0)?,
                        started_at: time_column(row, 1)?,
                        finished_at: time_column(row, 2)?,
                        targets_processed: row.get(3)?,
                        targets_failed: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

fn query_history(conn: &Connection, target_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, target_id, status, latency_millis, observed_at FROM history
         WHERE target_id = ?1 ORDER BY observed_at DESC, id DESC LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![target_id, limit as i64], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                target_id: row.get(1)?,
                status: status_column(row, 2)?,
                latency_millis: row.get(3)?,
                observed_at: time_column(row, 4)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(entries)
}

fn target_from_row(row: &Row<'_>) -> SqlResult<MonitoredTarget> {
    let last_checked: Option<String> = row.get(4)?;
    Ok(MonitoredTarget {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        url: row.get(2)?,
        current_status: status_column(row, 3)?,
        last_checked_at: last_checked.as_deref().and_then(parse_db_time),
        created_at: time_column(row, 5)?,
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> SqlResult<Status> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp: {}", raw).into())
    })
}

/// Validate a target URL and return its normalized form.
///
/// Only absolute `http`/`https` URLs are accepted.
pub fn normalize_target_url(raw: &str) -> Result<String, DbError> {
    let parsed = Url::parse(raw.trim())
        .map_err(|e| DbError::Invalid(format!("invalid URL {:?}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(parsed.to_string()),
        "http" | "https" => Err(DbError::Invalid(format!("URL {:?} has no host", raw))),
        other => Err(DbError::Invalid(format!(
            "unsupported scheme {:?}, must be http or https",
            other
        ))),
    }
}

fn fmt_db_time(t: &DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

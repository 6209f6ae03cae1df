//! Append-only log of processing attempts and user edits.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::{format_ts, parse_ts, Database};
use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptSource {
    Analysis,
    UserEdit,
}

impl AttemptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptSource::Analysis => "analysis",
            AttemptSource::UserEdit => "user_edit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "analysis" => Some(AttemptSource::Analysis),
            "user_edit" => Some(AttemptSource::UserEdit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptOutcome::Success),
            "failure" => Some(AttemptOutcome::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingAttempt {
    pub id: i64,
    pub file_id: i64,
    pub source: AttemptSource,
    pub outcome: AttemptOutcome,
    pub lease_token: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Fields of an attempt about to be logged.
#[derive(Debug, Clone)]
pub struct NewAttempt<'a> {
    pub source: AttemptSource,
    pub outcome: AttemptOutcome,
    pub lease_token: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_kind: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

/// Insert inside whatever transaction the caller holds.
pub(crate) fn insert_attempt(
    conn: &Connection,
    file_id: i64,
    attempt: &NewAttempt<'_>,
) -> rusqlite::Result<i64> {
    let duration_ms = (attempt.finished_at - attempt.started_at)
        .num_milliseconds()
        .max(0);
    conn.execute(
        r#"
        INSERT INTO processing_attempts (
            file_id, source, outcome, lease_token,
            started_at, finished_at, duration_ms, error_kind, error_message
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        rusqlite::params![
            file_id,
            attempt.source.as_str(),
            attempt.outcome.as_str(),
            attempt.lease_token,
            format_ts(&attempt.started_at),
            format_ts(&attempt.finished_at),
            duration_ms,
            attempt.error_kind,
            attempt.error_message,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Every attempt for a file, oldest first.
    pub fn attempts_for(&self, file_id: i64) -> StoreResult<Vec<ProcessingAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, file_id, source, outcome, lease_token,
                   started_at, finished_at, duration_ms, error_kind, error_message
            FROM processing_attempts
            WHERE file_id = ?
            ORDER BY id ASC
            "#,
        )?;

        let attempts = stmt
            .query_map([file_id], |row| {
                let source: String = row.get(2)?;
                let outcome: String = row.get(3)?;
                Ok(ProcessingAttempt {
                    id: row.get(0)?,
                    file_id: row.get(1)?,
                    source: AttemptSource::from_str(&source).unwrap_or(AttemptSource::Analysis),
                    outcome: AttemptOutcome::from_str(&outcome).unwrap_or(AttemptOutcome::Failure),
                    lease_token: row.get(4)?,
                    started_at: parse_ts(row.get(5)?).unwrap_or_default(),
                    finished_at: parse_ts(row.get(6)?).unwrap_or_default(),
                    duration_ms: row.get(7)?,
                    error_kind: row.get(8)?,
                    error_message: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(attempts)
    }

    pub fn count_attempts(&self, file_id: i64, outcome: AttemptOutcome) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processing_attempts WHERE file_id = ? AND outcome = ?",
            rusqlite::params![file_id, outcome.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

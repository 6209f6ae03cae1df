mod schema;
pub mod attempts;
pub mod files;
pub mod metadata;
pub mod search;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use attempts::{AttemptOutcome, AttemptSource, NewAttempt, ProcessingAttempt};
pub use files::{Claim, ProcessingStats, ReprocessFilter, ReprocessMode, UpsertOutcome};
pub use metadata::{HistoryEntry, HistorySource, MetadataEdit};
pub use schema::{MIGRATIONS, SCHEMA, SCHEMA_VERSION};
pub use search::{SearchFilter, SearchHit};

use crate::error::{StoreError, StoreResult};

/// Handle to the state store.
///
/// Built once and shared (usually behind an `Arc`) by discovery, the batch
/// runner and read-only callers. The connection sits behind a mutex, so every
/// call holds it only for the duration of one statement or transaction; slow
/// work such as downloads and vision calls happens outside of it.
pub struct Database {
    conn: Mutex<Connection>,
    history_limit: Option<usize>,
}

impl Database {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::ConnectionLost(format!("{}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            history_limit: None,
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            history_limit: None,
        })
    }

    /// Keep at most `limit` archived metadata versions per file. `None` keeps all.
    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }

    /// Create the schema, or bring an older database up to date.
    pub fn initialize(&self) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let existing = recorded_version(&conn)?;

        conn.execute_batch(SCHEMA)?;

        match existing {
            None => {
                conn.execute(
                    "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
            }
            Some(current) => {
                for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
                    let tx = conn.transaction()?;
                    tx.execute_batch(sql)?;
                    tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
                    tx.commit()?;
                    tracing::info!(from = current, to = version, "Applied schema migration");
                }
            }
        }
        Ok(())
    }

    pub fn schema_version(&self) -> StoreResult<i64> {
        let conn = self.lock()?;
        Ok(recorded_version(&conn)?.unwrap_or(0))
    }

    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::ConnectionLost("store mutex poisoned by a panicked worker".into()))
    }
}

fn recorded_version(conn: &Connection) -> StoreResult<Option<i64>> {
    let has_table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_table.is_none() {
        return Ok(None);
    }
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so they sort and
/// compare correctly as strings.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.initialize().unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrates_version_one_database() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT);
                INSERT INTO schema_version (version) VALUES (1);
                CREATE TABLE files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    remote_id TEXT NOT NULL UNIQUE,
                    filename TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    file_size INTEGER,
                    mime_type TEXT,
                    created_date TEXT,
                    modified_date TEXT,
                    width INTEGER,
                    height INTEGER,
                    processing_status TEXT NOT NULL DEFAULT 'pending',
                    processed_at TEXT,
                    error_message TEXT,
                    leased_at TEXT,
                    lease_token TEXT,
                    discovered_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                );
                CREATE TABLE metadata (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_id INTEGER NOT NULL UNIQUE,
                    primary_subject TEXT NOT NULL,
                    visual_quality INTEGER NOT NULL,
                    has_people INTEGER,
                    people_count TEXT,
                    is_indoor INTEGER,
                    social_media_score INTEGER NOT NULL,
                    social_media_reason TEXT NOT NULL,
                    marketing_score INTEGER NOT NULL,
                    marketing_use TEXT NOT NULL,
                    season TEXT,
                    time_of_day TEXT,
                    mood_energy TEXT,
                    color_palette TEXT,
                    extracted_at TEXT NOT NULL
                );
                "#,
            )
            .unwrap();
        }

        db.initialize().unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);

        let conn = db.lock().unwrap();
        conn.execute("UPDATE files SET failed_attempts = 1", []).unwrap();
        conn.execute("UPDATE metadata SET notes = 'x'", []).unwrap();
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(format_ts(&a) < format_ts(&b));
        assert_eq!(parse_ts(Some(format_ts(&a))).map(|t| t.timestamp_millis()), Some(a.timestamp_millis()));
        assert_eq!(parse_ts(Some("garbage".into())), None);
    }
}

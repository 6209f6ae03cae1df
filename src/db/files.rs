//! File rows: discovery upserts, leases and lifecycle transitions.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::attempts::{insert_attempt, AttemptOutcome, AttemptSource, NewAttempt};
use super::metadata::{archive_current, replace_tags, upsert_metadata, HistorySource};
use super::{format_ts, parse_ts, Database};
use crate::error::StoreResult;
use crate::model::{ActivityTag, DiscoveredFile, ExtractedMetadata, MediaFile, ProcessingStatus};

pub(crate) const FILE_COLUMNS: &str = "id, remote_id, filename, file_path, file_size, mime_type, \
     created_date, modified_date, width, height, processing_status, processed_at, \
     error_message, leased_at, failed_attempts";

pub(crate) fn row_to_file(row: &Row<'_>) -> rusqlite::Result<MediaFile> {
    let status: String = row.get(10)?;
    let processing_status = ProcessingStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            format!("unknown processing status {:?}", status).into(),
        )
    })?;
    let width: Option<i64> = row.get(8)?;
    let height: Option<i64> = row.get(9)?;
    let failed_attempts: i64 = row.get(14)?;

    Ok(MediaFile {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        filename: row.get(2)?,
        file_path: row.get(3)?,
        file_size: row.get(4)?,
        mime_type: row.get(5)?,
        created_date: parse_ts(row.get(6)?),
        modified_date: parse_ts(row.get(7)?),
        width: width.and_then(|w| u32::try_from(w).ok()),
        height: height.and_then(|h| u32::try_from(h).ok()),
        processing_status,
        processed_at: parse_ts(row.get(11)?),
        error_message: row.get(12)?,
        leased_at: parse_ts(row.get(13)?),
        failed_attempts: u32::try_from(failed_attempts).unwrap_or(0),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    /// Already known; technical attributes refreshed, lifecycle untouched.
    Updated(i64),
}

impl UpsertOutcome {
    pub fn file_id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// Proof that a worker owns a file. Writes that finish the attempt only land
/// while the stored token still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub file_id: i64,
    pub token: String,
    pub leased_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReprocessMode {
    /// Overwrite metadata in place on the next successful attempt.
    #[default]
    Upsert,
    /// Snapshot the current metadata into history first.
    Archive,
    /// Drop the current metadata and tags immediately.
    Clear,
}

impl ReprocessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReprocessMode::Upsert => "upsert",
            ReprocessMode::Archive => "archive",
            ReprocessMode::Clear => "clear",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "upsert" => Some(ReprocessMode::Upsert),
            "archive" => Some(ReprocessMode::Archive),
            "clear" => Some(ReprocessMode::Clear),
            _ => None,
        }
    }
}

/// Which files a reprocess run selects. Empty fields do not filter.
/// Files currently `in_progress` are never selected.
#[derive(Debug, Clone, Default)]
pub struct ReprocessFilter {
    pub statuses: Vec<ProcessingStatus>,
    pub path_prefix: Option<String>,
    pub remote_ids: Vec<String>,
    pub tag: Option<ActivityTag>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub with_metadata: usize,
    pub tag_assignments: usize,
    pub attempts: usize,
}

fn holds_lease(conn: &Connection, claim: &Claim) -> rusqlite::Result<bool> {
    let held: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM files WHERE id = ? AND processing_status = 'in_progress' AND lease_token = ?",
            params![claim.file_id, claim.token],
            |row| row.get(0),
        )
        .optional()?;
    Ok(held.is_some())
}

/// Bound on host parameters per `IN (...)` list.
const ID_CHUNK: usize = 500;

fn limit_param(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

impl Database {
    /// Insert a newly discovered file as `pending`, or refresh the technical
    /// attributes of a known one. Lifecycle columns are never touched here.
    pub fn upsert_discovered(&self, file: &DiscoveredFile) -> StoreResult<UpsertOutcome> {
        let conn = self.lock()?;
        let created = file.created_date.as_ref().map(format_ts);
        let modified = file.modified_date.as_ref().map(format_ts);

        let inserted = conn.execute(
            r#"
            INSERT INTO files (remote_id, filename, file_path, file_size, mime_type, created_date, modified_date)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(remote_id) DO NOTHING
            "#,
            params![
                file.remote_id,
                file.filename,
                file.file_path,
                file.file_size,
                file.mime_type,
                created,
                modified,
            ],
        )?;

        if inserted == 1 {
            return Ok(UpsertOutcome::Inserted(conn.last_insert_rowid()));
        }

        conn.execute(
            r#"
            UPDATE files
            SET filename = ?, file_path = ?, file_size = ?, mime_type = ?,
                created_date = COALESCE(?, created_date),
                modified_date = COALESCE(?, modified_date)
            WHERE remote_id = ?
            "#,
            params![
                file.filename,
                file.file_path,
                file.file_size,
                file.mime_type,
                created,
                modified,
                file.remote_id,
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM files WHERE remote_id = ?",
            [&file.remote_id],
            |row| row.get(0),
        )?;
        Ok(UpsertOutcome::Updated(id))
    }

    pub fn get_file(&self, id: i64) -> StoreResult<Option<MediaFile>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS);
        Ok(conn.query_row(&sql, [id], row_to_file).optional()?)
    }

    pub fn get_file_by_remote_id(&self, remote_id: &str) -> StoreResult<Option<MediaFile>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM files WHERE remote_id = ?", FILE_COLUMNS);
        Ok(conn.query_row(&sql, [remote_id], row_to_file).optional()?)
    }

    pub fn files_with_status(
        &self,
        status: ProcessingStatus,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MediaFile>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM files WHERE processing_status = ? ORDER BY id LIMIT ?",
            FILE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map(params![status.as_str(), limit_param(limit)], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    /// Return `in_progress` files whose lease is older than `cutoff` to
    /// `pending`. Returns how many were reclaimed.
    pub fn reclaim_stale_leases(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock()?;
        let reclaimed = conn.execute(
            r#"
            UPDATE files
            SET processing_status = 'pending', leased_at = NULL, lease_token = NULL
            WHERE processing_status = 'in_progress'
              AND (leased_at IS NULL OR leased_at < ?)
            "#,
            [format_ts(&cutoff)],
        )?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, cutoff = %cutoff, "Reclaimed stale leases");
        }
        Ok(reclaimed)
    }

    /// Image files that are `pending` or `failed`, pending first. When
    /// `max_failed_attempts` is set, files that already failed that many times
    /// are left alone until retried explicitly.
    pub fn select_candidates(
        &self,
        limit: Option<usize>,
        max_failed_attempts: Option<u32>,
    ) -> StoreResult<Vec<MediaFile>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {} FROM files
            WHERE processing_status IN ('pending', 'failed')
              AND mime_type LIKE 'image/%'
              AND (?1 IS NULL OR failed_attempts < ?1)
            ORDER BY CASE processing_status WHEN 'pending' THEN 0 ELSE 1 END, id
            LIMIT ?2
            "#,
            FILE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map(
                params![max_failed_attempts.map(i64::from), limit_param(limit)],
                row_to_file,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    /// Pending files the batch runner will never pick up (videos and other
    /// non-image media).
    pub fn count_pending_non_images(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM files
            WHERE processing_status = 'pending'
              AND (mime_type IS NULL OR mime_type NOT LIKE 'image/%')
            "#,
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Atomically move a `pending`/`failed` file to `in_progress` under a fresh
    /// lease. `None` means another worker got there first.
    pub fn claim(&self, file_id: i64, now: DateTime<Utc>) -> StoreResult<Option<Claim>> {
        let conn = self.lock()?;
        let token = uuid::Uuid::new_v4().to_string();
        let claimed = conn.execute(
            r#"
            UPDATE files
            SET processing_status = 'in_progress', leased_at = ?, lease_token = ?
            WHERE id = ? AND processing_status IN ('pending', 'failed')
            "#,
            params![format_ts(&now), token, file_id],
        )?;

        if claimed == 1 {
            Ok(Some(Claim {
                file_id,
                token,
                leased_at: now,
            }))
        } else {
            Ok(None)
        }
    }

    /// Write metadata and tags, mark the file completed and log the attempt,
    /// all in one transaction. Returns `false` if the lease was lost, in which
    /// case only a `lease_lost` failure attempt is recorded.
    pub fn complete_file(
        &self,
        claim: &Claim,
        metadata: &ExtractedMetadata,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if !holds_lease(&tx, claim)? {
            insert_attempt(
                &tx,
                claim.file_id,
                &NewAttempt {
                    source: AttemptSource::Analysis,
                    outcome: AttemptOutcome::Failure,
                    lease_token: Some(&claim.token),
                    started_at: claim.leased_at,
                    finished_at,
                    error_kind: Some("lease_lost"),
                    error_message: Some("lease expired before results were written"),
                },
            )?;
            tx.commit()?;
            tracing::warn!(file_id = claim.file_id, "Lease lost, discarding analysis result");
            return Ok(false);
        }

        upsert_metadata(&tx, claim.file_id, metadata)?;
        replace_tags(&tx, claim.file_id, &metadata.activity_tags)?;
        tx.execute(
            r#"
            UPDATE files
            SET processing_status = 'completed', processed_at = ?, error_message = NULL,
                leased_at = NULL, lease_token = NULL, failed_attempts = 0
            WHERE id = ? AND lease_token = ?
            "#,
            params![format_ts(&finished_at), claim.file_id, claim.token],
        )?;
        insert_attempt(
            &tx,
            claim.file_id,
            &NewAttempt {
                source: AttemptSource::Analysis,
                outcome: AttemptOutcome::Success,
                lease_token: Some(&claim.token),
                started_at: claim.leased_at,
                finished_at,
                error_kind: None,
                error_message: None,
            },
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Record a failed attempt and mark the file `failed`. Existing metadata
    /// is kept. Returns `false` if the lease was lost; the attempt is still
    /// logged but the file row is left to its new owner.
    pub fn fail_file(
        &self,
        claim: &Claim,
        error_kind: &str,
        message: &str,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let held = holds_lease(&tx, claim)?;
        if held {
            tx.execute(
                r#"
                UPDATE files
                SET processing_status = 'failed', error_message = ?,
                    leased_at = NULL, lease_token = NULL,
                    failed_attempts = failed_attempts + 1
                WHERE id = ? AND lease_token = ?
                "#,
                params![message, claim.file_id, claim.token],
            )?;
        }
        insert_attempt(
            &tx,
            claim.file_id,
            &NewAttempt {
                source: AttemptSource::Analysis,
                outcome: AttemptOutcome::Failure,
                lease_token: Some(&claim.token),
                started_at: claim.leased_at,
                finished_at,
                error_kind: Some(error_kind),
                error_message: Some(message),
            },
        )?;
        tx.commit()?;

        if !held {
            tracing::warn!(file_id = claim.file_id, "Lease lost before failure was recorded");
        }
        Ok(held)
    }

    /// Fill in pixel dimensions the source did not report.
    pub fn update_dimensions(&self, file_id: i64, width: u32, height: u32) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET width = ?, height = ? WHERE id = ? AND (width IS NULL OR height IS NULL)",
            params![width, height, file_id],
        )?;
        Ok(())
    }

    /// Put selected files back to `pending` so a batch re-analyses them.
    /// Returns the ids marked, in id order.
    pub fn reset_for_reprocess(
        &self,
        filter: &ReprocessFilter,
        mode: ReprocessMode,
    ) -> StoreResult<Vec<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut sql = String::from("SELECT id FROM files WHERE processing_status != 'in_progress'");
        let mut values: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND processing_status IN ({})", marks));
            values.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if let Some(ref prefix) = filter.path_prefix {
            sql.push_str(" AND substr(file_path, 1, length(?)) = ?");
            values.push(Value::Text(prefix.clone()));
            values.push(Value::Text(prefix.clone()));
        }
        if !filter.remote_ids.is_empty() {
            let marks = vec!["?"; filter.remote_ids.len()].join(", ");
            sql.push_str(&format!(" AND remote_id IN ({})", marks));
            values.extend(filter.remote_ids.iter().cloned().map(Value::Text));
        }
        if let Some(tag) = filter.tag {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM activity_tags t WHERE t.file_id = files.id AND t.tag_name = ?)",
            );
            values.push(Value::Text(tag.as_str().to_string()));
        }
        sql.push_str(" ORDER BY id LIMIT ?");
        values.push(Value::Integer(limit_param(filter.limit)));

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let now = Utc::now();
        for &id in &ids {
            match mode {
                ReprocessMode::Upsert => {}
                ReprocessMode::Archive => {
                    archive_current(&tx, id, HistorySource::Reprocess, now, self.history_limit)?;
                }
                ReprocessMode::Clear => {
                    tx.execute("DELETE FROM metadata WHERE file_id = ?", [id])?;
                    tx.execute("DELETE FROM activity_tags WHERE file_id = ?", [id])?;
                }
            }
            tx.execute(
                r#"
                UPDATE files
                SET processing_status = 'pending', error_message = NULL,
                    leased_at = NULL, lease_token = NULL, failed_attempts = 0
                WHERE id = ?
                "#,
                [id],
            )?;
        }
        tx.commit()?;

        tracing::info!(files = ids.len(), mode = mode.as_str(), "Marked files for reprocessing");
        Ok(ids)
    }

    /// Manual retry: failed files go back to `pending` with a clean counter.
    /// Returns the ids reset, in id order.
    pub fn reset_failed(&self, limit: Option<usize>) -> StoreResult<Vec<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM files WHERE processing_status = 'failed' ORDER BY id LIMIT ?")?;
            let rows = stmt.query_map([limit_param(limit)], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for &id in &ids {
            tx.execute(
                r#"
                UPDATE files
                SET processing_status = 'pending', error_message = NULL, failed_attempts = 0
                WHERE id = ?
                "#,
                [id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// The image files among `ids` that are still `pending`, in id order.
    /// Used to run a batch over exactly the files a reset just marked.
    pub fn pending_images_by_id(&self, ids: &[i64]) -> StoreResult<Vec<MediaFile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut files = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let marks = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                r#"
                SELECT {} FROM files
                WHERE id IN ({})
                  AND processing_status = 'pending'
                  AND mime_type LIKE 'image/%'
                "#,
                FILE_COLUMNS, marks
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), row_to_file)?;
            for row in rows {
                files.push(row?);
            }
        }
        files.sort_by_key(|f| f.id);
        Ok(files)
    }

    pub fn stats(&self) -> StoreResult<ProcessingStats> {
        let conn = self.lock()?;
        let mut stats = ProcessingStats::default();

        let mut stmt =
            conn.prepare("SELECT processing_status, COUNT(*) FROM files GROUP BY processing_status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            stats.total += count;
            match ProcessingStatus::from_str(&status) {
                Some(ProcessingStatus::Pending) => stats.pending = count,
                Some(ProcessingStatus::InProgress) => stats.in_progress = count,
                Some(ProcessingStatus::Completed) => stats.completed = count,
                Some(ProcessingStatus::Failed) => stats.failed = count,
                None => {}
            }
        }

        let count = |sql: &str| -> rusqlite::Result<usize> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|c| c as usize)
        };
        stats.with_metadata = count("SELECT COUNT(*) FROM metadata")?;
        stats.tag_assignments = count("SELECT COUNT(*) FROM activity_tags")?;
        stats.attempts = count("SELECT COUNT(*) FROM processing_attempts")?;

        Ok(stats)
    }
}

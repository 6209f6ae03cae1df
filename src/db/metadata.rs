//! Metadata rows, activity tags, archived versions and the user-edit path.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::attempts::{insert_attempt, AttemptOutcome, AttemptSource, NewAttempt};
use super::{format_ts, parse_ts, Database};
use crate::error::{EditError, StoreError, StoreResult};
use crate::model::{ActivityTag, ExtractedMetadata, PeopleCount, Score, Season, TimeOfDay};
use crate::validation::{check_tags, validate, RawAnalysis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Reprocess,
    UserEdit,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistorySource::Reprocess => "reprocess",
            HistorySource::UserEdit => "user_edit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "reprocess" => Some(HistorySource::Reprocess),
            "user_edit" => Some(HistorySource::UserEdit),
            _ => None,
        }
    }
}

/// A metadata version that was replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    pub file_id: i64,
    pub source: HistorySource,
    pub metadata: ExtractedMetadata,
    pub archived_at: DateTime<Utc>,
}

/// Fields a person wants to change. `None` leaves the current value.
#[derive(Debug, Clone, Default)]
pub struct MetadataEdit {
    pub primary_subject: Option<String>,
    pub visual_quality: Option<i64>,
    pub has_people: Option<bool>,
    pub people_count: Option<String>,
    pub is_indoor: Option<bool>,
    pub social_media_score: Option<i64>,
    pub social_media_reason: Option<String>,
    pub marketing_score: Option<i64>,
    pub marketing_use: Option<String>,
    pub season: Option<String>,
    pub time_of_day: Option<String>,
    pub mood_energy: Option<String>,
    pub color_palette: Option<String>,
    pub notes: Option<String>,
    /// Replaces the whole tag set when given.
    pub activity_tags: Option<Vec<String>>,
}

impl MetadataEdit {
    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        macro_rules! check {
            ($($name:ident),*) => {
                $(if self.$name.is_some() { fields.push(stringify!($name)); })*
            };
        }
        check!(
            primary_subject,
            visual_quality,
            has_people,
            people_count,
            is_indoor,
            social_media_score,
            social_media_reason,
            marketing_score,
            marketing_use,
            season,
            time_of_day,
            mood_energy,
            color_palette,
            notes,
            activity_tags
        );
        fields
    }

    fn apply_to(&self, raw: &mut RawAnalysis) {
        macro_rules! set {
            ($($name:ident),*) => {
                $(if let Some(ref v) = self.$name { raw.$name = Some(v.clone()); })*
            };
        }
        set!(
            primary_subject,
            visual_quality,
            has_people,
            people_count,
            is_indoor,
            social_media_score,
            social_media_reason,
            marketing_score,
            marketing_use,
            season,
            time_of_day,
            mood_energy,
            color_palette,
            notes,
            activity_tags
        );
    }
}

pub(crate) fn upsert_metadata(
    conn: &Connection,
    file_id: i64,
    m: &ExtractedMetadata,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO metadata (
            file_id, primary_subject, visual_quality, has_people, people_count,
            is_indoor, social_media_score, social_media_reason, marketing_score,
            marketing_use, season, time_of_day, mood_energy, color_palette, notes,
            extracted_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_id) DO UPDATE SET
            primary_subject = excluded.primary_subject,
            visual_quality = excluded.visual_quality,
            has_people = excluded.has_people,
            people_count = excluded.people_count,
            is_indoor = excluded.is_indoor,
            social_media_score = excluded.social_media_score,
            social_media_reason = excluded.social_media_reason,
            marketing_score = excluded.marketing_score,
            marketing_use = excluded.marketing_use,
            season = excluded.season,
            time_of_day = excluded.time_of_day,
            mood_energy = excluded.mood_energy,
            color_palette = excluded.color_palette,
            notes = excluded.notes,
            extracted_at = excluded.extracted_at
        "#,
        params![
            file_id,
            m.primary_subject,
            m.visual_quality.get(),
            m.has_people,
            m.people_count.map(|p| p.as_str()),
            m.is_indoor,
            m.social_media_score.get(),
            m.social_media_reason,
            m.marketing_score.get(),
            m.marketing_use,
            m.season.map(|s| s.as_str()),
            m.time_of_day.map(|t| t.as_str()),
            m.mood_energy,
            m.color_palette,
            m.notes,
            format_ts(&m.extracted_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn replace_tags(
    conn: &Connection,
    file_id: i64,
    tags: &[ActivityTag],
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM activity_tags WHERE file_id = ?", [file_id])?;
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO activity_tags (file_id, tag_name) VALUES (?, ?)")?;
    for tag in tags {
        stmt.execute(params![file_id, tag.as_str()])?;
    }
    Ok(())
}

fn load_tags(conn: &Connection, file_id: i64) -> StoreResult<Vec<ActivityTag>> {
    let mut stmt =
        conn.prepare("SELECT tag_name FROM activity_tags WHERE file_id = ? ORDER BY id")?;
    let names = stmt
        .query_map([file_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    names
        .iter()
        .map(|name| {
            ActivityTag::from_str(name)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown tag {:?}", name)))
        })
        .collect()
}

struct MetadataRow {
    primary_subject: String,
    visual_quality: i64,
    has_people: Option<bool>,
    people_count: Option<String>,
    is_indoor: Option<bool>,
    social_media_score: i64,
    social_media_reason: String,
    marketing_score: i64,
    marketing_use: String,
    season: Option<String>,
    time_of_day: Option<String>,
    mood_energy: Option<String>,
    color_palette: Option<String>,
    notes: Option<String>,
    extracted_at: Option<String>,
}

fn corrupt(field: &str, value: impl std::fmt::Debug) -> StoreError {
    StoreError::Corrupt(format!("metadata.{} holds {:?}", field, value))
}

fn parse_enum<T>(field: &str, value: Option<String>, parse: fn(&str) -> Option<T>) -> StoreResult<Option<T>> {
    match value {
        None => Ok(None),
        Some(v) => parse(&v).map(Some).ok_or_else(|| corrupt(field, v)),
    }
}

fn score(field: &str, value: i64) -> StoreResult<Score> {
    Score::new(value).ok_or_else(|| corrupt(field, value))
}

pub(crate) fn load_metadata(
    conn: &Connection,
    file_id: i64,
) -> StoreResult<Option<ExtractedMetadata>> {
    let row = conn
        .query_row(
            r#"
            SELECT primary_subject, visual_quality, has_people, people_count, is_indoor,
                   social_media_score, social_media_reason, marketing_score, marketing_use,
                   season, time_of_day, mood_energy, color_palette, notes, extracted_at
            FROM metadata WHERE file_id = ?
            "#,
            [file_id],
            |row| {
                Ok(MetadataRow {
                    primary_subject: row.get(0)?,
                    visual_quality: row.get(1)?,
                    has_people: row.get(2)?,
                    people_count: row.get(3)?,
                    is_indoor: row.get(4)?,
                    social_media_score: row.get(5)?,
                    social_media_reason: row.get(6)?,
                    marketing_score: row.get(7)?,
                    marketing_use: row.get(8)?,
                    season: row.get(9)?,
                    time_of_day: row.get(10)?,
                    mood_energy: row.get(11)?,
                    color_palette: row.get(12)?,
                    notes: row.get(13)?,
                    extracted_at: row.get(14)?,
                })
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(ExtractedMetadata {
        primary_subject: row.primary_subject,
        visual_quality: score("visual_quality", row.visual_quality)?,
        has_people: row.has_people,
        people_count: parse_enum("people_count", row.people_count, PeopleCount::from_str)?,
        is_indoor: row.is_indoor,
        social_media_score: score("social_media_score", row.social_media_score)?,
        social_media_reason: row.social_media_reason,
        marketing_score: score("marketing_score", row.marketing_score)?,
        marketing_use: row.marketing_use,
        season: parse_enum("season", row.season, Season::from_str)?,
        time_of_day: parse_enum("time_of_day", row.time_of_day, TimeOfDay::from_str)?,
        mood_energy: row.mood_energy,
        color_palette: row.color_palette,
        notes: row.notes,
        activity_tags: load_tags(conn, file_id)?,
        extracted_at: parse_ts(row.extracted_at).unwrap_or_default(),
    }))
}

/// Copy the current metadata (tags included) into history. Returns `false`
/// when the file has nothing to archive.
pub(crate) fn archive_current(
    conn: &Connection,
    file_id: i64,
    source: HistorySource,
    now: DateTime<Utc>,
    keep: Option<usize>,
) -> StoreResult<bool> {
    let Some(current) = load_metadata(conn, file_id)? else {
        return Ok(false);
    };

    let snapshot = serde_json::to_string(&current)?;
    conn.execute(
        "INSERT INTO metadata_history (file_id, source, snapshot, archived_at) VALUES (?, ?, ?, ?)",
        params![file_id, source.as_str(), snapshot, format_ts(&now)],
    )?;

    if let Some(keep) = keep {
        conn.execute(
            r#"
            DELETE FROM metadata_history
            WHERE file_id = ?1
              AND id NOT IN (
                  SELECT id FROM metadata_history WHERE file_id = ?1 ORDER BY id DESC LIMIT ?2
              )
            "#,
            params![file_id, keep as i64],
        )?;
    }
    Ok(true)
}

impl Database {
    /// Current metadata with its tags.
    pub fn get_metadata(&self, file_id: i64) -> StoreResult<Option<ExtractedMetadata>> {
        let conn = self.lock()?;
        load_metadata(&conn, file_id)
    }

    pub fn get_tags(&self, file_id: i64) -> StoreResult<Vec<ActivityTag>> {
        let conn = self.lock()?;
        load_tags(&conn, file_id)
    }

    /// Archived versions, newest first.
    pub fn history_for(&self, file_id: i64) -> StoreResult<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, source, snapshot, archived_at FROM metadata_history WHERE file_id = ? ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([file_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, source, snapshot, archived_at)| {
                Ok(HistoryEntry {
                    id,
                    file_id,
                    source: HistorySource::from_str(&source)
                        .ok_or_else(|| StoreError::Corrupt(format!("history source {:?}", source)))?,
                    metadata: serde_json::from_str(&snapshot)?,
                    archived_at: parse_ts(archived_at).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Apply a human correction. The edit goes through the same validator as
    /// model output (tags are checked strictly), the previous version is
    /// archived, and a `user_edit` attempt is appended, all in one transaction.
    pub fn apply_user_edit(
        &self,
        file_id: i64,
        edit: &MetadataEdit,
    ) -> Result<ExtractedMetadata, EditError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::from)?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM files WHERE id = ?", [file_id], |row| row.get(0))
            .optional()
            .map_err(StoreError::from)?;
        if exists.is_none() {
            return Err(EditError::NotFound(file_id));
        }

        let current = load_metadata(&tx, file_id)?;
        let mut raw = current.as_ref().map(RawAnalysis::from).unwrap_or_default();
        edit.apply_to(&mut raw);

        let strict_tags = match edit.activity_tags {
            Some(ref tags) => Some(check_tags(tags)?),
            None => None,
        };
        let mut updated = validate(&raw)?;
        if let Some(tags) = strict_tags {
            updated.activity_tags = tags;
        }
        if let Some(ref current) = current {
            updated.extracted_at = current.extracted_at;
        }

        let now = Utc::now();
        archive_current(&tx, file_id, HistorySource::UserEdit, now, self.history_limit)?;
        upsert_metadata(&tx, file_id, &updated).map_err(StoreError::from)?;
        replace_tags(&tx, file_id, &updated.activity_tags).map_err(StoreError::from)?;

        let changed = edit.changed_fields().join(",");
        insert_attempt(
            &tx,
            file_id,
            &NewAttempt {
                source: AttemptSource::UserEdit,
                outcome: AttemptOutcome::Success,
                lease_token: None,
                started_at: now,
                finished_at: now,
                error_kind: None,
                error_message: Some(&changed),
            },
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;

        tracing::info!(file_id, fields = %changed, "Applied user edit");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProcessingAttempt;
    use crate::error::ValidationIssue;
    use crate::model::DiscoveredFile;

    fn db_with_completed_file() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap().with_history_limit(Some(2));
        db.initialize().unwrap();
        let id = db
            .upsert_discovered(&DiscoveredFile {
                remote_id: "r1".into(),
                filename: "a.jpg".into(),
                file_path: "a.jpg".into(),
                file_size: None,
                mime_type: Some("image/jpeg".into()),
                created_date: None,
                modified_date: None,
            })
            .unwrap()
            .file_id();
        let claim = db.claim(id, Utc::now()).unwrap().unwrap();
        let meta = ExtractedMetadata {
            primary_subject: "compost heap".into(),
            visual_quality: Score::new(3).unwrap(),
            has_people: Some(false),
            people_count: None,
            is_indoor: Some(false),
            social_media_score: Score::new(2).unwrap(),
            social_media_reason: "plain".into(),
            marketing_score: Score::new(2).unwrap(),
            marketing_use: "workshop handout".into(),
            season: Some(Season::Fall),
            time_of_day: None,
            mood_energy: None,
            color_palette: None,
            notes: None,
            activity_tags: vec![ActivityTag::Maintenance],
            extracted_at: Utc::now(),
        };
        db.complete_file(&claim, &meta, Utc::now()).unwrap();
        (db, id)
    }

    #[test]
    fn test_user_edit_archives_and_audits() {
        let (db, id) = db_with_completed_file();

        let edit = MetadataEdit {
            marketing_score: Some(5),
            activity_tags: Some(vec!["maintenance".into(), "tools".into()]),
            ..Default::default()
        };
        let updated = db.apply_user_edit(id, &edit).unwrap();
        assert_eq!(updated.marketing_score.get(), 5);
        assert_eq!(updated.primary_subject, "compost heap");

        let stored = db.get_metadata(id).unwrap().unwrap();
        assert_eq!(stored, updated);
        assert_eq!(
            db.get_tags(id).unwrap(),
            vec![ActivityTag::Maintenance, ActivityTag::Tools]
        );

        let history = db.history_for(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source, HistorySource::UserEdit);
        assert_eq!(history[0].metadata.marketing_score.get(), 2);

        let attempts: Vec<ProcessingAttempt> = db.attempts_for(id).unwrap();
        let last = attempts.last().unwrap();
        assert_eq!(last.source, AttemptSource::UserEdit);
        assert_eq!(last.error_message.as_deref(), Some("marketing_score,activity_tags"));
    }

    #[test]
    fn test_invalid_edit_changes_nothing() {
        let (db, id) = db_with_completed_file();
        let before = db.attempts_for(id).unwrap().len();

        let edit = MetadataEdit {
            visual_quality: Some(9),
            ..Default::default()
        };
        match db.apply_user_edit(id, &edit) {
            Err(EditError::Validation(e)) => assert_eq!(
                e.issues,
                vec![ValidationIssue::OutOfRange { field: "visual_quality", value: 9 }]
            ),
            other => panic!("unexpected result: {:?}", other),
        }

        let edit = MetadataEdit {
            activity_tags: Some(vec!["fishing".into()]),
            ..Default::default()
        };
        assert!(matches!(db.apply_user_edit(id, &edit), Err(EditError::Validation(_))));

        assert_eq!(db.get_metadata(id).unwrap().unwrap().visual_quality.get(), 3);
        assert!(db.history_for(id).unwrap().is_empty());
        assert_eq!(db.attempts_for(id).unwrap().len(), before);
    }

    #[test]
    fn test_edit_unknown_file() {
        let (db, _) = db_with_completed_file();
        assert!(matches!(
            db.apply_user_edit(999, &MetadataEdit::default()),
            Err(EditError::NotFound(999))
        ));
    }

    #[test]
    fn test_history_is_pruned_to_limit() {
        let (db, id) = db_with_completed_file();
        for score in 1..=4 {
            let edit = MetadataEdit {
                social_media_score: Some(score),
                ..Default::default()
            };
            db.apply_user_edit(id, &edit).unwrap();
        }

        let history = db.history_for(id).unwrap();
        assert_eq!(history.len(), 2);
        // Newest first: the versions replaced by the last two edits.
        assert_eq!(history[0].metadata.social_media_score.get(), 3);
        assert_eq!(history[1].metadata.social_media_score.get(), 2);
    }
}

use rusqlite::types::Value;

use super::files::{row_to_file, FILE_COLUMNS};
use super::metadata::load_metadata;
use super::Database;
use crate::error::StoreResult;
use crate::model::{ActivityTag, ExtractedMetadata, MediaFile, PeopleCount, Season, TimeOfDay};

/// Read-side filter over completed files. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Case-insensitive substring of the primary subject or notes.
    pub text: Option<String>,
    pub min_quality: Option<u8>,
    pub min_social: Option<u8>,
    pub min_marketing: Option<u8>,
    pub has_people: Option<bool>,
    pub people_count: Option<PeopleCount>,
    pub is_indoor: Option<bool>,
    pub season: Option<Season>,
    pub time_of_day: Option<TimeOfDay>,
    pub tag: Option<ActivityTag>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub file: MediaFile,
    pub metadata: ExtractedMetadata,
}

impl Database {
    /// Completed files matching `filter`, best marketing candidates first.
    pub fn search(&self, filter: &SearchFilter) -> StoreResult<Vec<SearchHit>> {
        let conn = self.lock()?;

        let columns = FILE_COLUMNS
            .split(", ")
            .map(|c| format!("f.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM files f JOIN metadata m ON m.file_id = f.id \
             WHERE f.processing_status = 'completed'",
            columns
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(ref text) = filter.text {
            sql.push_str(" AND (instr(lower(m.primary_subject), lower(?)) > 0 OR instr(lower(COALESCE(m.notes, '')), lower(?)) > 0)");
            values.push(Value::Text(text.clone()));
            values.push(Value::Text(text.clone()));
        }
        for (column, min) in [
            ("m.visual_quality", filter.min_quality),
            ("m.social_media_score", filter.min_social),
            ("m.marketing_score", filter.min_marketing),
        ] {
            if let Some(min) = min {
                sql.push_str(&format!(" AND {} >= ?", column));
                values.push(Value::Integer(min as i64));
            }
        }
        for (column, flag) in [("m.has_people", filter.has_people), ("m.is_indoor", filter.is_indoor)] {
            if let Some(flag) = flag {
                sql.push_str(&format!(" AND {} = ?", column));
                values.push(Value::Integer(flag as i64));
            }
        }
        for (column, text) in [
            ("m.people_count", filter.people_count.map(|p| p.as_str())),
            ("m.season", filter.season.map(|s| s.as_str())),
            ("m.time_of_day", filter.time_of_day.map(|t| t.as_str())),
        ] {
            if let Some(text) = text {
                sql.push_str(&format!(" AND {} = ?", column));
                values.push(Value::Text(text.to_string()));
            }
        }
        if let Some(tag) = filter.tag {
            sql.push_str(" AND EXISTS (SELECT 1 FROM activity_tags t WHERE t.file_id = f.id AND t.tag_name = ?)");
            values.push(Value::Text(tag.as_str().to_string()));
        }

        sql.push_str(" ORDER BY m.marketing_score DESC, m.visual_quality DESC, f.id LIMIT ?");
        values.push(Value::Integer(filter.limit.map(|l| l as i64).unwrap_or(-1)));

        let files = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_file)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut hits = Vec::with_capacity(files.len());
        for file in files {
            if let Some(metadata) = load_metadata(&conn, file.id)? {
                hits.push(SearchHit { file, metadata });
            }
        }
        Ok(hits)
    }

    /// How many files carry each tag, most common first. Unused tags are omitted.
    pub fn tag_counts(&self) -> StoreResult<Vec<(ActivityTag, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT tag_name, COUNT(*) AS n FROM activity_tags GROUP BY tag_name ORDER BY n DESC, tag_name",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, n)| ActivityTag::from_str(&name).map(|tag| (tag, n as usize)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscoveredFile, Score};
    use chrono::Utc;

    fn add(db: &Database, remote_id: &str, subject: &str, marketing: i64, tags: Vec<ActivityTag>) -> i64 {
        let id = db
            .upsert_discovered(&DiscoveredFile {
                remote_id: remote_id.into(),
                filename: format!("{}.jpg", remote_id),
                file_path: format!("Farm/{}.jpg", remote_id),
                file_size: None,
                mime_type: Some("image/png".into()),
                created_date: None,
                modified_date: None,
            })
            .unwrap()
            .file_id();
        let claim = db.claim(id, Utc::now()).unwrap().unwrap();
        let meta = ExtractedMetadata {
            primary_subject: subject.into(),
            visual_quality: Score::new(4).unwrap(),
            has_people: Some(true),
            people_count: Some(PeopleCount::ThreeToFive),
            is_indoor: Some(false),
            social_media_score: Score::new(4).unwrap(),
            social_media_reason: "people at work".into(),
            marketing_score: Score::new(marketing).unwrap(),
            marketing_use: "website".into(),
            season: Some(Season::Spring),
            time_of_day: Some(TimeOfDay::Morning),
            mood_energy: None,
            color_palette: None,
            notes: None,
            activity_tags: tags,
            extracted_at: Utc::now(),
        };
        db.complete_file(&claim, &meta, Utc::now()).unwrap();
        id
    }

    #[test]
    fn test_search_filters_and_orders() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let low = add(&db, "a", "Volunteers planting", 2, vec![ActivityTag::Gardening]);
        let high = add(&db, "b", "Harvest table", 5, vec![ActivityTag::Harvesting, ActivityTag::Produce]);
        db.upsert_discovered(&DiscoveredFile {
            remote_id: "pending".into(),
            filename: "p.jpg".into(),
            file_path: "p.jpg".into(),
            file_size: None,
            mime_type: Some("image/jpeg".into()),
            created_date: None,
            modified_date: None,
        })
        .unwrap();

        let all = db.search(&SearchFilter::default()).unwrap();
        assert_eq!(all.iter().map(|h| h.file.id).collect::<Vec<_>>(), vec![high, low]);

        let tagged = db
            .search(&SearchFilter {
                tag: Some(ActivityTag::Gardening),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].file.id, low);

        let text = db
            .search(&SearchFilter {
                text: Some("HARVEST".into()),
                min_marketing: Some(4),
                people_count: Some(PeopleCount::ThreeToFive),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].metadata.activity_tags.len(), 2);

        assert!(db
            .search(&SearchFilter {
                is_indoor: Some(true),
                ..Default::default()
            })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_tag_counts() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        add(&db, "a", "x", 3, vec![ActivityTag::Gardening, ActivityTag::Tools]);
        add(&db, "b", "y", 3, vec![ActivityTag::Gardening]);

        assert_eq!(
            db.tag_counts().unwrap(),
            vec![(ActivityTag::Gardening, 2), (ActivityTag::Tools, 1)]
        );
    }
}

//! Domain types shared by the store, the vision client and the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 4] = [
        ProcessingStatus::Pending,
        ProcessingStatus::InProgress,
        ProcessingStatus::Completed,
        ProcessingStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "in_progress" => Some(ProcessingStatus::InProgress),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// Bucketed head count reported by the vision model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeopleCount {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "1-2")]
    OneToTwo,
    #[serde(rename = "3-5")]
    ThreeToFive,
    #[serde(rename = "6-10")]
    SixToTen,
    #[serde(rename = "10+")]
    MoreThanTen,
}

impl PeopleCount {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeopleCount::None => "none",
            PeopleCount::OneToTwo => "1-2",
            PeopleCount::ThreeToFive => "3-5",
            PeopleCount::SixToTen => "6-10",
            PeopleCount::MoreThanTen => "10+",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "none" => Some(PeopleCount::None),
            "1-2" => Some(PeopleCount::OneToTwo),
            "3-5" => Some(PeopleCount::ThreeToFive),
            "6-10" => Some(PeopleCount::SixToTen),
            "10+" => Some(PeopleCount::MoreThanTen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Spring,
    Summer,
    Fall,
    Winter,
    Unclear,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Fall => "fall",
            Season::Winter => "winter",
            Season::Unclear => "unclear",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "spring" => Some(Season::Spring),
            "summer" => Some(Season::Summer),
            "fall" | "autumn" => Some(Season::Fall),
            "winter" => Some(Season::Winter),
            "unclear" => Some(Season::Unclear),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Midday,
    Evening,
    Unclear,
}

impl TimeOfDay {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Midday => "midday",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Unclear => "unclear",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "morning" => Some(TimeOfDay::Morning),
            "midday" => Some(TimeOfDay::Midday),
            "evening" => Some(TimeOfDay::Evening),
            "unclear" => Some(TimeOfDay::Unclear),
            _ => None,
        }
    }
}

/// Closed vocabulary of activity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityTag {
    Gardening,
    Harvesting,
    Education,
    Construction,
    Maintenance,
    Cooking,
    Celebration,
    Children,
    Animals,
    Landscape,
    Tools,
    Produce,
}

impl ActivityTag {
    pub const ALL: [ActivityTag; 12] = [
        ActivityTag::Gardening,
        ActivityTag::Harvesting,
        ActivityTag::Education,
        ActivityTag::Construction,
        ActivityTag::Maintenance,
        ActivityTag::Cooking,
        ActivityTag::Celebration,
        ActivityTag::Children,
        ActivityTag::Animals,
        ActivityTag::Landscape,
        ActivityTag::Tools,
        ActivityTag::Produce,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityTag::Gardening => "gardening",
            ActivityTag::Harvesting => "harvesting",
            ActivityTag::Education => "education",
            ActivityTag::Construction => "construction",
            ActivityTag::Maintenance => "maintenance",
            ActivityTag::Cooking => "cooking",
            ActivityTag::Celebration => "celebration",
            ActivityTag::Children => "children",
            ActivityTag::Animals => "animals",
            ActivityTag::Landscape => "landscape",
            ActivityTag::Tools => "tools",
            ActivityTag::Produce => "produce",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|tag| tag.as_str() == wanted)
    }

    /// Map free-form tag strings onto the vocabulary, dropping unknown labels
    /// and duplicates while keeping first-seen order.
    pub fn parse_known<S: AsRef<str>>(raw: &[S]) -> Vec<ActivityTag> {
        let mut tags = Vec::new();
        for s in raw {
            if let Some(tag) = ActivityTag::from_str(s.as_ref()) {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags
    }
}

/// A 1-5 rating. Construction is the only way in, so a `Score` is always in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Score(u8);

impl Score {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 5;

    pub fn new(value: i64) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Some(Score(value as u8))
        } else {
            None
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Score::new(value).ok_or_else(|| format!("score {} outside 1..=5", value))
    }
}

impl From<Score> for i64 {
    fn from(score: Score) -> Self {
        score.0 as i64
    }
}

/// One discovered remote file and its lifecycle columns.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub id: i64,
    pub remote_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
    pub modified_date: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub processing_status: ProcessingStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
}

impl MediaFile {
    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .map(|m| m.to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }
}

/// Attributes reported by the remote source for a file, before it has a row.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredFile {
    pub remote_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
    pub modified_date: Option<DateTime<Utc>>,
}

/// Validated AI-derived description of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    pub primary_subject: String,
    pub visual_quality: Score,
    pub has_people: Option<bool>,
    pub people_count: Option<PeopleCount>,
    pub is_indoor: Option<bool>,
    pub social_media_score: Score,
    pub social_media_reason: String,
    pub marketing_score: Score,
    pub marketing_use: String,
    pub season: Option<Season>,
    pub time_of_day: Option<TimeOfDay>,
    pub mood_energy: Option<String>,
    pub color_palette: Option<String>,
    pub notes: Option<String>,
    pub activity_tags: Vec<ActivityTag>,
    pub extracted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in ProcessingStatus::ALL {
            assert_eq!(ProcessingStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::from_str("done"), None);
    }

    #[test]
    fn test_score_bounds() {
        assert!(Score::new(0).is_none());
        assert!(Score::new(6).is_none());
        assert_eq!(Score::new(1).map(|s| s.get()), Some(1));
        assert_eq!(Score::new(5).map(|s| s.get()), Some(5));
    }

    #[test]
    fn test_parse_known_tags_drops_unknown_and_duplicates() {
        let tags = ActivityTag::parse_known(&["Gardening", "skydiving", "tools", "gardening"]);
        assert_eq!(tags, vec![ActivityTag::Gardening, ActivityTag::Tools]);
    }

    #[test]
    fn test_people_count_labels() {
        assert_eq!(PeopleCount::from_str("10+"), Some(PeopleCount::MoreThanTen));
        assert_eq!(PeopleCount::from_str("many"), None);
        assert_eq!(PeopleCount::SixToTen.as_str(), "6-10");
    }

    #[test]
    fn test_metadata_serializes_enums_as_labels() {
        let meta = ExtractedMetadata {
            primary_subject: "Raised beds".to_string(),
            visual_quality: Score::new(4).unwrap(),
            has_people: Some(true),
            people_count: Some(PeopleCount::ThreeToFive),
            is_indoor: Some(false),
            social_media_score: Score::new(3).unwrap(),
            social_media_reason: "Bright and busy".to_string(),
            marketing_score: Score::new(2).unwrap(),
            marketing_use: "Newsletter".to_string(),
            season: Some(Season::Fall),
            time_of_day: None,
            mood_energy: None,
            color_palette: None,
            notes: None,
            activity_tags: vec![ActivityTag::Gardening],
            extracted_at: Utc::now(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["people_count"], "3-5");
        assert_eq!(json["season"], "fall");
        assert_eq!(json["visual_quality"], 4);
        let back: ExtractedMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}

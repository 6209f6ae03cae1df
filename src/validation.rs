//! Turns a loosely-typed model answer into `ExtractedMetadata`.
//!
//! Scores outside 1..=5, unparseable enumerations and missing required text
//! reject the whole result; every problem is reported, not just the first.
//! Unknown activity tags are dropped rather than rejected.

use chrono::Utc;
use serde::{Deserialize, Deserializer};

use crate::error::{ValidationError, ValidationIssue};
use crate::model::{ActivityTag, ExtractedMetadata, PeopleCount, Score, Season, TimeOfDay};

/// Fields as the vision model reported them, before any checking.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawAnalysis {
    #[serde(default)]
    pub primary_subject: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub visual_quality: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub has_people: Option<bool>,
    #[serde(default)]
    pub people_count: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_indoor: Option<bool>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub social_media_score: Option<i64>,
    #[serde(default)]
    pub social_media_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub marketing_score: Option<i64>,
    #[serde(default)]
    pub marketing_use: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub mood_energy: Option<String>,
    #[serde(default)]
    pub color_palette: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub activity_tags: Option<Vec<String>>,
}

impl From<&ExtractedMetadata> for RawAnalysis {
    fn from(m: &ExtractedMetadata) -> Self {
        Self {
            primary_subject: Some(m.primary_subject.clone()),
            visual_quality: Some(m.visual_quality.into()),
            has_people: m.has_people,
            people_count: m.people_count.map(|p| p.as_str().to_string()),
            is_indoor: m.is_indoor,
            social_media_score: Some(m.social_media_score.into()),
            social_media_reason: Some(m.social_media_reason.clone()),
            marketing_score: Some(m.marketing_score.into()),
            marketing_use: Some(m.marketing_use.clone()),
            season: m.season.map(|s| s.as_str().to_string()),
            time_of_day: m.time_of_day.map(|t| t.as_str().to_string()),
            mood_energy: m.mood_energy.clone(),
            color_palette: m.color_palette.clone(),
            notes: m.notes.clone(),
            activity_tags: Some(m.activity_tags.iter().map(|t| t.as_str().to_string()).collect()),
        }
    }
}

/// Models sometimes answer `4.0` or `"4"` for a score.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(i))
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(Some(f as i64)),
                    _ => Err(D::Error::custom(format!("expected an integer score, got {}", n))),
                }
            }
        }
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected an integer score, got {:?}", s))),
        Some(other) => Err(D::Error::custom(format!("expected an integer score, got {}", other))),
    }
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b)),
        Some(serde_json::Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Ok(Some(true)),
            "false" | "no" => Ok(Some(false)),
            "" | "unclear" | "unknown" => Ok(None),
            _ => Err(D::Error::custom(format!("expected a boolean, got {:?}", s))),
        },
        Some(other) => Err(D::Error::custom(format!("expected a boolean, got {}", other))),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_text(
    field: &'static str,
    value: &Option<String>,
    issues: &mut Vec<ValidationIssue>,
) -> String {
    match non_empty(value) {
        Some(s) => s,
        None => {
            issues.push(ValidationIssue::MissingField { field });
            String::new()
        }
    }
}

fn required_score(
    field: &'static str,
    value: Option<i64>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Score> {
    match value {
        None => {
            issues.push(ValidationIssue::MissingField { field });
            None
        }
        Some(v) => {
            let score = Score::new(v);
            if score.is_none() {
                issues.push(ValidationIssue::OutOfRange { field, value: v });
            }
            score
        }
    }
}

fn optional_enum<T>(
    field: &'static str,
    value: &Option<String>,
    parse: fn(&str) -> Option<T>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<T> {
    let raw = non_empty(value)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        issues.push(ValidationIssue::UnknownEnum { field, value: raw });
    }
    parsed
}

/// Check a raw analysis. Unknown tags are silently dropped.
pub fn validate(raw: &RawAnalysis) -> Result<ExtractedMetadata, ValidationError> {
    let mut issues = Vec::new();

    let primary_subject = required_text("primary_subject", &raw.primary_subject, &mut issues);
    let visual_quality = required_score("visual_quality", raw.visual_quality, &mut issues);
    let social_media_score =
        required_score("social_media_score", raw.social_media_score, &mut issues);
    let social_media_reason =
        required_text("social_media_reason", &raw.social_media_reason, &mut issues);
    let marketing_score = required_score("marketing_score", raw.marketing_score, &mut issues);
    let marketing_use = required_text("marketing_use", &raw.marketing_use, &mut issues);

    let people_count = optional_enum("people_count", &raw.people_count, PeopleCount::from_str, &mut issues);
    let season = optional_enum("season", &raw.season, Season::from_str, &mut issues);
    let time_of_day = optional_enum("time_of_day", &raw.time_of_day, TimeOfDay::from_str, &mut issues);

    let raw_tags = raw.activity_tags.clone().unwrap_or_default();
    let activity_tags = ActivityTag::parse_known(&raw_tags);
    if activity_tags.len() < raw_tags.len() {
        tracing::debug!(
            reported = ?raw_tags,
            kept = activity_tags.len(),
            "Dropped activity tags outside the vocabulary"
        );
    }

    match (visual_quality, social_media_score, marketing_score) {
        (Some(visual_quality), Some(social_media_score), Some(marketing_score))
            if issues.is_empty() =>
        {
            Ok(ExtractedMetadata {
                primary_subject,
                visual_quality,
                has_people: raw.has_people,
                // A head count without a people determination is meaningless.
                people_count: raw.has_people.and(people_count),
                is_indoor: raw.is_indoor,
                social_media_score,
                social_media_reason,
                marketing_score,
                marketing_use,
                season,
                time_of_day,
                mood_energy: non_empty(&raw.mood_energy),
                color_palette: non_empty(&raw.color_palette),
                notes: non_empty(&raw.notes),
                activity_tags,
                extracted_at: Utc::now(),
            })
        }
        _ => Err(ValidationError { issues }),
    }
}

/// Strict tag check for human input, where a typo should be reported
/// rather than dropped.
pub fn check_tags<S: AsRef<str>>(raw: &[S]) -> Result<Vec<ActivityTag>, ValidationError> {
    let issues: Vec<ValidationIssue> = raw
        .iter()
        .filter(|s| ActivityTag::from_str(s.as_ref()).is_none())
        .map(|s| ValidationIssue::UnknownEnum {
            field: "activity_tags",
            value: s.as_ref().to_string(),
        })
        .collect();
    if issues.is_empty() {
        Ok(ActivityTag::parse_known(raw))
    } else {
        Err(ValidationError { issues })
    }
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use super::provider::{create_backend, EncodedImage, VisionBackend};
use crate::config::VisionConfig;
use crate::error::AnalysisError;
use crate::model::ActivityTag;
use crate::retry::{RateLimiter, RetryPolicy};
use crate::validation::RawAnalysis;

/// Built-in analysis prompt. `{filename}` and `{file_path}` are substituted.
pub const DEFAULT_PROMPT: &str = r#"Analyze this photo from a community farm and education organisation. Respond with a single JSON object and nothing else:

{
  "primary_subject": "main focus of the image in 1-2 sentences",
  "visual_quality": 1-5,
  "has_people": true or false,
  "people_count": "none" | "1-2" | "3-5" | "6-10" | "10+",
  "is_indoor": true or false,
  "social_media_score": 1-5,
  "social_media_reason": "why it would or would not work on social media",
  "marketing_score": 1-5,
  "marketing_use": "best marketing use for this image",
  "activity_tags": ["zero or more of: gardening, harvesting, education, construction, maintenance, cooking, celebration, children, animals, landscape, tools, produce"],
  "season": "spring" | "summer" | "fall" | "winter" | "unclear",
  "time_of_day": "morning" | "midday" | "evening" | "unclear",
  "mood_energy": "overall feeling of the image",
  "color_palette": "dominant colours",
  "notes": "context inferred from the filename and folder path"
}

Scores are integers where 1 is poor and 5 is excellent. Be critical: most photos are a 2 or 3.

File context:
- Filename: {filename}
- File path: {file_path}"#;

/// A downloaded image decoded, downscaled and re-encoded for a backend call.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub encoded: EncodedImage,
    /// Dimensions of the original, before any resizing.
    pub width: u32,
    pub height: u32,
}

/// Decode `bytes`, resize if either dimension exceeds `max_dimension`, and
/// re-encode as JPEG.
pub fn prepare_image(bytes: &[u8], max_dimension: u32) -> Result<PreparedImage, image::ImageError> {
    let img = image::load_from_memory(bytes)?;

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(
            max_dimension,
            max_dimension,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    rgb.write_with_encoder(encoder)?;

    Ok(PreparedImage {
        encoded: EncodedImage {
            base64: BASE64.encode(buf.into_inner()),
            media_type: "image/jpeg",
        },
        width,
        height,
    })
}

/// Pull the JSON object out of a model answer that may wrap it in a
/// markdown fence or surrounding prose.
pub fn extract_json(content: &str) -> &str {
    let mut trimmed = content.trim();

    if trimmed.starts_with("```") {
        if let Some(start) = trimmed.find('\n') {
            let after_first_line = &trimmed[start + 1..];
            if let Some(end) = after_first_line.rfind("```") {
                trimmed = after_first_line[..end].trim();
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

pub fn parse_response(content: &str) -> Result<RawAnalysis, AnalysisError> {
    let json = extract_json(content);
    serde_json::from_str(json).map_err(|e| {
        let preview: String = content.chars().take(200).collect();
        AnalysisError::MalformedResponse(format!("{} - response was: {}", e, preview))
    })
}

fn median(values: impl Iterator<Item = Option<i64>>) -> Option<i64> {
    let mut present: Vec<i64> = values.flatten().collect();
    if present.is_empty() {
        return None;
    }
    present.sort_unstable();
    // Lower median for even counts, so the result is always a reported value.
    Some(present[(present.len() - 1) / 2])
}

fn majority(values: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let present: Vec<bool> = values.flatten().collect();
    let first = *present.first()?;
    let yes = present.iter().filter(|v| **v).count();
    let no = present.len() - yes;
    Some(match yes.cmp(&no) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => first,
    })
}

/// Most frequent value, ties going to whichever appeared first.
fn mode<'a>(values: impl Iterator<Item = &'a Option<String>>) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for value in values.flatten() {
        let key = value.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        match counts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, n)) => *n += 1,
            None => counts.push((key, 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max()?;
    counts.into_iter().find(|(_, n)| *n == best).map(|(k, _)| k)
}

fn first_text<'a>(values: impl Iterator<Item = &'a Option<String>>) -> Option<String> {
    values
        .flatten()
        .find(|s| !s.trim().is_empty())
        .cloned()
}

/// Merge several analyses of the same image into one.
pub fn consensus(samples: &[RawAnalysis]) -> RawAnalysis {
    if let [only] = samples {
        return only.clone();
    }

    let mut tags: Vec<ActivityTag> = Vec::new();
    for sample in samples {
        for tag in ActivityTag::parse_known(sample.activity_tags.as_deref().unwrap_or_default()) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }

    RawAnalysis {
        primary_subject: first_text(samples.iter().map(|s| &s.primary_subject)),
        visual_quality: median(samples.iter().map(|s| s.visual_quality)),
        has_people: majority(samples.iter().map(|s| s.has_people)),
        people_count: mode(samples.iter().map(|s| &s.people_count)),
        is_indoor: majority(samples.iter().map(|s| s.is_indoor)),
        social_media_score: median(samples.iter().map(|s| s.social_media_score)),
        social_media_reason: first_text(samples.iter().map(|s| &s.social_media_reason)),
        marketing_score: median(samples.iter().map(|s| s.marketing_score)),
        marketing_use: first_text(samples.iter().map(|s| &s.marketing_use)),
        season: mode(samples.iter().map(|s| &s.season)),
        time_of_day: mode(samples.iter().map(|s| &s.time_of_day)),
        mood_energy: first_text(samples.iter().map(|s| &s.mood_energy)),
        color_palette: first_text(samples.iter().map(|s| &s.color_palette)),
        notes: first_text(samples.iter().map(|s| &s.notes)),
        activity_tags: Some(tags.iter().map(|t| t.as_str().to_string()).collect()),
    }
}

/// Vision client that wraps a backend with prompting, retry, rate limiting
/// and optional multi-sample consensus.
#[derive(Clone)]
pub struct VisionClient {
    backend: Arc<dyn VisionBackend>,
    prompt_template: String,
    samples: u32,
    max_image_dimension: u32,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl VisionClient {
    pub fn new(backend: Arc<dyn VisionBackend>, config: &VisionConfig, retry: RetryPolicy) -> Self {
        Self {
            backend,
            prompt_template: config
                .prompt_template
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            samples: config.samples.max(1),
            max_image_dimension: config.max_image_dimension,
            retry,
            limiter: Arc::new(RateLimiter::new(Duration::from_millis(config.min_interval_ms))),
        }
    }

    /// Create a new VisionClient from configuration
    pub fn from_config(config: &VisionConfig, retry: RetryPolicy) -> Self {
        Self::new(Arc::from(create_backend(config)), config, retry)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn max_image_dimension(&self) -> u32 {
        self.max_image_dimension
    }

    pub fn build_prompt(&self, filename: &str, file_path: &str) -> String {
        self.prompt_template
            .replace("{filename}", filename)
            .replace("{file_path}", file_path)
    }

    fn call(&self, image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
        self.retry.run(
            self.backend.backend_name(),
            |_| {
                self.limiter.acquire();
                self.backend.analyze(image, prompt)
            },
            AnalysisError::is_retryable,
        )
    }

    /// Analyse one image. With more than one sample configured, every
    /// successful sample is merged; the call fails only if all samples fail,
    /// in which case the first error is returned. A rejected request ends
    /// sampling.
    pub fn analyze(
        &self,
        image: &EncodedImage,
        filename: &str,
        file_path: &str,
    ) -> Result<RawAnalysis, AnalysisError> {
        let prompt = self.build_prompt(filename, file_path);

        let mut successes = Vec::new();
        let mut first_error = None;
        for sample in 1..=self.samples {
            match self.call(image, &prompt).and_then(|text| parse_response(&text)) {
                Ok(raw) => successes.push(raw),
                Err(e) => {
                    tracing::debug!(filename, sample, error = %e, "Vision sample failed");
                    let rejected = matches!(e, AnalysisError::Rejected(_));
                    first_error.get_or_insert(e);
                    if rejected {
                        break;
                    }
                }
            }
        }

        if successes.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                AnalysisError::Unavailable("no samples were taken".to_string())
            }));
        }
        Ok(consensus(&successes))
    }

    /// Send a tiny generated image and return the raw answer.
    pub fn probe(&self) -> Result<String, AnalysisError> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(32, 32, image::Rgb([90, 140, 60])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png)
            .map_err(|e| AnalysisError::Rejected(format!("could not build probe image: {}", e)))?;
        let prepared = prepare_image(buf.get_ref(), self.max_image_dimension)
            .map_err(|e| AnalysisError::Rejected(format!("could not encode probe image: {}", e)))?;
        self.call(&prepared.encoded, &self.build_prompt("probe.png", "probe/probe.png"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned answers in order.
    struct Scripted {
        answers: Mutex<Vec<Result<String, AnalysisError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<String, AnalysisError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    impl VisionBackend for Scripted {
        fn analyze(&self, _image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(AnalysisError::Unavailable("script exhausted".into())))
        }

        fn backend_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn image() -> EncodedImage {
        EncodedImage {
            base64: "AAAA".into(),
            media_type: "image/jpeg",
        }
    }

    fn answer(quality: i64, people: bool, tags: &[&str]) -> Result<String, AnalysisError> {
        Ok(serde_json::json!({
            "primary_subject": "beds",
            "visual_quality": quality,
            "has_people": people,
            "social_media_score": quality,
            "social_media_reason": "ok",
            "marketing_score": quality,
            "marketing_use": "flyer",
            "season": "summer",
            "activity_tags": tags,
        })
        .to_string())
    }

    fn no_wait_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Here you go: {\"a\": 1} hope it helps"), "{\"a\": 1}");
        assert_eq!(extract_json("  {\"a\": {\"b\": 2}}  "), "{\"a\": {\"b\": 2}}");
        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn test_parse_response_rejects_wrong_types() {
        assert!(parse_response("{\"visual_quality\": 4}").is_ok());
        assert!(matches!(
            parse_response("{\"visual_quality\": {\"nested\": true}}"),
            Err(AnalysisError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response("I cannot help with that."),
            Err(AnalysisError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_prompt_substitution() {
        let backend = Scripted::new(vec![answer(3, false, &[])]);
        let mut config = VisionConfig::default();
        config.prompt_template = Some("Look at {filename} in {file_path}".into());
        let client = VisionClient::new(backend.clone(), &config, no_wait_retry(1));

        client.analyze(&image(), "a.jpg", "Farm/a.jpg").unwrap();
        assert_eq!(backend.prompts.lock().unwrap()[0], "Look at a.jpg in Farm/a.jpg");
    }

    #[test]
    fn test_retries_unavailable_but_not_rejected() {
        let backend = Scripted::new(vec![
            Err(AnalysisError::Unavailable("timeout".into())),
            answer(4, true, &["gardening"]),
        ]);
        let client = VisionClient::new(backend.clone(), &VisionConfig::default(), no_wait_retry(3));
        assert_eq!(client.analyze(&image(), "a.jpg", "a.jpg").unwrap().visual_quality, Some(4));
        assert_eq!(backend.prompts.lock().unwrap().len(), 2);

        let backend = Scripted::new(vec![
            Err(AnalysisError::Rejected("quota".into())),
            answer(4, true, &[]),
        ]);
        let client = VisionClient::new(backend.clone(), &VisionConfig::default(), no_wait_retry(3));
        assert!(matches!(
            client.analyze(&image(), "a.jpg", "a.jpg"),
            Err(AnalysisError::Rejected(_))
        ));
        assert_eq!(backend.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_consensus_merges_samples() {
        let backend = Scripted::new(vec![
            answer(2, true, &["gardening"]),
            answer(5, false, &["tools", "made-up"]),
            answer(4, true, &["gardening", "produce"]),
        ]);
        let mut config = VisionConfig::default();
        config.samples = 3;
        let client = VisionClient::new(backend, &config, no_wait_retry(1));

        let merged = client.analyze(&image(), "a.jpg", "a.jpg").unwrap();
        assert_eq!(merged.visual_quality, Some(4));
        assert_eq!(merged.has_people, Some(true));
        assert_eq!(merged.season.as_deref(), Some("summer"));
        assert_eq!(
            merged.activity_tags,
            Some(vec!["gardening".to_string(), "tools".to_string(), "produce".to_string()])
        );
    }

    #[test]
    fn test_consensus_survives_partial_failure() {
        let backend = Scripted::new(vec![
            Err(AnalysisError::MalformedResponse("junk".into())),
            answer(3, false, &[]),
        ]);
        let mut config = VisionConfig::default();
        config.samples = 2;
        let client = VisionClient::new(backend, &config, no_wait_retry(1));
        assert_eq!(client.analyze(&image(), "a.jpg", "a.jpg").unwrap().visual_quality, Some(3));

        let backend = Scripted::new(vec![
            Err(AnalysisError::MalformedResponse("junk".into())),
            Err(AnalysisError::Unavailable("down".into())),
        ]);
        let client = VisionClient::new(backend, &config, no_wait_retry(1));
        assert!(matches!(
            client.analyze(&image(), "a.jpg", "a.jpg"),
            Err(AnalysisError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_rejection_stops_sampling() {
        let backend = Scripted::new(vec![
            answer(4, true, &[]),
            Err(AnalysisError::Rejected("quota exceeded".into())),
            answer(2, false, &[]),
            answer(2, false, &[]),
        ]);
        let mut config = VisionConfig::default();
        config.samples = 4;
        let client = VisionClient::new(backend.clone(), &config, no_wait_retry(1));

        let merged = client.analyze(&image(), "a.jpg", "a.jpg").unwrap();
        assert_eq!(merged.visual_quality, Some(4));
        assert_eq!(backend.prompts.lock().unwrap().len(), 2);

        let backend = Scripted::new(vec![
            Err(AnalysisError::Rejected("invalid key".into())),
            answer(3, false, &[]),
        ]);
        let client = VisionClient::new(backend.clone(), &config, no_wait_retry(1));
        assert!(matches!(
            client.analyze(&image(), "a.jpg", "a.jpg"),
            Err(AnalysisError::Rejected(_))
        ));
        assert_eq!(backend.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_majority_tie_goes_to_first() {
        assert_eq!(majority([Some(false), Some(true)].into_iter()), Some(false));
        assert_eq!(majority([None, None].into_iter()), None);
        assert_eq!(median([Some(2), Some(4)].into_iter()), Some(2));
    }

    #[test]
    fn test_prepare_image_downscales() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::new(2000, 1000));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();

        let prepared = prepare_image(buf.get_ref(), 1024).unwrap();
        assert_eq!((prepared.width, prepared.height), (2000, 1000));
        assert_eq!(prepared.encoded.media_type, "image/jpeg");

        let jpeg = BASE64.decode(&prepared.encoded.base64).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 512));

        assert!(prepare_image(b"not an image", 1024).is_err());
    }
}

//! Google Drive v3 over plain REST.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

use super::{RemoteEntry, RemoteSource};
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::retry::RateLimiter;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,modifiedTime";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    /// Drive reports sizes as decimal strings; folders have none.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn convert_file(file: DriveFile) -> RemoteEntry {
    let is_folder = file.mime_type.as_deref() == Some(FOLDER_MIME);
    RemoteEntry {
        size: file.size.as_deref().and_then(|s| s.parse().ok()),
        created: parse_time(file.created_time.as_deref()),
        modified: parse_time(file.modified_time.as_deref()),
        id: file.id,
        name: file.name,
        mime_type: file.mime_type,
        is_folder,
    }
}

/// Map an HTTP status from the Drive API onto the source error taxonomy.
/// Drive signals quota exhaustion with 403 plus a rate-limit reason.
fn classify_status(code: u16, body: &str, context: &str) -> SourceError {
    let detail = format!("{} (HTTP {}): {}", context, code, body.trim());
    match code {
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            SourceError::Transient(detail)
        }
        401 | 403 => SourceError::Permission(detail),
        404 => SourceError::NotFound(detail),
        408 | 429 | 500..=599 => SourceError::Transient(detail),
        _ => SourceError::Other(detail),
    }
}

fn map_error(err: ureq::Error, context: &str) -> SourceError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(code, &body, context)
        }
        ureq::Error::Transport(t) => SourceError::Transient(format!("{}: {}", context, t)),
    }
}

pub struct GoogleDriveSource {
    agent: ureq::Agent,
    api_base: String,
    access_token: String,
    page_size: u32,
    limiter: RateLimiter,
}

impl GoogleDriveSource {
    pub fn new(config: &SourceConfig, access_token: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();

        Self {
            agent,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            page_size: config.page_size.clamp(1, 1000),
            limiter: RateLimiter::new(Duration::from_millis(config.rate_limit_delay_ms)),
        }
    }

    fn get(&self, path: &str) -> ureq::Request {
        self.limiter.acquire();
        self.agent
            .get(&format!("{}/{}", self.api_base, path))
            .set("Authorization", &format!("Bearer {}", self.access_token))
            .query("supportsAllDrives", "true")
    }
}

impl RemoteSource for GoogleDriveSource {
    fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, SourceError> {
        let query = format!("'{}' in parents and trashed = false", folder_id.replace('\'', "\\'"));
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let page_size = self.page_size.to_string();
        let context = format!("listing folder {}", folder_id);

        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .get("files")
                .query("q", &query)
                .query("fields", &fields)
                .query("pageSize", &page_size)
                .query("includeItemsFromAllDrives", "true")
                .set("Accept", "application/json");
            if let Some(ref token) = page_token {
                request = request.query("pageToken", token);
            }

            let response = request.call().map_err(|e| map_error(e, &context))?;
            let page: FilesListResponse = response
                .into_json()
                .map_err(|e| SourceError::Transient(format!("{}: unreadable response: {}", context, e)))?;

            entries.extend(page.files.into_iter().map(convert_file));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(folder_id, entries = entries.len(), "Listed Drive folder");
        Ok(entries)
    }

    fn get_metadata(&self, file_id: &str) -> Result<RemoteEntry, SourceError> {
        let context = format!("metadata for {}", file_id);
        let response = self
            .get(&format!("files/{}", file_id))
            .query("fields", FILE_FIELDS)
            .call()
            .map_err(|e| map_error(e, &context))?;
        let file: DriveFile = response
            .into_json()
            .map_err(|e| SourceError::Transient(format!("{}: unreadable response: {}", context, e)))?;
        Ok(convert_file(file))
    }

    fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError> {
        let context = format!("downloading {}", file_id);
        let response = self
            .get(&format!("files/{}", file_id))
            .query("alt", "media")
            .call()
            .map_err(|e| map_error(e, &context))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| SourceError::Transient(format!("{}: {}", context, e)))?;

        tracing::debug!(file_id, bytes = bytes.len(), "Downloaded file");
        Ok(bytes)
    }

    fn source_name(&self) -> &'static str {
        "Google Drive"
    }
}

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoindex")
        .join("photoindex.db")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    GoogleDrive,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Folder ids (Drive) or relative folder paths (local) to walk.
    #[serde(default)]
    pub root_folders: Vec<String>,

    /// Drive OAuth access token. Falls back to `GOOGLE_DRIVE_ACCESS_TOKEN`.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_drive_api_base")]
    pub api_base: String,

    /// Minimum spacing between Drive API calls.
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,

    /// Root directory for the `local` source kind.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

fn default_drive_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_rate_limit_delay_ms() -> u64 {
    1000
}

fn default_page_size() -> u32 {
    100
}

fn default_source_timeout_secs() -> u64 {
    60
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            root_folders: Vec::new(),
            access_token: None,
            api_base: default_drive_api_base(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            page_size: default_page_size(),
            timeout_secs: default_source_timeout_secs(),
            local_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default)]
    pub include_video: bool,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            include_video: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VisionProviderType {
    #[default]
    LmStudio,
    OpenAI,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default)]
    pub provider: VisionProviderType,

    #[serde(default = "default_vision_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_vision_model")]
    pub model: String,

    /// Falls back to `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` for cloud providers.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_vision_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the built-in prompt. `{filename}` and `{file_path}` are substituted.
    #[serde(default)]
    pub prompt_template: Option<String>,

    /// Number of independent analyses merged per file. 1 disables consensus.
    #[serde(default = "default_samples")]
    pub samples: u32,

    /// Minimum spacing between backend calls.
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Longest image edge sent to the backend.
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
}

fn default_vision_endpoint() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_vision_model() -> String {
    "gemma-3-4b-it-qat".to_string()
}

fn default_temperature() -> f32 {
    0.4
}

fn default_max_tokens() -> u32 {
    500
}

fn default_vision_timeout_secs() -> u64 {
    120
}

fn default_samples() -> u32 {
    1
}

fn default_max_image_dimension() -> u32 {
    1024
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            provider: VisionProviderType::default(),
            endpoint: default_vision_endpoint(),
            model: default_vision_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_vision_timeout_secs(),
            prompt_template: None,
            samples: default_samples(),
            min_interval_ms: 0,
            max_image_dimension: default_max_image_dimension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Failed attempts after which a file is left for manual retry. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// `in_progress` leases older than this are handed back to `pending`.
    #[serde(default = "default_stale_lease_secs")]
    pub stale_lease_secs: u64,

    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_stale_lease_secs() -> u64 {
    30 * 60
}

fn default_max_file_size_mb() -> u64 {
    50
}

impl ProcessingConfig {
    /// Lease age past which a file counts as abandoned. `None` when the
    /// configured value does not fit a timestamp offset.
    pub fn stale_lease_age(&self) -> Option<chrono::Duration> {
        i64::try_from(self.stale_lease_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    /// Leases taken before this instant are stale.
    pub fn stale_lease_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.stale_lease_age().and_then(|age| now.checked_sub_signed(age))
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: None,
            stale_lease_secs: default_stale_lease_secs(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files. Unset logs to stderr only.
    #[serde(default)]
    pub file_dir: Option<PathBuf>,

    /// Also send events to systemd-journald (Linux only).
    #[serde(default)]
    pub journald: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoryConfig {
    /// Metadata versions kept per file. Unset keeps every version.
    #[serde(default)]
    pub max_versions: Option<usize>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config.with_env_secrets())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config.with_env_secrets())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOINDEX_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photoindex")
    }

    fn with_env_secrets(mut self) -> Self {
        if self.source.access_token.is_none() {
            self.source.access_token = std::env::var("GOOGLE_DRIVE_ACCESS_TOKEN").ok();
        }
        if self.vision.api_key.is_none() {
            let var = match self.vision.provider {
                VisionProviderType::Anthropic => Some("ANTHROPIC_API_KEY"),
                VisionProviderType::OpenAI => Some("OPENAI_API_KEY"),
                _ => None,
            };
            if let Some(var) = var {
                self.vision.api_key = std::env::var(var).ok();
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vision.temperature) {
            bail!("vision.temperature must be between 0 and 1");
        }
        if self.vision.max_tokens == 0 {
            bail!("vision.max_tokens must be positive");
        }
        if self.vision.samples == 0 {
            bail!("vision.samples must be at least 1");
        }
        if self.processing.concurrency == 0 {
            bail!("processing.concurrency must be positive");
        }
        if self.processing.max_file_size_mb == 0 {
            bail!("processing.max_file_size_mb must be positive");
        }
        if self.processing.stale_lease_secs == 0 {
            bail!("processing.stale_lease_secs must be positive");
        }
        if self.processing.stale_lease_cutoff(Utc::now()).is_none() {
            bail!(
                "processing.stale_lease_secs={} is too large",
                self.processing.stale_lease_secs
            );
        }
        if self.processing.max_attempts == Some(0) {
            bail!("processing.max_attempts must be positive when set");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.source.kind == SourceKind::GoogleDrive && self.source.root_folders.is_empty() {
            bail!("source.root_folders must name at least one Drive folder");
        }
        if self.source.kind == SourceKind::Local && self.source.local_root.is_none() {
            bail!("source.local_root is required for the local source");
        }
        Ok(())
    }
}

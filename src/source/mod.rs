//! Remote file stores the pipeline can walk and download from.

pub mod drive;
pub mod local;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::config::{SourceConfig, SourceKind};
use crate::error::SourceError;

pub use drive::GoogleDriveSource;
pub use local::LocalFolderSource;

/// A file or folder as reported by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub is_folder: bool,
}

/// A hierarchical store of files addressed by opaque ids.
pub trait RemoteSource: Send + Sync {
    /// Direct children of a folder. Trashed items are not returned.
    fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, SourceError>;

    fn get_metadata(&self, file_id: &str) -> Result<RemoteEntry, SourceError>;

    /// Full contents of a file.
    fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError>;

    fn source_name(&self) -> &'static str;
}

/// Build the source described by the configuration.
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn RemoteSource>> {
    match config.kind {
        SourceKind::GoogleDrive => {
            let token = config.access_token.as_deref().ok_or_else(|| {
                anyhow!("no Drive access token: set source.access_token or GOOGLE_DRIVE_ACCESS_TOKEN")
            })?;
            Ok(Box::new(GoogleDriveSource::new(config, token)))
        }
        SourceKind::Local => {
            let root = config
                .local_root
                .as_ref()
                .ok_or_else(|| anyhow!("source.local_root is required for the local source"))?;
            Ok(Box::new(LocalFolderSource::new(root)))
        }
    }
}

//! A local directory tree served through the same interface as a remote
//! store. Ids are `/`-separated paths relative to the root; the root itself
//! is the empty id.

use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{RemoteEntry, RemoteSource};
use crate::error::SourceError;
use crate::scanner::mime_for_path;

pub struct LocalFolderSource {
    root: PathBuf,
}

fn io_error(err: &std::io::Error, context: String) -> SourceError {
    match err.kind() {
        ErrorKind::PermissionDenied => SourceError::Permission(context),
        ErrorKind::NotFound => SourceError::NotFound(context),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            SourceError::Transient(context)
        }
        _ => SourceError::Other(context),
    }
}

impl LocalFolderSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SourceError::NotFound(format!("{:?} is outside the source root", id)));
        }
        Ok(self.root.join(relative))
    }

    fn id_for(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn entry_for(&self, path: &Path) -> Result<RemoteEntry, SourceError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| io_error(&e, format!("{}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string());

        Ok(RemoteEntry {
            id: self.id_for(path),
            name,
            mime_type: if meta.is_dir() {
                None
            } else {
                mime_for_path(path).map(str::to_string)
            },
            size: if meta.is_dir() { None } else { Some(meta.len() as i64) },
            created: meta.created().ok().map(DateTime::<Utc>::from),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            is_folder: meta.is_dir(),
        })
    }
}

impl RemoteSource for LocalFolderSource {
    fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, SourceError> {
        let dir = self.resolve(folder_id)?;
        if !dir.is_dir() {
            return Err(SourceError::NotFound(format!("{} is not a directory", dir.display())));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let context = format!("{}: {}", dir.display(), e);
                match e.io_error() {
                    Some(io) => io_error(io, context),
                    None => SourceError::Other(context),
                }
            })?;
            entries.push(self.entry_for(entry.path())?);
        }
        Ok(entries)
    }

    fn get_metadata(&self, file_id: &str) -> Result<RemoteEntry, SourceError> {
        let path = self.resolve(file_id)?;
        self.entry_for(&path)
    }

    fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(file_id)?;
        std::fs::read(&path).map_err(|e| io_error(&e, format!("{}: {}", path.display(), e)))
    }

    fn source_name(&self) -> &'static str {
        "local folder"
    }
}

pub mod discovery;

use std::collections::HashSet;
use std::sync::mpsc;

use crate::config::DiscoveryConfig;
use crate::db::Database;
use crate::error::{SourceError, StoreResult};
use crate::model::DiscoveredFile;
use crate::retry::RetryPolicy;
use crate::source::RemoteSource;

pub use discovery::{classify, mime_for_extension, mime_for_path, MediaKind};

#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { roots: usize },
    Folder { path: String, entries: usize },
    Unreadable { path: String, reason: String },
    Completed { new: usize, known: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableFolder {
    pub folder_id: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Rows created by this run.
    pub new_files: usize,
    /// Media files that already had a row; their attributes were refreshed.
    pub already_known: usize,
    /// Files outside the media set.
    pub skipped: usize,
    pub unreadable: Vec<UnreadableFolder>,
}

/// Walks remote folders and records every media file in the store.
pub struct Scanner<'a> {
    source: &'a dyn RemoteSource,
    db: &'a Database,
    config: DiscoveryConfig,
    retry: RetryPolicy,
}

impl<'a> Scanner<'a> {
    pub fn new(
        source: &'a dyn RemoteSource,
        db: &'a Database,
        config: &DiscoveryConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            db,
            config: config.clone(),
            retry,
        }
    }

    fn root_path(&self, root_id: &str) -> String {
        match self
            .retry
            .run("root metadata", |_| self.source.get_metadata(root_id), SourceError::is_transient)
        {
            Ok(entry) if !entry.name.is_empty() => entry.name,
            _ => root_id.to_string(),
        }
    }

    /// Walk `roots` depth-first. Unreadable folders are logged and listed in
    /// the report; only store failures abort the walk. With `limit`, stops
    /// once that many new files have been recorded.
    pub fn discover(
        &self,
        roots: &[String],
        limit: Option<usize>,
        progress_tx: Option<mpsc::Sender<ScanProgress>>,
    ) -> StoreResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, String)> = roots
            .iter()
            .rev()
            .map(|id| (id.clone(), self.root_path(id)))
            .collect();

        if let Some(ref tx) = progress_tx {
            let _ = tx.send(ScanProgress::Started { roots: roots.len() });
        }
        tracing::info!(source = self.source.source_name(), roots = roots.len(), "Starting discovery");

        'walk: while let Some((folder_id, path)) = stack.pop() {
            // Drive folders can have several parents.
            if !visited.insert(folder_id.clone()) {
                continue;
            }

            let entries = match self.retry.run(
                "list folder",
                |_| self.source.list(&folder_id),
                SourceError::is_transient,
            ) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(folder_id = %folder_id, path = %path, error = %e, "Skipping unreadable folder");
                    if let Some(ref tx) = progress_tx {
                        let _ = tx.send(ScanProgress::Unreadable {
                            path: path.clone(),
                            reason: e.to_string(),
                        });
                    }
                    report.unreadable.push(UnreadableFolder {
                        folder_id,
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(ref tx) = progress_tx {
                let _ = tx.send(ScanProgress::Folder {
                    path: path.clone(),
                    entries: entries.len(),
                });
            }

            let mut subfolders = Vec::new();
            for entry in entries {
                let entry_path = format!("{}/{}", path, entry.name);
                if entry.is_folder {
                    subfolders.push((entry.id, entry_path));
                    continue;
                }

                let Some((_, mime)) = classify(&entry.name, entry.mime_type.as_deref(), &self.config)
                else {
                    report.skipped += 1;
                    continue;
                };

                if limit.is_some_and(|l| report.new_files >= l) {
                    tracing::info!(limit = ?limit, "Discovery limit reached");
                    break 'walk;
                }

                let outcome = self.db.upsert_discovered(&DiscoveredFile {
                    remote_id: entry.id,
                    filename: entry.name,
                    file_path: entry_path,
                    file_size: entry.size,
                    mime_type: Some(mime),
                    created_date: entry.created,
                    modified_date: entry.modified,
                })?;

                if outcome.is_new() {
                    report.new_files += 1;
                } else {
                    report.already_known += 1;
                }
            }

            // Reversed so folders are visited in listing order.
            stack.extend(subfolders.into_iter().rev());
        }

        if let Some(ref tx) = progress_tx {
            let _ = tx.send(ScanProgress::Completed {
                new: report.new_files,
                known: report.already_known,
            });
        }
        tracing::info!(
            new = report.new_files,
            known = report.already_known,
            skipped = report.skipped,
            unreadable = report.unreadable.len(),
            "Discovery finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RemoteEntry;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        folders: HashMap<String, Result<Vec<RemoteEntry>, SourceError>>,
        list_calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_folder(mut self, id: &str, entries: Vec<RemoteEntry>) -> Self {
            self.folders.insert(id.to_string(), Ok(entries));
            self
        }

        fn with_failure(mut self, id: &str, err: SourceError) -> Self {
            self.folders.insert(id.to_string(), Err(err));
            self
        }
    }

    impl RemoteSource for FakeSource {
        fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, SourceError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.folders
                .get(folder_id)
                .cloned()
                .unwrap_or_else(|| Err(SourceError::NotFound(folder_id.to_string())))
        }

        fn get_metadata(&self, file_id: &str) -> Result<RemoteEntry, SourceError> {
            Ok(folder(file_id, &file_id.to_uppercase()))
        }

        fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError> {
            Err(SourceError::NotFound(file_id.to_string()))
        }

        fn source_name(&self) -> &'static str {
            "fake"
        }
    }

    fn file(id: &str, name: &str, mime: Option<&str>) -> RemoteEntry {
        RemoteEntry {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: mime.map(str::to_string),
            size: Some(100),
            created: None,
            modified: None,
            is_folder: false,
        }
    }

    fn folder(id: &str, name: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: Some("application/vnd.google-apps.folder".to_string()),
            size: None,
            created: None,
            modified: None,
            is_folder: true,
        }
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_walks_nested_folders_and_skips_unreadable() {
        let source = FakeSource::default()
            .with_folder(
                "root",
                vec![
                    file("a", "a.jpg", Some("image/jpeg")),
                    folder("sub", "Sub"),
                    folder("locked", "Locked"),
                    file("doc", "notes.pdf", Some("application/pdf")),
                ],
            )
            .with_folder("sub", vec![file("b", "b.png", None)])
            .with_failure("locked", SourceError::Permission("403".into()));
        let db = test_db();
        let scanner = Scanner::new(&source, &db, &DiscoveryConfig::default(), RetryPolicy::none());

        let (tx, rx) = mpsc::channel();
        let report = scanner.discover(&["root".to_string()], None, Some(tx)).unwrap();

        assert_eq!(report.new_files, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.unreadable.len(), 1);
        assert_eq!(report.unreadable[0].folder_id, "locked");
        assert_eq!(report.unreadable[0].path, "ROOT/Locked");

        let b = db.get_file_by_remote_id("b").unwrap().unwrap();
        assert_eq!(b.file_path, "ROOT/Sub/b.png");
        assert_eq!(b.mime_type.as_deref(), Some("image/png"));

        let events: Vec<ScanProgress> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(ScanProgress::Completed { new: 2, known: 0 })));
    }

    #[test]
    fn test_rediscovery_is_idempotent() {
        let source = FakeSource::default().with_folder(
            "root",
            vec![file("a", "a.jpg", Some("image/jpeg")), file("b", "b.jpg", Some("image/jpeg"))],
        );
        let db = test_db();
        let scanner = Scanner::new(&source, &db, &DiscoveryConfig::default(), RetryPolicy::none());

        let first = scanner.discover(&["root".to_string()], None, None).unwrap();
        let second = scanner.discover(&["root".to_string()], None, None).unwrap();

        assert_eq!(first.new_files, 2);
        assert_eq!(second.new_files, 0);
        assert_eq!(second.already_known, 2);
        assert_eq!(db.stats().unwrap().total, 2);
    }

    #[test]
    fn test_limit_and_cycles() {
        let source = FakeSource::default()
            .with_folder(
                "root",
                vec![
                    folder("loop", "Loop"),
                    file("a", "a.jpg", Some("image/jpeg")),
                    file("b", "b.jpg", Some("image/jpeg")),
                    file("c", "c.jpg", Some("image/jpeg")),
                ],
            )
            .with_folder("loop", vec![folder("root", "Back")]);
        let db = test_db();
        let scanner = Scanner::new(&source, &db, &DiscoveryConfig::default(), RetryPolicy::none());

        let report = scanner.discover(&["root".to_string()], Some(2), None).unwrap();
        assert_eq!(report.new_files, 2);
        assert_eq!(db.stats().unwrap().total, 2);

        let report = scanner.discover(&["root".to_string()], None, None).unwrap();
        assert_eq!(report.new_files, 1);
        assert_eq!(report.already_known, 2);
    }
}

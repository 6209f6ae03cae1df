use chrono::Utc;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use thiserror::Error;

use super::{TaskProgress, TaskUpdate};
use crate::config::ProcessingConfig;
use crate::db::{Claim, Database, ReprocessFilter, ReprocessMode};
use crate::error::{AnalysisError, SourceError, StoreError, StoreResult, ValidationError};
use crate::llm::{prepare_image, VisionClient};
use crate::model::{ExtractedMetadata, MediaFile};
use crate::retry::RetryPolicy;
use crate::source::RemoteSource;
use crate::validation::validate;

/// Summary of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Files this run claimed and started an attempt on.
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending files that are not images and are never dispatched.
    pub skipped: usize,
    pub cancelled: bool,
    pub last_completed_file_id: Option<i64>,
    /// Stale leases handed back to `pending` before the run.
    pub reclaimed: usize,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("state store failed after {} files completed: {source}", .report.completed)]
    Store {
        #[source]
        source: StoreError,
        report: BatchReport,
    },

    #[error("could not start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("no file with remote id {0}")]
    UnknownFile(String),
}

impl BatchError {
    fn store(source: StoreError, report: BatchReport) -> Self {
        BatchError::Store { source, report }
    }

    /// Progress made before the failure, when there was any.
    pub fn report(&self) -> Option<&BatchReport> {
        match self {
            BatchError::Store { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl From<StoreError> for BatchError {
    fn from(source: StoreError) -> Self {
        BatchError::store(source, BatchReport::default())
    }
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Completed,
    Failed { kind: &'static str, message: String },
    /// The lease was reclaimed before the result could be written.
    LeaseLost,
    /// Another worker holds the file, or it is not `pending`/`failed`.
    NotClaimed,
    NotAnImage,
}

impl FileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FileOutcome::Completed => "completed",
            FileOutcome::Failed { .. } => "failed",
            FileOutcome::LeaseLost => "lease lost",
            FileOutcome::NotClaimed => "not claimed",
            FileOutcome::NotAnImage => "not an image",
        }
    }
}

/// Reasons a single attempt fails. None of them stop the batch.
#[derive(Debug, Error)]
enum FileError {
    #[error("download failed: {0}")]
    Source(#[from] SourceError),

    #[error("file is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl FileError {
    fn kind(&self) -> &'static str {
        match self {
            FileError::Source(_) => "source",
            FileError::TooLarge { .. } => "too_large",
            FileError::Decode(_) => "decode",
            FileError::Analysis(AnalysisError::Unavailable(_)) => "unavailable",
            FileError::Analysis(AnalysisError::Rejected(_)) => "rejected",
            FileError::Analysis(AnalysisError::MalformedResponse(_)) => "malformed_response",
            FileError::Validation(_) => "validation",
        }
    }
}

struct Analyzed {
    metadata: ExtractedMetadata,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct Counters {
    attempted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    done: AtomicUsize,
    cancelled: AtomicBool,
    last_completed: Mutex<Option<i64>>,
}

impl Counters {
    fn report(&self, skipped: usize, reclaimed: usize) -> BatchReport {
        BatchReport {
            attempted: self.attempted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped,
            cancelled: self.cancelled.load(Ordering::SeqCst),
            last_completed_file_id: self.last_completed.lock().ok().and_then(|g| *g),
            reclaimed,
        }
    }

    fn record(&self, file_id: i64, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Completed => {
                self.attempted.fetch_add(1, Ordering::SeqCst);
                self.completed.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut last) = self.last_completed.lock() {
                    *last = Some(file_id);
                }
            }
            FileOutcome::Failed { .. } | FileOutcome::LeaseLost => {
                self.attempted.fetch_add(1, Ordering::SeqCst);
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            FileOutcome::NotClaimed | FileOutcome::NotAnImage => {}
        }
    }
}

/// Drives pending files through download, analysis, validation and the
/// final transactional write, several at a time.
pub struct BatchRunner {
    db: Arc<Database>,
    source: Arc<dyn RemoteSource>,
    vision: VisionClient,
    config: ProcessingConfig,
    retry: RetryPolicy,
}

impl BatchRunner {
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn RemoteSource>,
        vision: VisionClient,
        config: &ProcessingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            source,
            vision,
            config: config.clone(),
            retry,
        }
    }

    fn max_file_bytes(&self) -> u64 {
        self.config.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Process up to `limit` pending or failed image files. Stale leases are
    /// reclaimed first. Cancellation is checked before each file is claimed;
    /// files already in flight finish their attempt.
    pub fn run_batch(
        &self,
        limit: Option<usize>,
        progress_tx: Option<mpsc::Sender<TaskUpdate>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<BatchReport, BatchError> {
        let reclaimed = self.reclaim()?;
        let candidates = self
            .db
            .select_candidates(limit, self.config.max_attempts)
            .map_err(|e| BatchError::store(e, BatchReport { reclaimed, ..Default::default() }))?;
        self.dispatch(candidates, reclaimed, progress_tx, cancel_flag)
    }

    /// Hand in-flight files whose lease has aged out back to `pending`.
    fn reclaim(&self) -> StoreResult<usize> {
        match self.config.stale_lease_cutoff(Utc::now()) {
            Some(cutoff) => self.db.reclaim_stale_leases(cutoff),
            None => {
                tracing::warn!(
                    stale_lease_secs = self.config.stale_lease_secs,
                    "Stale lease age out of range, nothing reclaimed"
                );
                Ok(0)
            }
        }
    }

    /// Run the worker pool over `candidates`.
    fn dispatch(
        &self,
        candidates: Vec<MediaFile>,
        reclaimed: usize,
        progress_tx: Option<mpsc::Sender<TaskUpdate>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<BatchReport, BatchError> {
        let skipped = self
            .db
            .count_pending_non_images()
            .map_err(|e| BatchError::store(e, BatchReport { reclaimed, ..Default::default() }))?;

        let total = candidates.len();
        if let Some(ref tx) = progress_tx {
            let _ = tx.send(TaskUpdate::Started { total });
        }
        tracing::info!(
            candidates = total,
            skipped,
            reclaimed,
            concurrency = self.config.concurrency,
            backend = self.vision.backend_name(),
            "Starting batch"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency.max(1))
            .thread_name(|i| format!("photoindex-worker-{}", i))
            .build()?;

        let counters = Counters::default();
        let result: StoreResult<()> = pool.install(|| {
            candidates.par_iter().try_for_each(|file| {
                if cancel_flag.load(Ordering::SeqCst) {
                    counters.cancelled.store(true, Ordering::SeqCst);
                    return Ok(());
                }

                let outcome = self.process_file(file)?;
                counters.record(file.id, &outcome);

                let done = counters.done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(ref tx) = progress_tx {
                    let _ = tx.send(TaskUpdate::Progress(
                        TaskProgress::new(done, total, file.file_path.as_str(), outcome.label()),
                    ));
                }
                Ok(())
            })
        });

        let report = counters.report(skipped, reclaimed);
        if let Err(e) = result {
            tracing::error!(
                error = %e,
                completed = report.completed,
                last_completed_file_id = ?report.last_completed_file_id,
                "Batch aborted"
            );
            if let Some(ref tx) = progress_tx {
                let _ = tx.send(TaskUpdate::Failed { error: e.to_string() });
            }
            return Err(BatchError::store(e, report));
        }

        tracing::info!(
            attempted = report.attempted,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Batch finished"
        );
        if let Some(ref tx) = progress_tx {
            if report.cancelled {
                let _ = tx.send(TaskUpdate::Cancelled {
                    finished: report.attempted,
                });
            } else {
                let _ = tx.send(TaskUpdate::Completed {
                    completed: report.completed,
                    failed: report.failed,
                });
            }
        }

        Ok(report)
    }

    /// Manual retry: up to `limit` failed files, including those over the
    /// attempt cap, go back to `pending` and a batch runs over exactly those.
    pub fn retry_failed(
        &self,
        limit: Option<usize>,
        progress_tx: Option<mpsc::Sender<TaskUpdate>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<BatchReport, BatchError> {
        let reclaimed = self.reclaim()?;
        let ids = self.db.reset_failed(limit)?;
        tracing::info!(reset = ids.len(), "Failed files queued for retry");
        self.run_marked(&ids, reclaimed, progress_tx, cancel_flag)
    }

    /// Mark files matching `filter` as `pending` under `mode`, then run a
    /// batch over the marked files only. Returns the number of files marked
    /// alongside the batch report.
    pub fn reprocess(
        &self,
        filter: &ReprocessFilter,
        mode: ReprocessMode,
        progress_tx: Option<mpsc::Sender<TaskUpdate>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<(usize, BatchReport), BatchError> {
        let reclaimed = self.reclaim()?;
        let ids = self.db.reset_for_reprocess(filter, mode)?;
        let report = self.run_marked(&ids, reclaimed, progress_tx, cancel_flag)?;
        Ok((ids.len(), report))
    }

    fn run_marked(
        &self,
        ids: &[i64],
        reclaimed: usize,
        progress_tx: Option<mpsc::Sender<TaskUpdate>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<BatchReport, BatchError> {
        let candidates = self
            .db
            .pending_images_by_id(ids)
            .map_err(|e| BatchError::store(e, BatchReport { reclaimed, ..Default::default() }))?;
        self.dispatch(candidates, reclaimed, progress_tx, cancel_flag)
    }

    /// Run one attempt on a single file, identified by its remote id.
    pub fn process_one(&self, remote_id: &str) -> Result<FileOutcome, BatchError> {
        let file = self
            .db
            .get_file_by_remote_id(remote_id)?
            .ok_or_else(|| BatchError::UnknownFile(remote_id.to_string()))?;
        if !file.is_image() {
            return Ok(FileOutcome::NotAnImage);
        }
        Ok(self.process_file(&file)?)
    }

    /// Claim, analyse and record one file. Only store failures are errors.
    fn process_file(&self, file: &MediaFile) -> StoreResult<FileOutcome> {
        let Some(claim) = self.db.claim(file.id, Utc::now())? else {
            tracing::debug!(file_id = file.id, "File already claimed elsewhere");
            return Ok(FileOutcome::NotClaimed);
        };

        match self.analyze_file(file) {
            Ok(analyzed) => {
                if file.width.is_none() || file.height.is_none() {
                    self.db.update_dimensions(file.id, analyzed.width, analyzed.height)?;
                }
                self.finish(&claim, file, &analyzed.metadata)
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                tracing::error!(file_id = file.id, path = %file.file_path, kind, error = %message, "Analysis failed");
                if self.db.fail_file(&claim, kind, &message, Utc::now())? {
                    Ok(FileOutcome::Failed { kind, message })
                } else {
                    Ok(FileOutcome::LeaseLost)
                }
            }
        }
    }

    fn finish(
        &self,
        claim: &Claim,
        file: &MediaFile,
        metadata: &ExtractedMetadata,
    ) -> StoreResult<FileOutcome> {
        if self.db.complete_file(claim, metadata, Utc::now())? {
            tracing::info!(
                file_id = file.id,
                path = %file.file_path,
                quality = metadata.visual_quality.get(),
                marketing = metadata.marketing_score.get(),
                tags = metadata.activity_tags.len(),
                "File completed"
            );
            Ok(FileOutcome::Completed)
        } else {
            Ok(FileOutcome::LeaseLost)
        }
    }

    fn analyze_file(&self, file: &MediaFile) -> Result<Analyzed, FileError> {
        let limit = self.max_file_bytes();
        if let Some(size) = file.file_size.and_then(|s| u64::try_from(s).ok()) {
            if size > limit {
                return Err(FileError::TooLarge { size, limit });
            }
        }

        let bytes = self.retry.run(
            "download",
            |_| self.source.download(&file.remote_id),
            SourceError::is_transient,
        )?;
        let size = bytes.len() as u64;
        if size > limit {
            return Err(FileError::TooLarge { size, limit });
        }

        let prepared = prepare_image(&bytes, self.vision.max_image_dimension())?;
        drop(bytes);

        let raw = self
            .vision
            .analyze(&prepared.encoded, &file.filename, &file.file_path)?;
        let metadata = validate(&raw)?;

        Ok(Analyzed {
            metadata,
            width: prepared.width,
            height: prepared.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisionConfig;
    use crate::db::AttemptOutcome;
    use crate::llm::{EncodedImage, VisionBackend};
    use crate::model::{DiscoveredFile, ProcessingStatus};
    use crate::source::RemoteEntry;
    use std::collections::HashMap;
    use std::io::Cursor;

    struct MemorySource {
        files: HashMap<String, Vec<u8>>,
    }

    impl RemoteSource for MemorySource {
        fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, SourceError> {
            Err(SourceError::NotFound(folder_id.to_string()))
        }

        fn get_metadata(&self, file_id: &str) -> Result<RemoteEntry, SourceError> {
            Err(SourceError::NotFound(file_id.to_string()))
        }

        fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError> {
            self.files
                .get(file_id)
                .cloned()
                .ok_or_else(|| SourceError::Permission(file_id.to_string()))
        }

        fn source_name(&self) -> &'static str {
            "memory"
        }
    }

    /// Answers based on the filename in the prompt.
    struct ByFilename;

    impl VisionBackend for ByFilename {
        fn analyze(&self, _image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
            if prompt.contains("Filename: bad-score") {
                return Ok(r#"{"primary_subject": "x", "visual_quality": 7, "social_media_score": 3,
                    "social_media_reason": "r", "marketing_score": 0, "marketing_use": "u"}"#
                    .to_string());
            }
            if prompt.contains("Filename: down") {
                return Err(AnalysisError::Unavailable("connection refused".into()));
            }
            Ok(r#"{"primary_subject": "raised beds", "visual_quality": 4, "has_people": true,
                "people_count": "3-5", "social_media_score": 5, "social_media_reason": "bright",
                "marketing_score": 4, "marketing_use": "newsletter",
                "activity_tags": ["gardening", "sunbathing"]}"#
                .to_string())
        }

        fn backend_name(&self) -> &'static str {
            "by-filename"
        }
    }

    fn png() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(64, 48));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn setup(names: &[&str]) -> (Arc<Database>, BatchRunner) {
        setup_with(names, |_| Arc::new(ByFilename))
    }

    fn setup_with(
        names: &[&str],
        backend: impl FnOnce(Arc<Database>) -> Arc<dyn VisionBackend>,
    ) -> (Arc<Database>, BatchRunner) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();

        let mut files = HashMap::new();
        for name in names {
            db.upsert_discovered(&DiscoveredFile {
                remote_id: name.to_string(),
                filename: name.to_string(),
                file_path: format!("Farm/{}", name),
                file_size: None,
                mime_type: Some("image/png".to_string()),
                created_date: None,
                modified_date: None,
            })
            .unwrap();
            if !name.starts_with("missing") {
                files.insert(name.to_string(), png());
            }
        }

        let vision = VisionClient::new(backend(db.clone()), &VisionConfig::default(), RetryPolicy::none());
        let runner = BatchRunner::new(
            db.clone(),
            Arc::new(MemorySource { files }),
            vision,
            &ProcessingConfig::default(),
            RetryPolicy::none(),
        );
        (db, runner)
    }

    /// Makes the metadata table refuse writes from the second analysis on,
    /// until the trigger is dropped.
    struct BreaksStoreOnSecondCall {
        db: Arc<Database>,
        calls: AtomicUsize,
    }

    impl VisionBackend for BreaksStoreOnSecondCall {
        fn analyze(&self, image: &EncodedImage, prompt: &str) -> Result<String, AnalysisError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                self.db
                    .lock()
                    .unwrap()
                    .execute_batch(
                        "CREATE TRIGGER refuse_metadata BEFORE INSERT ON metadata
                         BEGIN SELECT RAISE(ABORT, 'disk quota exceeded'); END;",
                    )
                    .unwrap();
            }
            ByFilename.analyze(image, prompt)
        }

        fn backend_name(&self) -> &'static str {
            "breaks-store"
        }
    }

    fn file(db: &Database, remote_id: &str) -> MediaFile {
        db.get_file_by_remote_id(remote_id).unwrap().unwrap()
    }

    #[test]
    fn test_batch_completes_and_fails_per_file() {
        let (db, runner) = setup(&["good.png", "bad-score.png", "down.png", "missing.png"]);

        let (tx, rx) = mpsc::channel();
        let report = runner
            .run_batch(None, Some(tx), Arc::new(AtomicBool::new(false)))
            .unwrap();

        assert_eq!(report.attempted, 4);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 3);
        assert!(!report.cancelled);

        let good = file(&db, "good.png");
        assert_eq!(good.processing_status, ProcessingStatus::Completed);
        assert_eq!((good.width, good.height), (Some(64), Some(48)));
        assert_eq!(report.last_completed_file_id, Some(good.id));
        let meta = db.get_metadata(good.id).unwrap().unwrap();
        assert_eq!(meta.activity_tags.len(), 1);

        let bad = file(&db, "bad-score.png");
        assert_eq!(bad.processing_status, ProcessingStatus::Failed);
        let message = bad.error_message.unwrap();
        assert!(message.contains("visual_quality"));
        assert!(message.contains("marketing_score"));
        assert!(db.get_metadata(bad.id).unwrap().is_none());

        let attempts = db.attempts_for(file(&db, "down.png").id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_kind.as_deref(), Some("unavailable"));

        let missing = db.attempts_for(file(&db, "missing.png").id).unwrap();
        assert_eq!(missing[0].error_kind.as_deref(), Some("source"));

        let updates: Vec<TaskUpdate> = rx.try_iter().collect();
        assert_eq!(updates.first(), Some(&TaskUpdate::Started { total: 4 }));
        assert_eq!(
            updates.last(),
            Some(&TaskUpdate::Completed {
                completed: 1,
                failed: 3
            })
        );
        assert_eq!(updates.len(), 6);
    }

    #[test]
    fn test_cancelled_batch_leaves_files_pending() {
        let (db, runner) = setup(&["a.png", "b.png", "c.png"]);

        let report = runner
            .run_batch(None, None, Arc::new(AtomicBool::new(true)))
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
        assert_eq!(db.stats().unwrap().pending, 3);
    }

    #[test]
    fn test_max_attempts_and_manual_retry() {
        let (db, mut runner) = setup(&["down.png"]);
        runner.config.max_attempts = Some(1);
        let cancel = Arc::new(AtomicBool::new(false));

        assert_eq!(runner.run_batch(None, None, cancel.clone()).unwrap().failed, 1);
        // Over the cap: left alone by automatic runs.
        assert_eq!(runner.run_batch(None, None, cancel.clone()).unwrap().attempted, 0);

        let report = runner.retry_failed(None, None, cancel).unwrap();
        assert_eq!(report.attempted, 1);
        let id = file(&db, "down.png").id;
        assert_eq!(db.count_attempts(id, AttemptOutcome::Failure).unwrap(), 2);
    }

    #[test]
    fn test_oversized_file_fails() {
        let (db, mut runner) = setup(&["good.png"]);
        runner.config.max_file_size_mb = 0;

        runner.run_batch(None, None, Arc::new(AtomicBool::new(false))).unwrap();
        let good = file(&db, "good.png");
        assert_eq!(good.processing_status, ProcessingStatus::Failed);
        assert_eq!(
            db.attempts_for(good.id).unwrap()[0].error_kind.as_deref(),
            Some("too_large")
        );
    }

    #[test]
    fn test_process_one_and_unknown_file() {
        let (db, runner) = setup(&["good.png"]);
        assert_eq!(runner.process_one("good.png").unwrap(), FileOutcome::Completed);
        // Completed files are not re-claimed without a reprocess.
        assert_eq!(runner.process_one("good.png").unwrap(), FileOutcome::NotClaimed);
        assert!(matches!(
            runner.process_one("nope"),
            Err(BatchError::UnknownFile(_))
        ));
        assert_eq!(db.stats().unwrap().completed, 1);
    }

    #[test]
    fn test_reprocess_archive_runs_again() {
        let (db, runner) = setup(&["good.png"]);
        let cancel = Arc::new(AtomicBool::new(false));
        runner.run_batch(None, None, cancel.clone()).unwrap();

        let (marked, report) = runner
            .reprocess(&ReprocessFilter::default(), ReprocessMode::Archive, None, cancel)
            .unwrap();
        assert_eq!(marked, 1);
        assert_eq!(report.completed, 1);

        let id = file(&db, "good.png").id;
        assert_eq!(db.history_for(id).unwrap().len(), 1);
        assert_eq!(db.count_attempts(id, AttemptOutcome::Success).unwrap(), 2);
    }

    #[test]
    fn test_reprocess_runs_only_marked_files() {
        let (db, runner) = setup(&["p1.png", "p2.png"]);
        let cancel = Arc::new(AtomicBool::new(false));
        assert_eq!(runner.process_one("p2.png").unwrap(), FileOutcome::Completed);

        let filter = ReprocessFilter {
            remote_ids: vec!["p2.png".to_string()],
            limit: Some(1),
            ..Default::default()
        };
        let (marked, report) = runner
            .reprocess(&filter, ReprocessMode::Upsert, None, cancel)
            .unwrap();
        assert_eq!(marked, 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.completed, 1);

        let p2 = file(&db, "p2.png");
        assert_eq!(p2.processing_status, ProcessingStatus::Completed);
        assert_eq!(report.last_completed_file_id, Some(p2.id));
        assert_eq!(db.count_attempts(p2.id, AttemptOutcome::Success).unwrap(), 2);

        let p1 = file(&db, "p1.png");
        assert_eq!(p1.processing_status, ProcessingStatus::Pending);
        assert!(db.attempts_for(p1.id).unwrap().is_empty());
    }

    #[test]
    fn test_retry_failed_runs_only_reset_files() {
        let (db, runner) = setup(&["down.png", "good.png"]);
        assert!(matches!(
            runner.process_one("down.png").unwrap(),
            FileOutcome::Failed { kind: "unavailable", .. }
        ));

        let report = runner
            .retry_failed(Some(1), None, Arc::new(AtomicBool::new(false)))
            .unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);

        let down = file(&db, "down.png");
        assert_eq!(db.count_attempts(down.id, AttemptOutcome::Failure).unwrap(), 2);
        assert_eq!(file(&db, "good.png").processing_status, ProcessingStatus::Pending);
    }

    #[test]
    fn test_huge_stale_lease_age_keeps_live_leases() {
        let (db, mut runner) = setup(&["held.png", "free.png"]);
        let held = file(&db, "held.png");
        let claim = db.claim(held.id, Utc::now()).unwrap().unwrap();

        for secs in [u64::MAX, u64::MAX / 2] {
            runner.config.stale_lease_secs = secs;
            let report = runner
                .run_batch(None, None, Arc::new(AtomicBool::new(false)))
                .unwrap();
            assert_eq!(report.reclaimed, 0);
        }

        assert_eq!(file(&db, "held.png").processing_status, ProcessingStatus::InProgress);
        assert_eq!(file(&db, "free.png").processing_status, ProcessingStatus::Completed);
        // The original holder can still finish.
        assert!(db.fail_file(&claim, "unavailable", "late", Utc::now()).unwrap());
    }

    #[test]
    fn test_store_failure_aborts_batch_and_resumes() {
        let (db, mut runner) = setup_with(&["a.png", "b.png", "c.png"], |db| {
            Arc::new(BreaksStoreOnSecondCall {
                db,
                calls: AtomicUsize::new(0),
            })
        });
        runner.config.concurrency = 1;
        let cancel = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel();
        let err = runner.run_batch(None, Some(tx), cancel.clone()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::Store {
                source: StoreError::ConstraintViolation(_),
                ..
            }
        ));
        let report = err.report().unwrap().clone();
        assert_eq!(report.completed, 1);
        assert!(matches!(rx.try_iter().last(), Some(TaskUpdate::Failed { .. })));

        let stats = db.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_progress, 1);
        let done = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|name| file(&db, name))
            .find(|f| f.processing_status == ProcessingStatus::Completed)
            .unwrap();
        assert_eq!(report.last_completed_file_id, Some(done.id));

        // The interrupted file's write rolled back: no metadata, lease still held.
        let stuck = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|name| file(&db, name))
            .find(|f| f.processing_status == ProcessingStatus::InProgress)
            .unwrap();
        assert!(db.get_metadata(stuck.id).unwrap().is_none());

        db.lock()
            .unwrap()
            .execute_batch("DROP TRIGGER refuse_metadata;")
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(db.reclaim_stale_leases(later).unwrap(), 1);

        let report = runner.run_batch(None, None, cancel).unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(db.stats().unwrap().completed, 3);
        assert!(db.get_metadata(stuck.id).unwrap().is_some());
    }
}

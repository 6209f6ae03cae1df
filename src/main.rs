use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use photoindex::config::{Config, SourceKind};
use photoindex::db::{Database, MetadataEdit, ReprocessFilter, ReprocessMode, SearchFilter};
use photoindex::llm::VisionClient;
use photoindex::logging;
use photoindex::model::{ActivityTag, PeopleCount, ProcessingStatus, Season, TimeOfDay};
use photoindex::retry::RetryPolicy;
use photoindex::scanner::{ScanProgress, Scanner};
use photoindex::source::{create_source, RemoteSource};
use photoindex::tasks::{BatchError, BatchReport, BatchRunner, FileOutcome, TaskUpdate};

#[derive(Parser)]
#[command(name = "photoindex", version, about = "Tag cloud-stored photos with AI vision metadata")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "PHOTOINDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the state database
    InitDb,
    /// Walk the remote folders and record new media files
    Discover {
        /// Folder id to walk instead of the configured roots (repeatable)
        #[arg(long = "folder")]
        folders: Vec<String>,
        /// Stop after this many new files
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Analyse pending and failed images
    Process {
        #[arg(long)]
        limit: Option<usize>,
        /// Override processing.concurrency
        #[arg(long)]
        concurrency: Option<usize>,
        /// Process a single file by remote id
        #[arg(long, conflicts_with_all = ["limit", "concurrency"])]
        remote_id: Option<String>,
    },
    /// Reset failed files, including those over the attempt cap, and process them
    RetryFailed {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Mark files for another analysis pass and run a batch
    Reprocess {
        /// Only files in this status (repeatable)
        #[arg(long = "status", value_parser = parse_status)]
        statuses: Vec<ProcessingStatus>,
        #[arg(long)]
        path_prefix: Option<String>,
        /// Only this remote id (repeatable)
        #[arg(long = "remote-id")]
        remote_ids: Vec<String>,
        #[arg(long, value_parser = parse_tag)]
        tag: Option<ActivityTag>,
        /// upsert, archive or clear
        #[arg(long, default_value = "upsert", value_parser = parse_mode)]
        mode: ReprocessMode,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Counts per status
    Stats,
    /// Everything known about one file
    Show { remote_id: String },
    /// Query completed files
    Search {
        /// Substring of the subject or notes
        text: Option<String>,
        #[arg(long)]
        min_quality: Option<u8>,
        #[arg(long)]
        min_social: Option<u8>,
        #[arg(long)]
        min_marketing: Option<u8>,
        #[arg(long)]
        has_people: Option<bool>,
        #[arg(long, value_parser = parse_people_count)]
        people_count: Option<PeopleCount>,
        #[arg(long)]
        indoor: Option<bool>,
        #[arg(long, value_parser = parse_season)]
        season: Option<Season>,
        #[arg(long, value_parser = parse_time_of_day)]
        time_of_day: Option<TimeOfDay>,
        #[arg(long, value_parser = parse_tag)]
        tag: Option<ActivityTag>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Activity tag usage
    Tags,
    /// Correct the metadata of one file by hand
    Edit {
        remote_id: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        quality: Option<i64>,
        #[arg(long)]
        has_people: Option<bool>,
        #[arg(long)]
        people_count: Option<String>,
        #[arg(long)]
        indoor: Option<bool>,
        #[arg(long)]
        social_score: Option<i64>,
        #[arg(long)]
        social_reason: Option<String>,
        #[arg(long)]
        marketing_score: Option<i64>,
        #[arg(long)]
        marketing_use: Option<String>,
        #[arg(long)]
        season: Option<String>,
        #[arg(long)]
        time_of_day: Option<String>,
        #[arg(long)]
        mood: Option<String>,
        #[arg(long)]
        colors: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Comma-separated; replaces the whole tag set
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,
    },
    /// Send a probe image to the configured vision backend
    TestBackend,
}

fn parse_status(s: &str) -> Result<ProcessingStatus, String> {
    ProcessingStatus::from_str(s).ok_or_else(|| format!("unknown status {:?}", s))
}

fn parse_tag(s: &str) -> Result<ActivityTag, String> {
    ActivityTag::from_str(s).ok_or_else(|| {
        let known: Vec<_> = ActivityTag::ALL.iter().map(|t| t.as_str()).collect();
        format!("unknown tag {:?} (known: {})", s, known.join(", "))
    })
}

fn parse_mode(s: &str) -> Result<ReprocessMode, String> {
    ReprocessMode::from_str(s).ok_or_else(|| format!("mode must be upsert, archive or clear, got {:?}", s))
}

fn parse_people_count(s: &str) -> Result<PeopleCount, String> {
    PeopleCount::from_str(s).ok_or_else(|| format!("unknown people count {:?}", s))
}

fn parse_season(s: &str) -> Result<Season, String> {
    Season::from_str(s).ok_or_else(|| format!("unknown season {:?}", s))
}

fn parse_time_of_day(s: &str) -> Result<TimeOfDay, String> {
    TimeOfDay::from_str(s).ok_or_else(|| format!("unknown time of day {:?}", s))
}

fn open_database(config: &Config) -> Result<Arc<Database>> {
    let path = &config.database.path;
    let db = Database::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?
        .with_history_limit(config.history.max_versions);
    db.initialize().context("Failed to initialize database")?;
    Ok(Arc::new(db))
}

fn open_source(config: &Config) -> Result<Arc<dyn RemoteSource>> {
    Ok(Arc::from(create_source(&config.source)?))
}

fn build_runner(config: &Config, db: Arc<Database>) -> Result<BatchRunner> {
    let retry = RetryPolicy::from_config(&config.retry);
    let vision = VisionClient::from_config(&config.vision, retry.clone());
    Ok(BatchRunner::new(
        db,
        open_source(config)?,
        vision,
        &config.processing,
        retry,
    ))
}

/// Flag set on the first Ctrl-C. Files in flight finish; no new ones start.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after files in flight finish...");
            handler_flag.store(true, Ordering::SeqCst);
        }
    });
    flag
}

/// Log batch progress from a background thread.
fn progress_logger() -> (mpsc::Sender<TaskUpdate>, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<TaskUpdate>();
    let handle = std::thread::spawn(move || {
        for update in rx {
            match update {
                TaskUpdate::Started { total } => tracing::info!(total, "Processing"),
                TaskUpdate::Progress(progress) => tracing::info!(
                    "[{}/{} {}%] {} {}",
                    progress.current,
                    progress.total,
                    progress.percent(),
                    progress.outcome,
                    progress.file_path
                ),
                TaskUpdate::Completed { completed, failed } => {
                    tracing::info!(completed, failed, "Batch complete")
                }
                TaskUpdate::Cancelled { finished } => tracing::warn!(finished, "Batch cancelled"),
                TaskUpdate::Failed { error } => tracing::error!(error = %error, "Batch failed"),
            }
        }
    });
    (tx, handle)
}

fn print_report(report: &BatchReport) {
    println!(
        "attempted {}, completed {}, failed {}, skipped {}, reclaimed {}{}",
        report.attempted,
        report.completed,
        report.failed,
        report.skipped,
        report.reclaimed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

/// Run a batch operation off the async runtime, logging progress and
/// reporting partial progress if the store fails.
async fn run_batch_job<T, F>(job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<TaskUpdate>) -> Result<T, BatchError> + Send + 'static,
{
    let (tx, logger) = progress_logger();
    let result = tokio::task::spawn_blocking(move || job(tx)).await?;
    let _ = logger.join();

    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Some(report) = e.report() {
                print_report(report);
                if let Some(id) = report.last_completed_file_id {
                    eprintln!("last completed file id: {}", id);
                }
            }
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::InitDb => {
            let db = open_database(&config)?;
            println!(
                "Database ready at {} (schema version {})",
                config.database.path.display(),
                db.schema_version()?
            );
        }

        Commands::Discover { folders, limit } => {
            config.validate()?;
            let db = open_database(&config)?;
            let source = open_source(&config)?;

            let mut roots = if folders.is_empty() {
                config.source.root_folders.clone()
            } else {
                folders
            };
            if roots.is_empty() && config.source.kind == SourceKind::Local {
                roots.push(String::new());
            }

            let discovery = config.discovery.clone();
            let retry = RetryPolicy::from_config(&config.retry);
            let report = tokio::task::spawn_blocking(move || {
                let (tx, rx) = mpsc::channel();
                let logger = std::thread::spawn(move || {
                    for event in rx {
                        if let ScanProgress::Folder { path, entries } = event {
                            tracing::debug!(path = %path, entries, "Listed folder");
                        }
                    }
                });
                let scanner = Scanner::new(source.as_ref(), &db, &discovery, retry);
                let report = scanner.discover(&roots, limit, Some(tx));
                let _ = logger.join();
                report
            })
            .await??;

            println!(
                "{} new, {} already known, {} skipped",
                report.new_files, report.already_known, report.skipped
            );
            for folder in &report.unreadable {
                println!("unreadable: {} ({}): {}", folder.path, folder.folder_id, folder.reason);
            }
        }

        Commands::Process {
            limit,
            concurrency,
            remote_id,
        } => {
            let mut config = config;
            if let Some(concurrency) = concurrency {
                config.processing.concurrency = concurrency;
            }
            config.validate()?;
            let runner = build_runner(&config, open_database(&config)?)?;

            if let Some(remote_id) = remote_id {
                let outcome = tokio::task::spawn_blocking(move || runner.process_one(&remote_id)).await??;
                match outcome {
                    FileOutcome::Completed => println!("completed"),
                    FileOutcome::Failed { kind, message } => println!("failed ({}): {}", kind, message),
                    FileOutcome::LeaseLost => println!("lease lost; result discarded"),
                    FileOutcome::NotClaimed => {
                        println!("not processed: file is completed or leased by another worker")
                    }
                    FileOutcome::NotAnImage => println!("not processed: not an image"),
                }
                return Ok(());
            }

            let cancel = cancel_on_ctrl_c();
            let report = run_batch_job(move |tx| runner.run_batch(limit, Some(tx), cancel)).await?;
            print_report(&report);
        }

        Commands::RetryFailed { limit } => {
            config.validate()?;
            let runner = build_runner(&config, open_database(&config)?)?;
            let cancel = cancel_on_ctrl_c();
            let report = run_batch_job(move |tx| runner.retry_failed(limit, Some(tx), cancel)).await?;
            print_report(&report);
        }

        Commands::Reprocess {
            statuses,
            path_prefix,
            remote_ids,
            tag,
            mode,
            limit,
        } => {
            config.validate()?;
            let runner = build_runner(&config, open_database(&config)?)?;
            let filter = ReprocessFilter {
                statuses,
                path_prefix,
                remote_ids,
                tag,
                limit,
            };
            let cancel = cancel_on_ctrl_c();
            let (marked, report) =
                run_batch_job(move |tx| runner.reprocess(&filter, mode, Some(tx), cancel)).await?;
            println!("{} files marked for reprocessing ({})", marked, mode.as_str());
            print_report(&report);
        }

        Commands::Stats => {
            let db = open_database(&config)?;
            let stats = db.stats()?;
            println!("total        {}", stats.total);
            println!("pending      {}", stats.pending);
            println!("in_progress  {}", stats.in_progress);
            println!("completed    {}", stats.completed);
            println!("failed       {}", stats.failed);
            println!("metadata     {}", stats.with_metadata);
            println!("tags         {}", stats.tag_assignments);
            println!("attempts     {}", stats.attempts);
        }

        Commands::Show { remote_id } => {
            let db = open_database(&config)?;
            let Some(file) = db.get_file_by_remote_id(&remote_id)? else {
                bail!("no file with remote id {}", remote_id);
            };

            println!("{} ({})", file.file_path, file.remote_id);
            println!("  status: {}", file.processing_status.as_str());
            if let Some(ref mime) = file.mime_type {
                println!("  type: {}", mime);
            }
            if let (Some(w), Some(h)) = (file.width, file.height) {
                println!("  size: {}x{}", w, h);
            }
            if let Some(ref error) = file.error_message {
                println!("  last error: {}", error);
            }

            if let Some(metadata) = db.get_metadata(file.id)? {
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }

            for attempt in db.attempts_for(file.id)? {
                println!(
                    "  {} {} {} {}ms {}",
                    attempt.finished_at.format("%Y-%m-%d %H:%M:%S"),
                    attempt.source.as_str(),
                    attempt.outcome.as_str(),
                    attempt.duration_ms,
                    attempt.error_kind.unwrap_or_default()
                );
            }
            let history = db.history_for(file.id)?;
            if !history.is_empty() {
                println!("  {} archived versions", history.len());
            }
        }

        Commands::Search {
            text,
            min_quality,
            min_social,
            min_marketing,
            has_people,
            people_count,
            indoor,
            season,
            time_of_day,
            tag,
            limit,
        } => {
            let db = open_database(&config)?;
            let hits = db.search(&SearchFilter {
                text,
                min_quality,
                min_social,
                min_marketing,
                has_people,
                people_count,
                is_indoor: indoor,
                season,
                time_of_day,
                tag,
                limit: Some(limit),
            })?;

            for hit in &hits {
                let tags: Vec<_> = hit.metadata.activity_tags.iter().map(|t| t.as_str()).collect();
                println!(
                    "q{} s{} m{}  {}  {}  [{}]",
                    hit.metadata.visual_quality.get(),
                    hit.metadata.social_media_score.get(),
                    hit.metadata.marketing_score.get(),
                    hit.file.file_path,
                    hit.metadata.primary_subject,
                    tags.join(", ")
                );
            }
            println!("{} matches", hits.len());
        }

        Commands::Tags => {
            let db = open_database(&config)?;
            for (tag, count) in db.tag_counts()? {
                println!("{:<12} {}", tag.as_str(), count);
            }
        }

        Commands::Edit {
            remote_id,
            subject,
            quality,
            has_people,
            people_count,
            indoor,
            social_score,
            social_reason,
            marketing_score,
            marketing_use,
            season,
            time_of_day,
            mood,
            colors,
            notes,
            tags,
        } => {
            let edit = MetadataEdit {
                primary_subject: subject,
                visual_quality: quality,
                has_people,
                people_count,
                is_indoor: indoor,
                social_media_score: social_score,
                social_media_reason: social_reason,
                marketing_score,
                marketing_use,
                season,
                time_of_day,
                mood_energy: mood,
                color_palette: colors,
                notes,
                activity_tags: tags,
            };
            if edit.is_empty() {
                bail!("nothing to change; pass at least one field");
            }

            let db = open_database(&config)?;
            let Some(file) = db.get_file_by_remote_id(&remote_id)? else {
                bail!("no file with remote id {}", remote_id);
            };
            let updated = db.apply_user_edit(file.id, &edit)?;
            println!("updated {}: {}", file.file_path, edit.changed_fields().join(", "));
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }

        Commands::TestBackend => {
            config.validate()?;
            let client = VisionClient::from_config(&config.vision, RetryPolicy::from_config(&config.retry));
            println!("Backend: {} ({})", client.backend_name(), config.vision.model);
            let answer = tokio::task::spawn_blocking(move || client.probe()).await??;
            println!("{}", answer);
        }
    }

    Ok(())
}

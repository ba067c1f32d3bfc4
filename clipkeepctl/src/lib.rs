use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clipkeep_core::{
    format_duration, format_size, format_time_remaining, load_config, Artifact, ArtifactReaper,
    ClipkeepConfig, CredentialStore, DeletionReason, EventPayload, FfmpegTranscoder, Intake,
    IntakeError, LibraryError, LifecycleError, LifecycleManager, LifecyclePolicy, LifecycleReport,
    LifecycleScheduler, MediaStorage, Notifier, PipelineEvent, QueueError, SlidingWindowLimiter,
    SqliteJobQueue, SqliteLibraryStore, StorageError, SubmitterPreference, SystemClock,
    TranscodeProfile, UsageStats, Worker, WorkerSettings, YtDlpExtractor,
};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] clipkeep_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("library error: {0}")]
    Library(#[from] LibraryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error("artifact not found: {0}")]
    NotFound(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "clipkeep download pipeline control", long_about = None)]
pub struct Cli {
    /// Path to clipkeep.toml
    #[arg(long, default_value = "configs/clipkeep.toml")]
    pub config: PathBuf,
    /// Override for paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternative library.sqlite
    #[arg(long)]
    pub library_db: Option<PathBuf>,
    /// Alternative queue.sqlite
    #[arg(long)]
    pub queue_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Creates databases and storage directories
    Init,
    /// Validates a download request and queues it
    Submit(SubmitArgs),
    /// Runs the download worker until interrupted
    Worker,
    /// Runs lifecycle passes on the configured interval
    Lifecycle(LifecycleArgs),
    /// Worker, lifecycle scheduler and line-based intake on stdin
    Run(RunArgs),
    /// Lists stored artifacts, newest first
    List(ListArgs),
    /// Deletes an artifact and its files
    Delete(DeleteArgs),
    /// Usage statistics
    Stats(StatsArgs),
    /// Reads or changes a submitter's preferences
    Prefs(PrefsArgs),
    /// Shows pending jobs
    Queue(QueueArgs),
    /// Copies the library database
    Backup(BackupArgs),
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    pub submitter: String,
    pub url: String,
    /// best, audio, or a maximum height such as 720p
    #[arg(long, default_value = "best")]
    pub quality: String,
}

#[derive(Args, Debug)]
pub struct LifecycleArgs {
    /// Run a single pass and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Do not read submissions from stdin
    #[arg(long, default_value_t = false)]
    pub no_stdin: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub submitter: Option<String>,
    /// Case-insensitive title search
    #[arg(long)]
    pub search: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub artifact_id: String,
    /// Only delete when the artifact belongs to this submitter
    #[arg(long)]
    pub submitter: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[arg(long)]
    pub submitter: Option<String>,
}

#[derive(Args, Debug)]
pub struct PrefsArgs {
    pub submitter: String,
    /// Whether source descriptions are sent with completed downloads
    #[arg(long, value_enum)]
    pub send_description: Option<Toggle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    pub destination: PathBuf,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(&context, &cli))
}

async fn dispatch(context: &AppContext, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Init => render(&context.init().await?, cli.format)?,
        Commands::Submit(args) => render(&context.submit(args)?, cli.format)?,
        Commands::Worker => {
            let summary = context.serve(cli.format, false, false).await?;
            render(&summary, cli.format)?;
        }
        Commands::Lifecycle(args) if args.once => {
            render(&context.lifecycle_once().await?, cli.format)?
        }
        Commands::Lifecycle(_) => {
            let summary = context.serve(cli.format, true, false).await?;
            render(&summary, cli.format)?;
        }
        Commands::Run(args) => {
            let summary = context.serve(cli.format, true, !args.no_stdin).await?;
            render(&summary, cli.format)?;
        }
        Commands::List(args) => render(&context.list(args)?, cli.format)?,
        Commands::Delete(args) => render(&context.delete(args).await?, cli.format)?,
        Commands::Stats(args) => render(&context.stats(args)?, cli.format)?,
        Commands::Prefs(args) => render(&context.prefs(args)?, cli.format)?,
        Commands::Queue(args) => render(&context.queue_show(args)?, cli.format)?,
        Commands::Backup(args) => render(&context.backup(args)?, cli.format)?,
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ClipkeepConfig,
    library: SqliteLibraryStore,
    queue: SqliteJobQueue,
    storage: MediaStorage,
    notifier: Arc<Notifier>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_config(&cli.config)?;
        if let Some(dir) = &cli.data_dir {
            config.paths.data_dir = dir.to_string_lossy().into_owned();
        }
        if let Some(path) = &cli.library_db {
            config.paths.library_db = path.to_string_lossy().into_owned();
        }
        if let Some(path) = &cli.queue_db {
            config.paths.queue_db = path.to_string_lossy().into_owned();
        }
        config.validate()?;

        for db in [config.library_db_path(), config.queue_db_path()] {
            if let Some(parent) = db.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let library = SqliteLibraryStore::builder()
            .path(config.library_db_path())
            .create_if_missing(true)
            .build()?;
        library.initialize()?;
        let queue = SqliteJobQueue::builder()
            .path(config.queue_db_path())
            .create_if_missing(true)
            .idle_recheck(config.queue.idle_recheck())
            .build()?;
        queue.initialize()?;
        let storage = MediaStorage::new(config.storage_root());

        Ok(Self {
            config,
            library,
            queue,
            storage,
            notifier: Arc::new(Notifier::default()),
        })
    }

    async fn init(&self) -> Result<InitReport> {
        self.storage.ensure_layout().await?;
        let staging = self.config.staging_root();
        tokio::fs::create_dir_all(&staging).await?;
        Ok(InitReport {
            library_db: self.library.path().to_path_buf(),
            queue_db: self.queue.path().to_path_buf(),
            storage_root: self.storage.root().to_path_buf(),
            staging_root: staging,
        })
    }

    fn intake(&self) -> Intake {
        let limiter = SlidingWindowLimiter::from_config(&self.config.rate_limit, Arc::new(SystemClock));
        Intake::new(self.queue.clone(), Arc::new(limiter))
            .with_capacity_guard(self.library.clone(), self.config.capacity_ceiling_bytes())
    }

    fn submit(&self, args: &SubmitArgs) -> Result<SubmitResult> {
        let submission = self.intake().submit(&args.submitter, &args.url, &args.quality)?;
        Ok(SubmitResult {
            job_id: submission.job_id,
            submitter: submission.job.submitter,
            url: submission.job.url,
            quality: submission.job.quality.to_string(),
            pending: self.queue.len()?,
        })
    }

    fn worker(&self) -> Worker {
        let tools = &self.config.tools;
        let extractor = YtDlpExtractor::new(tools.yt_dlp.as_str(), None);
        let transcoder = FfmpegTranscoder::new(
            tools.ffmpeg.as_str(),
            TranscodeProfile::from(&self.config.transcode),
            None,
        );
        Worker::new(
            self.queue.clone(),
            self.library.clone(),
            self.storage.clone(),
            Arc::new(extractor),
            Arc::new(transcoder),
            self.notifier.clone(),
            WorkerSettings::from_config(&self.config),
        )
        .with_credentials(CredentialStore::from_config(&self.config.credentials))
    }

    fn reaper(&self) -> ArtifactReaper {
        ArtifactReaper::new(
            self.library.clone(),
            self.storage.clone(),
            self.notifier.clone(),
        )
    }

    fn lifecycle_manager(&self) -> LifecycleManager {
        LifecycleManager::new(
            self.library.clone(),
            self.storage.clone(),
            self.reaper(),
            LifecyclePolicy::from_config(&self.config),
        )
    }

    async fn lifecycle_once(&self) -> Result<LifecycleReport> {
        Ok(self.lifecycle_manager().run_pass(Utc::now()).await?)
    }

    /// Runs the long-lived components until Ctrl+C. The worker runs unless
    /// only the lifecycle scheduler was asked for.
    async fn serve(
        &self,
        format: OutputFormat,
        lifecycle: bool,
        stdin_intake: bool,
    ) -> Result<RunSummary> {
        self.storage.ensure_layout().await?;
        tokio::fs::create_dir_all(self.config.staging_root()).await?;

        let cancel = CancellationToken::new();
        let with_worker = stdin_intake || !lifecycle;

        let printer = {
            let mut subscription = self.notifier.subscribe();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        event = subscription.recv() => match event {
                            Some(event) => print_event(&event, format),
                            None => break,
                        },
                    }
                }
            })
        };

        let worker = with_worker.then(|| {
            let worker = self.worker();
            let token = cancel.clone();
            info!(storage = %self.storage.root().display(), "worker started");
            tokio::spawn(async move { worker.run(token).await })
        });

        let scheduler = lifecycle.then(|| {
            let interval = Duration::from_secs(self.config.retention.interval_seconds);
            let scheduler = LifecycleScheduler::new(Arc::new(self.lifecycle_manager()), interval);
            let token = cancel.clone();
            info!(interval_seconds = interval.as_secs(), "lifecycle scheduler started");
            tokio::spawn(async move { scheduler.run(token).await })
        });

        let intake = stdin_intake.then(|| {
            let intake = self.intake();
            let token = cancel.clone();
            tokio::spawn(read_submissions(intake, token))
        });

        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler; stopping");
        }
        info!("shutting down");
        cancel.cancel();

        let jobs_processed = match worker {
            Some(handle) => join_count(handle).await,
            None => 0,
        };
        let lifecycle_passes = match scheduler {
            Some(handle) => join_count(handle).await,
            None => 0,
        };
        if let Some(handle) = intake {
            let _ = handle.await;
        }
        let _ = printer.await;
        Ok(RunSummary {
            jobs_processed,
            lifecycle_passes,
        })
    }

    fn list(&self, args: &ListArgs) -> Result<ArtifactList> {
        let artifacts = match args.search.as_deref() {
            Some(query) => {
                self.library
                    .search_artifacts(args.submitter.as_deref(), query, args.limit)?
            }
            None => self.library.list_artifacts(args.submitter.as_deref(), args.limit)?,
        };
        Ok(ArtifactList {
            now: Utc::now(),
            artifacts,
        })
    }

    async fn delete(&self, args: &DeleteArgs) -> Result<DeleteResult> {
        let existing = self
            .library
            .fetch_artifact(&args.artifact_id)?
            .filter(|artifact| {
                args.submitter
                    .as_deref()
                    .map_or(true, |owner| artifact.submitter == owner)
            });
        if existing.is_none() {
            return Err(AppError::NotFound(args.artifact_id.clone()));
        }
        let removed = self
            .reaper()
            .delete(&args.artifact_id, DeletionReason::Requested, Utc::now())
            .await?;
        Ok(DeleteResult {
            artifact_id: args.artifact_id.clone(),
            deleted: removed.is_some(),
            size_bytes: removed.map(|artifact| artifact.size_bytes),
        })
    }

    fn stats(&self, args: &StatsArgs) -> Result<StatsReport> {
        Ok(StatsReport {
            usage: self.library.usage_stats(args.submitter.as_deref(), Utc::now())?,
            capacity_bytes: self.config.capacity_ceiling_bytes(),
            disk_bytes: self.storage.disk_usage()?,
            pending_jobs: self.queue.len()?,
        })
    }

    fn prefs(&self, args: &PrefsArgs) -> Result<PreferenceView> {
        let default = self.config.worker.send_description_default;
        match args.send_description {
            Some(toggle) => {
                let stored = self.library.set_send_description(
                    &args.submitter,
                    toggle == Toggle::On,
                    Utc::now(),
                )?;
                Ok(PreferenceView::from_stored(stored))
            }
            None => Ok(match self.library.preference(&args.submitter)? {
                Some(stored) => PreferenceView::from_stored(stored),
                None => PreferenceView {
                    submitter: args.submitter.clone(),
                    send_description: default,
                    is_default: true,
                },
            }),
        }
    }

    fn queue_show(&self, args: &QueueArgs) -> Result<QueueList> {
        let rows = self
            .queue
            .peek(args.limit)?
            .into_iter()
            .map(|queued| QueueEntry {
                id: queued.id,
                submitter: queued.job.submitter,
                url: queued.job.url,
                quality: queued.job.quality.to_string(),
                submitted_at: queued.job.submitted_at,
            })
            .collect();
        Ok(QueueList {
            pending: self.queue.len()?,
            rows,
        })
    }

    fn backup(&self, args: &BackupArgs) -> Result<BackupResult> {
        if let Some(parent) = args.destination.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.library.backup_to(&args.destination)?;
        Ok(BackupResult {
            destination: args.destination.clone(),
            artifacts: self.library.count()?,
        })
    }
}

async fn join_count(handle: tokio::task::JoinHandle<usize>) -> usize {
    match handle.await {
        Ok(count) => count,
        Err(err) => {
            warn!(error = %err, "task ended abnormally");
            0
        }
    }
}

/// Reads `<submitter> <url> [quality]` lines until EOF or cancellation.
async fn read_submissions(intake: Intake, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read stdin");
                break;
            }
        };
        let Some(request) = parse_submission(&line) else {
            continue;
        };
        match intake.submit(request.submitter, request.url, request.quality) {
            Ok(submission) => info!(
                job_id = submission.job_id,
                submitter = %submission.job.submitter,
                remaining = submission.remaining,
                "queued"
            ),
            Err(err) => warn!(submitter = request.submitter, error = %err, "submission rejected"),
        }
    }
    info!("stdin intake closed");
}

#[derive(Debug, PartialEq, Eq)]
struct SubmissionLine<'a> {
    submitter: &'a str,
    url: &'a str,
    quality: &'a str,
}

fn parse_submission(line: &str) -> Option<SubmissionLine<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let submitter = fields.next()?;
    let url = fields.next().unwrap_or("");
    let quality = fields.next().unwrap_or("best");
    Some(SubmissionLine {
        submitter,
        url,
        quality,
    })
}

fn print_event(event: &PipelineEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "failed to encode event"),
        },
        OutputFormat::Text => println!("{}", event.display()),
    }
}

impl DisplayFallback for PipelineEvent {
    fn display(&self) -> String {
        let detail = match &self.payload {
            EventPayload::Job { job_id, url, quality } => format!("job #{job_id} {url} ({quality})"),
            EventPayload::Stage { job_id, stage } => format!("job #{job_id} {stage}"),
            EventPayload::Completed { job_id, artifact, .. } => format!(
                "job #{job_id} -> {} {} [{}, {}]",
                artifact.id,
                artifact.title,
                format_size(artifact.size_bytes),
                format_duration(artifact.processing_seconds)
            ),
            EventPayload::Failed {
                job_id,
                stage,
                kind,
                message,
            } => format!("job #{job_id} failed while {stage}: {} ({message})", kind.user_message()),
            EventPayload::Deleted {
                artifact_id,
                reason,
                size_bytes,
            } => format!("{artifact_id} removed ({reason}, {})", format_size(*size_bytes)),
            EventPayload::None => String::new(),
        };
        format!("[{}] {} {}", self.kind.as_str(), self.submitter, detail)
            .trim_end()
            .to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub library_db: PathBuf,
    pub queue_db: PathBuf,
    pub storage_root: PathBuf,
    pub staging_root: PathBuf,
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        [
            ("library", &self.library_db),
            ("queue", &self.queue_db),
            ("storage", &self.storage_root),
            ("staging", &self.staging_root),
        ]
        .iter()
        .map(|(name, path)| format!("{name:<8} {}", path.display()))
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResult {
    pub job_id: i64,
    pub submitter: String,
    pub url: String,
    pub quality: String,
    pub pending: usize,
}

impl DisplayFallback for SubmitResult {
    fn display(&self) -> String {
        format!(
            "queued job #{} for {} ({}), {} pending",
            self.job_id, self.submitter, self.quality, self.pending
        )
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub jobs_processed: usize,
    pub lifecycle_passes: usize,
}

impl DisplayFallback for RunSummary {
    fn display(&self) -> String {
        format!(
            "stopped after {} jobs and {} lifecycle passes",
            self.jobs_processed, self.lifecycle_passes
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactList {
    #[serde(skip)]
    pub now: DateTime<Utc>,
    pub artifacts: Vec<Artifact>,
}

impl DisplayFallback for ArtifactList {
    fn display(&self) -> String {
        if self.artifacts.is_empty() {
            return "no artifacts stored".to_string();
        }
        let mut lines = Vec::new();
        for artifact in &self.artifacts {
            let remaining = (artifact.expires_at - self.now).num_seconds();
            lines.push(format!(
                "{id} | {title} | {quality} | {size} | {format}{normalized} | expires in {remaining} | {submitter}",
                id = artifact.id,
                title = artifact.title,
                quality = artifact.downloaded_quality,
                size = format_size(artifact.size_bytes),
                format = artifact.format,
                normalized = if artifact.normalized { "" } else { " (original)" },
                remaining = format_time_remaining(remaining),
                submitter = artifact.submitter,
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResult {
    pub artifact_id: String,
    pub deleted: bool,
    pub size_bytes: Option<u64>,
}

impl DisplayFallback for DeleteResult {
    fn display(&self) -> String {
        match self.size_bytes {
            Some(size) if self.deleted => {
                format!("deleted {} ({} freed)", self.artifact_id, format_size(size))
            }
            _ => format!("{} was already gone", self.artifact_id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub usage: UsageStats,
    pub capacity_bytes: u64,
    /// Bytes on disk under the media directories, orphans included.
    pub disk_bytes: u64,
    pub pending_jobs: usize,
}

impl DisplayFallback for StatsReport {
    fn display(&self) -> String {
        let usage = &self.usage;
        let scope = usage.submitter.as_deref().unwrap_or("all submitters");
        [
            format!("Usage for {scope}"),
            format!("  Stored: {} artifacts", usage.artifact_count),
            format!(
                "  Space: {} of {}",
                format_size(usage.used_bytes),
                format_size(self.capacity_bytes)
            ),
            format!("  On disk: {}", format_size(self.disk_bytes)),
            format!("  Downloads (7 days): {}", usage.downloads_last_7_days),
            format!("  Downloads (30 days): {}", usage.downloads_last_30_days),
            format!("  Deletes (30 days): {}", usage.deletes_last_30_days),
            format!("  Pending jobs: {}", self.pending_jobs),
        ]
        .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PreferenceView {
    pub submitter: String,
    pub send_description: bool,
    pub is_default: bool,
}

impl PreferenceView {
    fn from_stored(stored: SubmitterPreference) -> Self {
        Self {
            submitter: stored.submitter,
            send_description: stored.send_description,
            is_default: false,
        }
    }
}

impl DisplayFallback for PreferenceView {
    fn display(&self) -> String {
        format!(
            "{}: send_description={}{}",
            self.submitter,
            if self.send_description { "on" } else { "off" },
            if self.is_default { " (default)" } else { "" }
        )
    }
}

#[derive(Debug, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub submitter: String,
    pub url: String,
    pub quality: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct QueueList {
    pub pending: usize,
    pub rows: Vec<QueueEntry>,
}

impl DisplayFallback for QueueList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "queue is empty".to_string();
        }
        let mut lines = vec![format!("{} pending", self.pending)];
        for entry in &self.rows {
            lines.push(format!(
                "#{id} {submitter} {quality} {url} (submitted {at})",
                id = entry.id,
                submitter = entry.submitter,
                quality = entry.quality,
                url = entry.url,
                at = entry.submitted_at.format("%Y-%m-%d %H:%M:%S"),
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for LifecycleReport {
    fn display(&self) -> String {
        if self.is_noop() && self.errors.is_empty() {
            return format!(
                "nothing to do ({} stored, {} artifacts checked)",
                format_size(self.stored_bytes_after),
                self.snapshot_rows
            );
        }
        let mut lines = vec![
            format!("expired: {}", self.expired.len()),
            format!("evicted for space: {}", self.evicted.len()),
            format!("orphan files: {}", self.orphans_removed.len()),
            format!(
                "freed: {}",
                format_size(self.bytes_freed + self.orphan_bytes_freed)
            ),
            format!("stored: {}", format_size(self.stored_bytes_after)),
        ];
        for error in &self.errors {
            lines.push(format!("error: {error}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub destination: PathBuf,
    pub artifacts: usize,
}

impl DisplayFallback for BackupResult {
    fn display(&self) -> String {
        format!(
            "library copied to {} ({} artifacts)",
            self.destination.display(),
            self.artifacts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new()?;
        let root = temp.path();
        let config = format!(
            r#"
[paths]
data_dir = "{data}"
storage_dir = "{data}/storage"
staging_dir = "{data}/staging"
library_db = "library.sqlite"
queue_db = "queue.sqlite"

[queue]
idle_recheck_ms = 100

[retention]
retention_hours = 72
max_storage_gb = 5.0
interval_seconds = 3600
orphan_grace_seconds = 3600

[rate_limit]
max_submissions = 2
window_seconds = 3600

[worker]
extract_timeout_seconds = 120
fetch_timeout_seconds = 1800
transcode_timeout_seconds = 1800
thumbnail_timeout_seconds = 60
send_description_default = true

[transcode]
video_codec = "libx264"
profile = "main"
level = "4.0"
pix_fmt = "yuv420p"
preset = "veryfast"
crf = 23
keyint = 48
audio_codec = "aac"
audio_bitrate = "128k"
audio_sample_rate = 44100
faststart = true
thumbnail_max_side = 320

[tools]
yt_dlp = "yt-dlp"
ffmpeg = "ffmpeg"
"#,
            data = root.join("data").display()
        );
        let config_path = root.join("clipkeep.toml");
        fs::write(&config_path, config)?;

        let cli = Cli {
            config: config_path,
            data_dir: None,
            library_db: None,
            queue_db: None,
            format: OutputFormat::Json,
            command: Commands::Init,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    fn seed(context: &AppContext, id: &str, submitter: &str, title: &str) -> Artifact {
        let now = Utc::now();
        let file_path = context.storage.video_path(id, "mp4");
        fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        fs::write(&file_path, b"media").unwrap();
        let artifact = Artifact {
            id: id.to_string(),
            submitter: submitter.to_string(),
            source_url: format!("https://example.com/{id}"),
            title: title.to_string(),
            requested_quality: "best".into(),
            downloaded_quality: "720p".into(),
            original_quality: None,
            size_bytes: 5,
            processing_seconds: 4,
            format: "mp4".into(),
            codec: Some("h264".into()),
            normalized: true,
            source_platform: None,
            file_path: file_path.to_string_lossy().into_owned(),
            thumbnail_path: None,
            width: Some(1280),
            height: Some(720),
            downloaded_at: now,
            expires_at: now + chrono::Duration::hours(72),
            created_at: now,
        };
        context.library.insert_artifact(&artifact).unwrap();
        artifact
    }

    #[tokio::test]
    async fn init_creates_layout() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.init().await.unwrap();
        assert!(report.library_db.is_file());
        assert!(report.storage_root.join("videos").is_dir());
        assert!(report.staging_root.is_dir());
    }

    #[test]
    fn submit_queues_and_limits_within_one_process() {
        let (_temp, context) = prepare_test_context().unwrap();
        let intake = context.intake();
        intake.submit("u1", "https://youtu.be/a", "720p").unwrap();
        intake.submit("u1", "https://youtu.be/b", "best").unwrap();
        let err = intake.submit("u1", "https://youtu.be/c", "best").unwrap_err();
        assert!(matches!(err, IntakeError::RateLimited { .. }));

        let queue = context.queue_show(&QueueArgs { limit: 10 }).unwrap();
        assert_eq!(queue.pending, 2);
        assert_eq!(queue.rows[0].quality, "720p");
        assert!(queue.display().contains("#1 u1 720p"));
    }

    #[test]
    fn listing_and_search() {
        let (_temp, context) = prepare_test_context().unwrap();
        seed(&context, "vid-a", "u1", "Sunset timelapse");
        seed(&context, "vid-b", "u2", "Morning run");

        let all = context
            .list(&ListArgs {
                submitter: None,
                search: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(all.artifacts.len(), 2);

        let found = context
            .list(&ListArgs {
                submitter: None,
                search: Some("sunset".into()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(found.artifacts.len(), 1);
        assert!(found.display().contains("Sunset timelapse"));
    }

    #[tokio::test]
    async fn delete_respects_ownership() {
        let (_temp, context) = prepare_test_context().unwrap();
        let artifact = seed(&context, "vid-a", "u1", "Clip");

        let err = context
            .delete(&DeleteArgs {
                artifact_id: "vid-a".into(),
                submitter: Some("u2".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let result = context
            .delete(&DeleteArgs {
                artifact_id: "vid-a".into(),
                submitter: Some("u1".into()),
            })
            .await
            .unwrap();
        assert!(result.deleted);
        assert_eq!(result.size_bytes, Some(5));
        assert!(!std::path::Path::new(&artifact.file_path).exists());
    }

    #[test]
    fn prefs_default_then_stored() {
        let (_temp, context) = prepare_test_context().unwrap();
        let view = context
            .prefs(&PrefsArgs {
                submitter: "u1".into(),
                send_description: None,
            })
            .unwrap();
        assert!(view.send_description);
        assert!(view.is_default);

        let view = context
            .prefs(&PrefsArgs {
                submitter: "u1".into(),
                send_description: Some(Toggle::Off),
            })
            .unwrap();
        assert!(!view.send_description);
        assert!(!view.is_default);
        assert_eq!(view.display(), "u1: send_description=off");
    }

    #[test]
    fn stats_and_backup() {
        let (temp, context) = prepare_test_context().unwrap();
        seed(&context, "vid-a", "u1", "Clip");
        let stats = context.stats(&StatsArgs { submitter: None }).unwrap();
        assert_eq!(stats.usage.artifact_count, 1);
        assert_eq!(stats.usage.downloads_last_7_days, 1);
        assert_eq!(stats.disk_bytes, 5);

        let destination = temp.path().join("backups").join("library.sqlite");
        let result = context
            .backup(&BackupArgs {
                destination: destination.clone(),
            })
            .unwrap();
        assert_eq!(result.artifacts, 1);
        assert!(destination.is_file());
    }

    #[test]
    fn submission_lines_are_parsed() {
        assert_eq!(
            parse_submission("u1 https://youtu.be/a 720p"),
            Some(SubmissionLine {
                submitter: "u1",
                url: "https://youtu.be/a",
                quality: "720p",
            })
        );
        assert_eq!(parse_submission("u1 https://youtu.be/a").unwrap().quality, "best");
        assert!(parse_submission("   ").is_none());
        assert!(parse_submission("# comment").is_none());
    }
}

mod error;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ClipkeepConfig;
use crate::extract::{CredentialStore, Extractor, FetchedMedia, Resolution};
use crate::job::{FailureKind, Job, JobStage};
use crate::library::{Artifact, SqliteLibraryStore};
use crate::notify::{Notifier, PipelineEvent};
use crate::queue::{QueuedJob, SqliteJobQueue};
use crate::storage::MediaStorage;
use crate::transcode::{even_dimensions, Transcoder};

pub use error::JobFailure;

const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub staging_root: PathBuf,
    pub retention: chrono::Duration,
    pub extract_timeout: Duration,
    pub fetch_timeout: Duration,
    pub transcode_timeout: Duration,
    pub thumbnail_timeout: Duration,
    pub send_description_default: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &ClipkeepConfig) -> Self {
        let worker = &config.worker;
        Self {
            staging_root: config.staging_root(),
            retention: config.retention_period(),
            extract_timeout: Duration::from_secs(worker.extract_timeout_seconds),
            fetch_timeout: Duration::from_secs(worker.fetch_timeout_seconds),
            transcode_timeout: Duration::from_secs(worker.transcode_timeout_seconds),
            thumbnail_timeout: Duration::from_secs(worker.thumbnail_timeout_seconds),
            send_description_default: worker.send_description_default,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Box<Artifact>),
    Failed {
        stage: JobStage,
        kind: FailureKind,
        message: String,
    },
}

impl JobOutcome {
    pub fn stage(&self) -> JobStage {
        match self {
            JobOutcome::Completed(_) => JobStage::Done,
            JobOutcome::Failed { .. } => JobStage::Failed,
        }
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            JobOutcome::Completed(artifact) => Some(artifact.as_ref()),
            JobOutcome::Failed { .. } => None,
        }
    }
}

/// The file chosen for storage after the transcode stage.
#[derive(Debug)]
struct PreparedMedia {
    path: PathBuf,
    format: String,
    codec: Option<String>,
    normalized: bool,
    width: Option<u32>,
    height: Option<u32>,
    thumbnail: Option<PathBuf>,
}

/// Runs one job at a time from the queue through extraction, transcoding,
/// persistence and notification.
pub struct Worker {
    queue: SqliteJobQueue,
    library: SqliteLibraryStore,
    storage: MediaStorage,
    extractor: Arc<dyn Extractor>,
    transcoder: Arc<dyn Transcoder>,
    notifier: Arc<Notifier>,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue.path())
            .field("library", &self.library.path())
            .field("storage", &self.storage.root())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Worker {
    pub fn new(
        queue: SqliteJobQueue,
        library: SqliteLibraryStore,
        storage: MediaStorage,
        extractor: Arc<dyn Extractor>,
        transcoder: Arc<dyn Transcoder>,
        notifier: Arc<Notifier>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            library,
            storage,
            extractor,
            transcoder,
            notifier,
            credentials: CredentialStore::disabled(),
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Processes jobs until `cancel` fires. A job already in flight is
    /// finished before returning. Returns the number of jobs processed.
    pub async fn run(&self, cancel: CancellationToken) -> usize {
        let mut processed = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue() => next,
            };
            match next {
                Ok(queued) => {
                    self.process(queued).await;
                    processed += 1;
                }
                Err(err) => {
                    error!(error = %err, "failed to dequeue job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!(processed, "worker stopped");
        processed
    }

    /// Drives one job to a terminal state. Exactly one `completed` or
    /// `failed` event is published.
    pub async fn process(&self, queued: QueuedJob) -> JobOutcome {
        let QueuedJob { id: job_id, job, .. } = queued;
        let started_at = self.clock.now();
        info!(job_id, submitter = %job.submitter, url = %job.url, quality = %job.quality, "job dequeued");
        self.notifier.publish(PipelineEvent::started(
            &job.submitter,
            job_id,
            &job.url,
            job.quality,
            started_at,
        ));

        let staging = self.settings.staging_root.join(format!("job-{job_id}"));
        let mut stage = JobStage::Dequeued;
        let result = self
            .run_stages(job_id, &job, &staging, started_at, &mut stage)
            .await;
        self.cleanup_staging(&staging).await;

        match result {
            Ok(artifact) => {
                info!(job_id, artifact_id = %artifact.id, size_bytes = artifact.size_bytes, "job done");
                JobOutcome::Completed(Box::new(artifact))
            }
            Err(failure) => {
                let kind = failure.kind();
                let message = failure.to_string();
                warn!(job_id, stage = %stage, kind = %kind, error = %message, "job failed");
                self.notifier.publish(PipelineEvent::failed(
                    &job.submitter,
                    job_id,
                    stage,
                    kind,
                    message.clone(),
                    self.clock.now(),
                ));
                JobOutcome::Failed {
                    stage,
                    kind,
                    message,
                }
            }
        }
    }

    async fn run_stages(
        &self,
        job_id: i64,
        job: &Job,
        staging: &Path,
        started_at: DateTime<Utc>,
        stage: &mut JobStage,
    ) -> Result<Artifact, JobFailure> {
        self.advance(stage, JobStage::Extracting, job_id, job);
        fs::create_dir_all(staging)
            .await
            .map_err(|err| JobFailure::Internal(format!("{}: {err}", staging.display())))?;
        let credentials = self.credentials.lookup(&job.url);
        let resolution = bounded(
            JobStage::Extracting,
            self.settings.extract_timeout,
            self.extractor
                .resolve(&job.url, job.quality, credentials.as_deref()),
        )
        .await?;
        let fetched = bounded(
            JobStage::Extracting,
            self.settings.fetch_timeout,
            self.extractor.fetch(&resolution, &staging.join("source")),
        )
        .await?;
        debug!(job_id, path = %fetched.path.display(), size_bytes = fetched.size_bytes, "source fetched");

        self.advance(stage, JobStage::Transcoding, job_id, job);
        let media = self.prepare_media(job_id, &fetched, staging).await?;

        self.advance(stage, JobStage::Persisting, job_id, job);
        let artifact = self
            .persist(job, &resolution, media, started_at)
            .await?;

        self.advance(stage, JobStage::Notifying, job_id, job);
        let description = self.description_for(job, &resolution);
        let now = self.clock.now();
        self.notifier.publish(PipelineEvent::completed(
            job_id,
            &artifact,
            description.as_deref(),
            now,
        ));
        self.notifier
            .publish(PipelineEvent::stats_changed(&job.submitter, now));
        *stage = JobStage::Done;
        Ok(artifact)
    }

    fn advance(&self, stage: &mut JobStage, next: JobStage, job_id: i64, job: &Job) {
        debug!(job_id, from = %stage, to = %next, "stage transition");
        *stage = next;
        self.notifier.publish(PipelineEvent::progress(
            &job.submitter,
            job_id,
            next,
            self.clock.now(),
        ));
    }

    /// Normalizes video, falling back to the fetched file when the encoder
    /// fails. Audio is stored as fetched.
    async fn prepare_media(
        &self,
        job_id: i64,
        fetched: &FetchedMedia,
        staging: &Path,
    ) -> Result<PreparedMedia, JobFailure> {
        let selection = &fetched.selection;
        if selection.audio_only {
            return Ok(PreparedMedia {
                path: fetched.path.clone(),
                format: extension_of(&fetched.path, selection.container()),
                codec: Some("mp3".to_string()),
                normalized: false,
                width: None,
                height: None,
                thumbnail: None,
            });
        }

        let output = staging.join("normalized.mp4");
        let normalized = bounded(
            JobStage::Transcoding,
            self.settings.transcode_timeout,
            async {
                Ok::<_, JobFailure>(self.transcoder.normalize(&fetched.path, &output).await)
            },
        )
        .await?;

        let mut media = match normalized {
            Ok(result) => {
                let (width, height) = match (selection.width, selection.height) {
                    (Some(w), Some(h)) => {
                        let (w, h) = even_dimensions(w, h);
                        (Some(w), Some(h))
                    }
                    _ => (selection.width, selection.height),
                };
                PreparedMedia {
                    path: result.path,
                    format: "mp4".to_string(),
                    codec: Some(result.video_codec),
                    normalized: true,
                    width,
                    height,
                    thumbnail: None,
                }
            }
            Err(err) => {
                warn!(job_id, error = %err, "normalization failed, keeping original encoding");
                PreparedMedia {
                    path: fetched.path.clone(),
                    format: extension_of(&fetched.path, selection.container()),
                    codec: selection.video_codec.clone(),
                    normalized: false,
                    width: selection.width,
                    height: selection.height,
                    thumbnail: None,
                }
            }
        };

        let thumbnail = staging.join("thumbnail.jpg");
        match tokio::time::timeout(
            self.settings.thumbnail_timeout,
            self.transcoder.thumbnail(&media.path, &thumbnail),
        )
        .await
        {
            Ok(Ok(())) => media.thumbnail = Some(thumbnail),
            Ok(Err(err)) => warn!(job_id, error = %err, "thumbnail generation failed"),
            Err(_) => warn!(job_id, after = ?self.settings.thumbnail_timeout, "thumbnail generation timed out"),
        }
        Ok(media)
    }

    /// Files are placed before the row is written, so a committed row
    /// always points at existing files.
    async fn persist(
        &self,
        job: &Job,
        resolution: &Resolution,
        media: PreparedMedia,
        started_at: DateTime<Utc>,
    ) -> Result<Artifact, JobFailure> {
        let id = Artifact::generate_id();
        let file_path = self.storage.video_path(&id, &media.format);
        let size_bytes = self.storage.place(&media.path, &file_path).await?;

        let mut thumbnail_path = None;
        if let Some(staged) = &media.thumbnail {
            let target = self.storage.thumbnail_path(&id);
            match self.storage.place(staged, &target).await {
                Ok(_) => thumbnail_path = Some(target),
                Err(err) => warn!(artifact_id = %id, error = %err, "failed to store thumbnail"),
            }
        }

        let now = self.clock.now();
        let processing_seconds = (now - started_at).num_seconds().max(0) as u64;
        let artifact = Artifact {
            id,
            submitter: job.submitter.clone(),
            source_url: job.url.clone(),
            title: resolution.title.clone(),
            requested_quality: job.quality.to_string(),
            downloaded_quality: resolution.selection.achieved_quality(),
            original_quality: resolution.original_quality.clone(),
            size_bytes,
            processing_seconds,
            format: media.format,
            codec: media.codec,
            normalized: media.normalized,
            source_platform: resolution.source_platform.clone(),
            file_path: file_path.to_string_lossy().into_owned(),
            thumbnail_path: thumbnail_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
            width: media.width,
            height: media.height,
            downloaded_at: now,
            expires_at: Artifact::expiry_for(now, self.settings.retention),
            created_at: now,
        };

        if let Err(err) = self.library.insert_artifact(&artifact) {
            if let Err(cleanup) = self
                .storage
                .remove_artifact_files(&artifact.file_path, artifact.thumbnail_path.as_deref())
                .await
            {
                warn!(artifact_id = %artifact.id, error = %cleanup, "failed to remove files of unsaved artifact");
            }
            return Err(err.into());
        }
        Ok(artifact)
    }

    fn description_for(&self, job: &Job, resolution: &Resolution) -> Option<String> {
        let description = resolution.description.as_ref()?;
        let default = self.settings.send_description_default;
        let enabled = self
            .library
            .send_description(&job.submitter, default)
            .unwrap_or_else(|err| {
                warn!(submitter = %job.submitter, error = %err, "failed to read preference, using default");
                default
            });
        enabled.then(|| description.clone())
    }

    async fn cleanup_staging(&self, staging: &Path) {
        match fs::remove_dir_all(staging).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %staging.display(), error = %err, "failed to clean staging directory")
            }
        }
    }
}

async fn bounded<T, E, F>(stage: JobStage, limit: Duration, future: F) -> Result<T, JobFailure>
where
    F: Future<Output = Result<T, E>>,
    JobFailure: From<E>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(JobFailure::from),
        Err(_) => Err(JobFailure::Timeout {
            stage,
            after: limit,
        }),
    }
}

fn extension_of(path: &Path, fallback: &str) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| fallback.to_string())
}

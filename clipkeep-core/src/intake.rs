use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::job::{Job, QualityHint};
use crate::library::{LibraryError, SqliteLibraryStore};
use crate::limiter::AdmissionLimiter;
use crate::queue::{QueueError, SqliteJobQueue};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("submitter {submitter} is over the submission quota")]
    RateLimited { submitter: String },
    #[error("storage is full: {used} of {ceiling} bytes in use")]
    StorageFull { used: u64, ceiling: u64 },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Library(#[from] LibraryError),
}

pub type IntakeResult<T> = Result<T, IntakeError>;

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: i64,
    pub job: Job,
    pub remaining: u32,
}

#[derive(Debug, Clone)]
struct CapacityGuard {
    library: SqliteLibraryStore,
    ceiling: u64,
}

/// Front door of the pipeline: validation, admission control, enqueue.
pub struct Intake {
    queue: SqliteJobQueue,
    limiter: Arc<dyn AdmissionLimiter>,
    clock: Arc<dyn Clock>,
    capacity: Option<CapacityGuard>,
}

impl Intake {
    pub fn new(queue: SqliteJobQueue, limiter: Arc<dyn AdmissionLimiter>) -> Self {
        Self {
            queue,
            limiter,
            clock: Arc::new(SystemClock),
            capacity: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Rejects submissions while the stored total is at or above `ceiling`.
    pub fn with_capacity_guard(mut self, library: SqliteLibraryStore, ceiling: u64) -> Self {
        self.capacity = Some(CapacityGuard { library, ceiling });
        self
    }

    pub fn limiter(&self) -> &dyn AdmissionLimiter {
        self.limiter.as_ref()
    }

    /// Checks submitter, URL and quality hint without side effects.
    pub fn validate(&self, submitter: &str, url: &str, quality: &str) -> IntakeResult<Job> {
        let submitter = submitter.trim();
        if submitter.is_empty() {
            return Err(IntakeError::Validation("submitter must not be empty".into()));
        }
        let url = url.trim();
        let parsed = Url::parse(url)
            .map_err(|err| IntakeError::Validation(format!("malformed url {url:?}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(IntakeError::Validation(format!(
                "unsupported url scheme {:?}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(IntakeError::Validation(format!("url {url:?} has no host")));
        }
        let quality: QualityHint = quality
            .parse()
            .map_err(|err: crate::job::QualityParseError| IntakeError::Validation(err.to_string()))?;
        Ok(Job::new(submitter, parsed.as_str(), quality, self.clock.now()))
    }

    pub fn submit(&self, submitter: &str, url: &str, quality: &str) -> IntakeResult<Submission> {
        let job = self.validate(submitter, url, quality)?;

        if let Some(guard) = &self.capacity {
            let used = guard.library.total_size()?;
            if used >= guard.ceiling {
                info!(submitter = %job.submitter, used, ceiling = guard.ceiling, "submission rejected, storage full");
                return Err(IntakeError::StorageFull {
                    used,
                    ceiling: guard.ceiling,
                });
            }
        }

        if !self.limiter.allow(&job.submitter) {
            debug!(submitter = %job.submitter, "submission rate limited");
            return Err(IntakeError::RateLimited {
                submitter: job.submitter,
            });
        }

        let job_id = match self.queue.enqueue(&job) {
            Ok(job_id) => job_id,
            Err(err) => {
                self.limiter.release(&job.submitter);
                return Err(err.into());
            }
        };
        info!(job_id, submitter = %job.submitter, url = %job.url, quality = %job.quality, "job accepted");
        Ok(Submission {
            job_id,
            remaining: self.limiter.remaining(&job.submitter),
            job,
        })
    }
}

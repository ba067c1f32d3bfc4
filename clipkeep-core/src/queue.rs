use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::job::Job;
use crate::sqlite::{open_configured, open_flags};

const QUEUE_SCHEMA: &str = include_str!("../../sql/queue.sql");
const DEFAULT_IDLE_RECHECK: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on queue database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("queue path not configured")]
    MissingStore,
    #[error("job {id} has an unreadable payload: {source}")]
    Payload {
        id: i64,
        source: serde_json::Error,
    },
    #[error("failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A job together with its queue position.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: i64,
    pub job: Job,
    pub enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SqliteJobQueueBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    idle_recheck: Duration,
}

impl Default for SqliteJobQueueBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            idle_recheck: DEFAULT_IDLE_RECHECK,
        }
    }
}

impl SqliteJobQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Upper bound on how long an idle `dequeue` waits before re-reading the
    /// table, which is how jobs enqueued by other processes are noticed.
    pub fn idle_recheck(mut self, value: Duration) -> Self {
        self.idle_recheck = value;
        self
    }

    pub fn build(self) -> QueueResult<SqliteJobQueue> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        Ok(SqliteJobQueue {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
            idle_recheck: self.idle_recheck,
            wakeup: Arc::new(Notify::new()),
        })
    }
}

/// Durable FIFO of download jobs backed by SQLite.
///
/// Dequeue removes the row inside an immediate transaction, so a job is
/// handed to exactly one consumer. Delivery is at-most-once: a job that was
/// dequeued but never finished because the process died is not redelivered.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    path: PathBuf,
    flags: OpenFlags,
    idle_recheck: Duration,
    wakeup: Arc<Notify>,
}

impl SqliteJobQueue {
    pub fn builder() -> SqliteJobQueueBuilder {
        SqliteJobQueueBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        SqliteJobQueueBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> QueueResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    pub fn enqueue(&self, job: &Job) -> QueueResult<i64> {
        let payload = serde_json::to_string(job)?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO download_jobs (submitter, url, quality, payload) VALUES (?1, ?2, ?3, ?4)",
            params![&job.submitter, &job.url, job.quality.to_string(), payload],
        )?;
        let id = conn.last_insert_rowid();
        debug!(job_id = id, submitter = %job.submitter, "job enqueued");
        self.wakeup.notify_waiters();
        Ok(id)
    }

    /// Removes and returns the oldest job, if any.
    pub fn try_dequeue(&self) -> QueueResult<Option<QueuedJob>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let head = tx
            .query_row(
                "SELECT id, payload, enqueued_at FROM download_jobs ORDER BY id ASC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<NaiveDateTime>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, payload, enqueued_at)) = head else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute("DELETE FROM download_jobs WHERE id = ?1", [id])?;
        tx.commit()?;

        let job = serde_json::from_str(&payload).map_err(|source| QueueError::Payload { id, source })?;
        Ok(Some(QueuedJob {
            id,
            job,
            enqueued_at: enqueued_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
        }))
    }

    /// Waits until a job is available and removes it from the queue.
    ///
    /// Local producers wake waiters immediately; producers in other
    /// processes are seen after at most the configured idle recheck.
    pub async fn dequeue(&self) -> QueueResult<QueuedJob> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_dequeue()? {
                return Ok(job);
            }
            let _ = tokio::time::timeout(self.idle_recheck, notified).await;
        }
    }

    pub fn len(&self) -> QueueResult<usize> {
        let conn = self.open()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM download_jobs", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Pending jobs in delivery order, without removing them.
    pub fn peek(&self, limit: usize) -> QueueResult<Vec<QueuedJob>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload, enqueued_at FROM download_jobs ORDER BY id ASC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let enqueued_at: Option<NaiveDateTime> = row.get(2)?;
            let job = serde_json::from_str(&payload)
                .map_err(|source| QueueError::Payload { id, source })?;
            jobs.push(QueuedJob {
                id,
                job,
                enqueued_at: enqueued_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            });
        }
        Ok(jobs)
    }
}

mod reaper;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ClipkeepConfig;
use crate::library::{LibraryError, SnapshotEntry, SqliteLibraryStore};
use crate::storage::{MediaStorage, StorageError};

pub use reaper::{ArtifactReaper, DeletionReason};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    pub capacity_ceiling_bytes: u64,
    pub orphan_grace: chrono::Duration,
}

impl LifecyclePolicy {
    pub fn from_config(config: &ClipkeepConfig) -> Self {
        Self {
            capacity_ceiling_bytes: config.capacity_ceiling_bytes(),
            orphan_grace: config.orphan_grace(),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub snapshot_rows: usize,
    pub expired: Vec<String>,
    pub evicted: Vec<String>,
    pub bytes_freed: u64,
    pub orphans_removed: Vec<String>,
    pub orphan_bytes_freed: u64,
    pub stored_bytes_after: u64,
    pub errors: Vec<String>,
}

impl LifecycleReport {
    pub fn deleted_count(&self) -> usize {
        self.expired.len() + self.evicted.len()
    }

    pub fn is_noop(&self) -> bool {
        self.deleted_count() == 0 && self.orphans_removed.is_empty()
    }
}

/// Age and capacity eviction over a snapshot of the library.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    library: SqliteLibraryStore,
    storage: MediaStorage,
    reaper: ArtifactReaper,
    policy: LifecyclePolicy,
}

impl LifecycleManager {
    pub fn new(
        library: SqliteLibraryStore,
        storage: MediaStorage,
        reaper: ArtifactReaper,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            library,
            storage,
            reaper,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Runs the age pass, then the capacity pass, then the orphan sweep.
    ///
    /// Only rows present in the snapshot taken at the start are candidates.
    /// Per-artifact failures are recorded in the report and the pass goes on.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> LifecycleResult<LifecycleReport> {
        let snapshot = self.library.snapshot()?;
        self.run_pass_over(&snapshot, now).await
    }

    async fn run_pass_over(
        &self,
        snapshot: &[SnapshotEntry],
        now: DateTime<Utc>,
    ) -> LifecycleResult<LifecycleReport> {
        let mut report = LifecycleReport {
            snapshot_rows: snapshot.len(),
            ..LifecycleReport::default()
        };
        let mut handled: HashSet<&str> = HashSet::new();

        for entry in snapshot.iter().filter(|entry| entry.is_expired(now)) {
            handled.insert(entry.id.as_str());
            match self.reaper.delete(&entry.id, DeletionReason::Expired, now).await {
                Ok(Some(artifact)) => {
                    report.bytes_freed += artifact.size_bytes;
                    report.expired.push(artifact.id);
                }
                Ok(None) => {}
                Err(err) => record_failure(&mut report, entry, &err),
            }
        }

        let ceiling = self.policy.capacity_ceiling_bytes;
        let mut total = self.library.total_size()?;
        if total > ceiling {
            info!(total, ceiling, "storage over capacity");
        }
        let mut candidates = snapshot
            .iter()
            .filter(|entry| !handled.contains(entry.id.as_str()));
        while total > ceiling {
            let Some(entry) = candidates.next() else {
                warn!(total, ceiling, "no eviction candidates left; still over capacity");
                break;
            };
            match self.reaper.delete(&entry.id, DeletionReason::Capacity, now).await {
                Ok(Some(artifact)) => {
                    total = total.saturating_sub(artifact.size_bytes);
                    report.bytes_freed += artifact.size_bytes;
                    report.evicted.push(artifact.id);
                }
                Ok(None) => total = total.saturating_sub(entry.size_bytes),
                Err(err) => record_failure(&mut report, entry, &err),
            }
        }

        self.sweep_orphans(now, &mut report).await?;
        report.stored_bytes_after = self.library.total_size()?;

        if !report.is_noop() || !report.errors.is_empty() {
            info!(
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                orphans = report.orphans_removed.len(),
                bytes_freed = report.bytes_freed + report.orphan_bytes_freed,
                errors = report.errors.len(),
                "lifecycle pass finished"
            );
        }
        Ok(report)
    }

    /// Removes files no row references once they are older than the grace
    /// period. Files are listed before references are read, so a file whose
    /// row is committed during the sweep is never removed.
    async fn sweep_orphans(
        &self,
        now: DateTime<Utc>,
        report: &mut LifecycleReport,
    ) -> LifecycleResult<()> {
        let files = self.storage.stored_files()?;
        let referenced = self.library.referenced_paths()?;
        let Some(cutoff) = now.checked_sub_signed(self.policy.orphan_grace) else {
            return Ok(());
        };

        for file in files {
            let path = file.path.to_string_lossy().into_owned();
            if referenced.contains(&path) {
                continue;
            }
            let Some(modified) = file.modified.map(DateTime::<Utc>::from) else {
                continue;
            };
            if modified > cutoff {
                continue;
            }
            match self.storage.remove_file_if_exists(&file.path).await {
                Ok(true) => {
                    info!(path = %path, size_bytes = file.size_bytes, "orphan file removed");
                    report.orphan_bytes_freed += file.size_bytes;
                    report.orphans_removed.push(path);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to remove orphan file");
                    report.errors.push(format!("orphan {path}: {err}"));
                }
            }
        }
        Ok(())
    }
}

fn record_failure(report: &mut LifecycleReport, entry: &SnapshotEntry, err: &LifecycleError) {
    warn!(artifact_id = %entry.id, error = %err, "failed to delete artifact");
    report.errors.push(format!("{}: {err}", entry.id));
}

/// Triggers [`LifecycleManager::run_pass`] on a fixed interval.
pub struct LifecycleScheduler {
    manager: Arc<LifecycleManager>,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl LifecycleScheduler {
    pub fn new(manager: Arc<LifecycleManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The first pass runs immediately. Returns the number of passes run.
    pub async fn run(&self, cancel: CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            passes += 1;
            if let Err(err) = self.manager.run_pass(self.clock.now()).await {
                error!(error = %err, "lifecycle pass failed");
            }
        }
        info!(passes, "lifecycle scheduler stopped");
        passes
    }
}

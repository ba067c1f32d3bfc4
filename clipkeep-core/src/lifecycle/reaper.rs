use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::library::{Artifact, SqliteLibraryStore};
use crate::notify::{Notifier, PipelineEvent};
use crate::storage::MediaStorage;

use super::LifecycleResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    Expired,
    Capacity,
    Requested,
}

impl DeletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionReason::Expired => "expired",
            DeletionReason::Capacity => "capacity",
            DeletionReason::Requested => "requested",
        }
    }
}

impl fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one way an artifact leaves the system. Used by both lifecycle passes
/// and by explicit deletes.
///
/// The row goes first, then the files: a crash in between leaves an
/// unreferenced file for the orphan sweep, never a row without its file.
#[derive(Debug, Clone)]
pub struct ArtifactReaper {
    library: SqliteLibraryStore,
    storage: MediaStorage,
    notifier: Arc<Notifier>,
}

impl ArtifactReaper {
    pub fn new(library: SqliteLibraryStore, storage: MediaStorage, notifier: Arc<Notifier>) -> Self {
        Self {
            library,
            storage,
            notifier,
        }
    }

    /// Returns the removed artifact, or `None` if the id was already gone.
    pub async fn delete(
        &self,
        id: &str,
        reason: DeletionReason,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Option<Artifact>> {
        let Some(artifact) = self.library.remove_artifact(id, now)? else {
            debug!(artifact_id = id, reason = %reason, "artifact already removed");
            return Ok(None);
        };

        if let Err(err) = self
            .storage
            .remove_artifact_files(&artifact.file_path, artifact.thumbnail_path.as_deref())
            .await
        {
            warn!(artifact_id = id, error = %err, "row removed but files remain; left for orphan sweep");
        }

        info!(
            artifact_id = id,
            reason = %reason,
            size_bytes = artifact.size_bytes,
            "artifact deleted"
        );
        self.notifier
            .publish(PipelineEvent::artifact_deleted(&artifact, reason, now));
        self.notifier
            .publish(PipelineEvent::stats_changed(&artifact.submitter, now));
        Ok(Some(artifact))
    }
}

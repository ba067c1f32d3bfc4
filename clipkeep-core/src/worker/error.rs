use std::time::Duration;

use thiserror::Error;

use crate::extract::ExtractError;
use crate::job::{FailureKind, JobStage};
use crate::library::LibraryError;
use crate::storage::StorageError;

/// Why a job ended in `Failed`.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: JobStage, after: Duration },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobFailure::Extraction(err) if err.is_auth_required() => FailureKind::AuthRequired,
            JobFailure::Extraction(_) => FailureKind::Extraction,
            JobFailure::Timeout { .. } => FailureKind::Timeout,
            JobFailure::Persistence(_) => FailureKind::Persistence,
            JobFailure::Internal(_) => FailureKind::Internal,
        }
    }
}

impl From<LibraryError> for JobFailure {
    fn from(error: LibraryError) -> Self {
        JobFailure::Persistence(error.to_string())
    }
}

impl From<StorageError> for JobFailure {
    fn from(error: StorageError) -> Self {
        JobFailure::Persistence(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_map_to_kinds() {
        let auth = JobFailure::from(ExtractError::AuthRequired("private video".into()));
        assert_eq!(auth.kind(), FailureKind::AuthRequired);
        let gone = JobFailure::from(ExtractError::Unavailable("404".into()));
        assert_eq!(gone.kind(), FailureKind::Extraction);
        let slow = JobFailure::Timeout {
            stage: JobStage::Extracting,
            after: Duration::from_secs(120),
        };
        assert_eq!(slow.kind(), FailureKind::Timeout);
        assert_eq!(slow.to_string(), "extracting timed out after 120s");
        assert_eq!(
            JobFailure::from(LibraryError::MissingStore).kind(),
            FailureKind::Persistence
        );
    }
}

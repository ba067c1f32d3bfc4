use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tallest height accepted in a quality hint.
pub const MAX_HEIGHT: u32 = 4320;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid quality hint: {0:?}")]
pub struct QualityParseError(pub String);

/// What the submitter asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum QualityHint {
    Best,
    MaxHeight(u32),
    AudioOnly,
}

impl QualityHint {
    pub fn max_height(&self) -> Option<u32> {
        match self {
            QualityHint::MaxHeight(height) => Some(*height),
            _ => None,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, QualityHint::AudioOnly)
    }
}

impl Default for QualityHint {
    fn default() -> Self {
        QualityHint::Best
    }
}

impl fmt::Display for QualityHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityHint::Best => write!(f, "best"),
            QualityHint::AudioOnly => write!(f, "audio"),
            QualityHint::MaxHeight(height) => write!(f, "{height}p"),
        }
    }
}

impl FromStr for QualityHint {
    type Err = QualityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "best" => Ok(QualityHint::Best),
            "audio" | "mp3" => Ok(QualityHint::AudioOnly),
            other => {
                let digits = other.strip_suffix('p').unwrap_or(other);
                match digits.parse::<u32>() {
                    Ok(height) if height > 0 && height <= MAX_HEIGHT => {
                        Ok(QualityHint::MaxHeight(height))
                    }
                    _ => Err(QualityParseError(s.to_string())),
                }
            }
        }
    }
}

impl From<QualityHint> for String {
    fn from(value: QualityHint) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for QualityHint {
    type Error = QualityParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A queued download request. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub submitter: String,
    pub url: String,
    pub quality: QualityHint,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        submitter: impl Into<String>,
        url: impl Into<String>,
        quality: QualityHint,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            submitter: submitter.into(),
            url: url.into(),
            quality,
            submitted_at,
        }
    }
}

/// Pipeline position of a job inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Dequeued,
    Extracting,
    Transcoding,
    Persisting,
    Notifying,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Dequeued => "dequeued",
            JobStage::Extracting => "extracting",
            JobStage::Transcoding => "transcoding",
            JobStage::Persisting => "persisting",
            JobStage::Notifying => "notifying",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification carried by a `failed` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Extraction,
    AuthRequired,
    Timeout,
    Persistence,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Extraction => "extraction",
            FailureKind::AuthRequired => "auth_required",
            FailureKind::Timeout => "timeout",
            FailureKind::Persistence => "persistence",
            FailureKind::Internal => "internal",
        }
    }

    /// Short message suitable for the submitter.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::Extraction => "the source could not be downloaded",
            FailureKind::AuthRequired => "the source requires login; credentials are missing or expired",
            FailureKind::Timeout => "processing took too long and was aborted",
            FailureKind::Persistence => "the download could not be saved",
            FailureKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

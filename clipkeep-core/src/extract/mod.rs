//! Media extraction: resolve a URL into metadata and a stream choice, then
//! fetch the chosen streams into a staging directory.

mod credentials;
mod select;
mod ytdlp;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::job::QualityHint;

pub use credentials::{CredentialStore, DEFAULT_PLATFORMS};
pub use select::{original_quality, select_stream, FormatDescriptor, StreamSelection};
pub use ytdlp::YtDlpExtractor;

/// Tool output fragments that mean the source needs a logged-in session.
const AUTH_MARKERS: &[&str] = &[
    "login",
    "log in",
    "sign in",
    "private",
    "authentication",
    "cookies",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source requires authentication: {0}")]
    AuthRequired(String),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse extractor output: {0}")]
    Parse(String),
    #[error("no usable formats for {url}")]
    NoFormats { url: String },
}

impl ExtractError {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, ExtractError::AuthRequired(_))
    }

    /// Classifies a failed tool run from its diagnostic output.
    pub fn from_tool_output(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            ExtractError::AuthRequired(message)
        } else {
            ExtractError::Unavailable(message)
        }
    }
}

pub type ExtractResult<T> = Result<T, ExtractError>;

/// Everything known about a source before any media bytes are fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub url: String,
    pub media_id: String,
    pub title: String,
    pub description: Option<String>,
    pub source_platform: Option<String>,
    pub duration_seconds: Option<f64>,
    pub formats: Vec<FormatDescriptor>,
    pub selection: StreamSelection,
    pub original_quality: Option<String>,
    pub credentials: Option<PathBuf>,
}

/// A fetched file in staging, in the container the selection asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub selection: StreamSelection,
}

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    async fn resolve(
        &self,
        url: &str,
        hint: QualityHint,
        credentials: Option<&Path>,
    ) -> ExtractResult<Resolution>;

    async fn fetch(&self, resolution: &Resolution, dest_dir: &Path) -> ExtractResult<FetchedMedia>;
}

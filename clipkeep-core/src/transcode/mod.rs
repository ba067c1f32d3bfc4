mod ffmpeg;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use ffmpeg::{FfmpegTranscoder, TranscodeProfile};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("encoder produced no output at {path}")]
    MissingOutput { path: PathBuf },
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// Result of a successful normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMedia {
    pub path: PathBuf,
    pub video_codec: String,
    pub size_bytes: u64,
}

#[async_trait::async_trait]
pub trait Transcoder: Send + Sync {
    /// Re-encodes `input` into the universally playable profile at `output`.
    async fn normalize(&self, input: &Path, output: &Path) -> TranscodeResult<NormalizedMedia>;

    /// Writes one JPEG frame of `input` to `output`.
    async fn thumbnail(&self, input: &Path, output: &Path) -> TranscodeResult<()>;
}

/// Odd dimensions rounded down to even, as the encoder's scale filter does.
pub fn even_dimensions(width: u32, height: u32) -> (u32, u32) {
    (width - width % 2, height - height % 2)
}

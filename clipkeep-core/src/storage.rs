use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        source: io::Error,
        path: PathBuf,
    },
    #[error("failed to walk storage root {path}: {source}")]
    Walk {
        source: walkdir::Error,
        path: PathBuf,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A file found under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

/// Directory layout for finished media:
/// `<root>/videos/<id>.<ext>` and `<root>/thumbnails/<id>.jpg`.
#[derive(Debug, Clone)]
pub struct MediaStorage {
    root: PathBuf,
    videos_dir: PathBuf,
    thumbnails_dir: PathBuf,
}

impl MediaStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            videos_dir: root.join("videos"),
            thumbnails_dir: root.join("thumbnails"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_layout(&self) -> StorageResult<()> {
        for dir in [&self.videos_dir, &self.thumbnails_dir] {
            fs::create_dir_all(dir).await.map_err(|source| StorageError::Io {
                source,
                path: dir.clone(),
            })?;
        }
        Ok(())
    }

    pub fn video_path(&self, id: &str, extension: &str) -> PathBuf {
        self.videos_dir.join(format!("{id}.{extension}"))
    }

    pub fn thumbnail_path(&self, id: &str) -> PathBuf {
        self.thumbnails_dir.join(format!("{id}.jpg"))
    }

    /// Moves a finished file into storage. Falls back to copy and remove when
    /// staging and storage live on different filesystems. The placed file's
    /// modification time is set to now.
    pub async fn place(&self, from: &Path, to: &Path) -> StorageResult<u64> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        if let Err(err) = fs::rename(from, to).await {
            debug!(from = %from.display(), to = %to.display(), error = %err, "rename failed, copying");
            fs::copy(from, to)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: to.to_path_buf(),
                })?;
            if let Err(err) = fs::remove_file(from).await {
                warn!(path = %from.display(), error = %err, "failed to remove staged file after copy");
            }
        }
        let io_error = |source| StorageError::Io {
            source,
            path: to.to_path_buf(),
        };
        let file = fs::OpenOptions::new()
            .write(true)
            .open(to)
            .await
            .map_err(io_error)?
            .into_std()
            .await;
        file.set_modified(SystemTime::now()).map_err(io_error)?;
        let metadata = file.metadata().map_err(io_error)?;
        Ok(metadata.len())
    }

    /// Returns `Ok(false)` when the file was already gone.
    pub async fn remove_file_if_exists(&self, path: &Path) -> StorageResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io {
                source,
                path: path.to_path_buf(),
            }),
        }
    }

    /// Removes the media file and optional thumbnail; returns how many existed.
    pub async fn remove_artifact_files(
        &self,
        file_path: &str,
        thumbnail_path: Option<&str>,
    ) -> StorageResult<usize> {
        let mut removed = 0;
        if self.remove_file_if_exists(Path::new(file_path)).await? {
            removed += 1;
        }
        if let Some(thumbnail) = thumbnail_path {
            if self.remove_file_if_exists(Path::new(thumbnail)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Every regular file in the videos and thumbnails directories. Nothing
    /// else under the root is listed. Missing directories yield no files.
    pub fn stored_files(&self) -> StorageResult<Vec<StoredFile>> {
        let mut files = Vec::new();
        for dir in [&self.videos_dir, &self.thumbnails_dir] {
            if dir.is_dir() {
                collect_files(dir, &mut files)?;
            }
        }
        Ok(files)
    }

    /// Bytes held by [`stored_files`](Self::stored_files).
    pub fn disk_usage(&self) -> StorageResult<u64> {
        Ok(self.stored_files()?.iter().map(|file| file.size_bytes).sum())
    }
}

fn collect_files(dir: &Path, files: &mut Vec<StoredFile>) -> StorageResult<()> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|source| StorageError::Walk {
            source,
            path: dir.to_path_buf(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(|source| StorageError::Walk {
            source,
            path: entry.path().to_path_buf(),
        })?;
        files.push(StoredFile {
            path: entry.into_path(),
            size_bytes: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }
    Ok(())
}

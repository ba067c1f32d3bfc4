use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("library store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("artifact {id} already exists")]
    Duplicate { id: String },
    #[error("value for {field} does not fit in a database integer: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

pub type LibraryResult<T> = std::result::Result<T, LibraryError>;

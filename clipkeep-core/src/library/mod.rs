mod error;
mod models;
mod store;

pub use error::{LibraryError, LibraryResult};
pub use models::{
    ActionEvent, ActionKind, Artifact, SnapshotEntry, SubmitterPreference, UsageStats,
};
pub use store::{SqliteLibraryStore, SqliteLibraryStoreBuilder};

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod extract;
pub mod format;
pub mod intake;
pub mod job;
pub mod library;
pub mod lifecycle;
pub mod limiter;
pub mod notify;
pub mod queue;
pub mod sqlite;
pub mod storage;
pub mod transcode;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandExecutor, SystemCommandExecutor};
pub use config::{load_config, ClipkeepConfig};
pub use error::{ConfigError, Result};
pub use extract::{
    select_stream, CredentialStore, ExtractError, ExtractResult, Extractor, FetchedMedia,
    FormatDescriptor, Resolution, StreamSelection, YtDlpExtractor,
};
pub use format::{format_duration, format_size, format_time_remaining};
pub use intake::{Intake, IntakeError, IntakeResult, Submission};
pub use job::{FailureKind, Job, JobStage, QualityHint};
pub use library::{
    ActionEvent, ActionKind, Artifact, LibraryError, LibraryResult, SnapshotEntry,
    SqliteLibraryStore, SqliteLibraryStoreBuilder, SubmitterPreference, UsageStats,
};
pub use lifecycle::{
    ArtifactReaper, DeletionReason, LifecycleError, LifecycleManager, LifecyclePolicy,
    LifecycleReport, LifecycleResult, LifecycleScheduler,
};
pub use limiter::{AdmissionLimiter, SlidingWindowLimiter};
pub use notify::{EventKind, EventPayload, Notifier, PipelineEvent, Subscription};
pub use queue::{QueueError, QueueResult, QueuedJob, SqliteJobQueue, SqliteJobQueueBuilder};
pub use storage::{MediaStorage, StorageError, StorageResult, StoredFile};
pub use transcode::{
    even_dimensions, FfmpegTranscoder, NormalizedMedia, TranscodeError, TranscodeProfile,
    TranscodeResult, Transcoder,
};
pub use worker::{JobFailure, JobOutcome, Worker, WorkerSettings};

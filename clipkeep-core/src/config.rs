use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Ten years, the longest retention or grace period accepted.
pub const MAX_RETENTION_HOURS: u32 = 24 * 365 * 10;
pub const MAX_ORPHAN_GRACE_SECONDS: u64 = MAX_RETENTION_HOURS as u64 * 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClipkeepConfig {
    pub paths: PathsSection,
    pub queue: QueueSection,
    pub retention: RetentionSection,
    pub rate_limit: RateLimitSection,
    pub worker: WorkerSection,
    pub transcode: TranscodeSection,
    pub tools: ToolsSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
}

impl ClipkeepConfig {
    /// Relative paths are resolved against `paths.data_dir`.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn library_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.library_db)
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.queue_db)
    }

    pub fn storage_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.storage_dir)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.staging_dir)
    }

    pub fn retention_period(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(
            self.retention.retention_hours.min(MAX_RETENTION_HOURS),
        ))
    }

    /// How old an unreferenced media file must be before the sweep removes it.
    pub fn orphan_grace(&self) -> chrono::Duration {
        let seconds = self.retention.orphan_grace_seconds.min(MAX_ORPHAN_GRACE_SECONDS);
        chrono::Duration::seconds(seconds as i64)
    }

    pub fn capacity_ceiling_bytes(&self) -> u64 {
        (self.retention.max_storage_gb * BYTES_PER_GB) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.retention_hours == 0
            || self.retention.retention_hours > MAX_RETENTION_HOURS
        {
            return Err(ConfigError::Invalid {
                field: "retention.retention_hours",
                reason: format!(
                    "must be between 1 and {MAX_RETENTION_HOURS}, got {}",
                    self.retention.retention_hours
                ),
            });
        }
        let worker = &self.worker;
        let placement_window = worker
            .transcode_timeout_seconds
            .saturating_add(worker.thumbnail_timeout_seconds);
        let grace = self.retention.orphan_grace_seconds;
        if grace <= placement_window || grace > MAX_ORPHAN_GRACE_SECONDS {
            return Err(ConfigError::Invalid {
                field: "retention.orphan_grace_seconds",
                reason: format!(
                    "must exceed transcode plus thumbnail timeouts ({placement_window}s) \
                     and be at most {MAX_ORPHAN_GRACE_SECONDS}, got {grace}"
                ),
            });
        }
        if !(self.retention.max_storage_gb > 0.0) {
            return Err(ConfigError::Invalid {
                field: "retention.max_storage_gb",
                reason: format!("must be positive, got {}", self.retention.max_storage_gb),
            });
        }
        if self.retention.interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "retention.interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.rate_limit.max_submissions == 0 || self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit",
                reason: "quota and window must both be greater than zero".into(),
            });
        }
        if self.transcode.keyint == 0 {
            return Err(ConfigError::Invalid {
                field: "transcode.keyint",
                reason: "must be greater than zero".into(),
            });
        }
        let storage = self.storage_root();
        let mut outside_storage = vec![
            ("paths.staging_dir", self.staging_root()),
            ("paths.library_db", self.library_db_path()),
            ("paths.queue_db", self.queue_db_path()),
        ];
        if let Some(dir) = &self.credentials.cookies_dir {
            outside_storage.push(("credentials.cookies_dir", self.resolve_path(dir)));
        }
        for (field, path) in outside_storage {
            if path.starts_with(&storage) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!(
                        "{} must not live inside the storage root {}",
                        path.display(),
                        storage.display()
                    ),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub storage_dir: String,
    pub staging_dir: String,
    pub library_db: String,
    pub queue_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    pub idle_recheck_ms: u64,
}

impl QueueSection {
    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSection {
    pub retention_hours: u32,
    pub max_storage_gb: f64,
    pub interval_seconds: u64,
    pub orphan_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    pub max_submissions: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub extract_timeout_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub transcode_timeout_seconds: u64,
    pub thumbnail_timeout_seconds: u64,
    pub send_description_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub video_codec: String,
    pub profile: String,
    pub level: String,
    pub pix_fmt: String,
    pub preset: String,
    pub crf: u8,
    pub keyint: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub faststart: bool,
    pub thumbnail_max_side: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub yt_dlp: String,
    pub ffmpeg: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsSection {
    pub cookies_dir: Option<String>,
    /// Host suffix to cookie file name, e.g. `"x.com" = "twitter.txt"`.
    #[serde(default)]
    pub platforms: BTreeMap<String, String>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClipkeepConfig> {
    let config: ClipkeepConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

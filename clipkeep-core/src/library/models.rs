use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::sqlite::from_epoch;

/// A stored, playable media file and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub submitter: String,
    pub source_url: String,
    pub title: String,
    pub requested_quality: String,
    pub downloaded_quality: String,
    pub original_quality: Option<String>,
    pub size_bytes: u64,
    pub processing_seconds: u64,
    pub format: String,
    pub codec: Option<String>,
    pub normalized: bool,
    pub source_platform: Option<String>,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub downloaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn generate_id() -> String {
        format!("vid-{}", uuid::Uuid::new_v4().simple())
    }

    /// Expiry is fixed when the artifact is created and never extended.
    pub fn expiry_for(downloaded_at: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
        downloaded_at + retention
    }

    pub fn is_audio(&self) -> bool {
        self.format == "mp3"
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            submitter: row.get("submitter")?,
            source_url: row.get("source_url")?,
            title: row.get("title")?,
            requested_quality: row.get("requested_quality")?,
            downloaded_quality: row.get("downloaded_quality")?,
            original_quality: row.get("original_quality")?,
            size_bytes: non_negative(row, "size_bytes")?,
            processing_seconds: non_negative(row, "processing_seconds")?,
            format: row.get("format")?,
            codec: row.get("codec")?,
            normalized: row.get::<_, i64>("normalized")? != 0,
            source_platform: row.get("source_platform")?,
            file_path: row.get("file_path")?,
            thumbnail_path: row.get("thumbnail_path")?,
            width: row.get("width")?,
            height: row.get("height")?,
            downloaded_at: epoch_column(row, "downloaded_at")?,
            expires_at: epoch_column(row, "expires_at")?,
            created_at: epoch_column(row, "created_at")?,
        })
    }
}

/// The columns the lifecycle pass needs, captured at the start of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: String,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SnapshotEntry {
    /// Expiry is inclusive: a row is due at its `expires_at` second.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            size_bytes: non_negative(row, "size_bytes")?,
            downloaded_at: epoch_column(row, "downloaded_at")?,
            expires_at: epoch_column(row, "expires_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Download,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Download => "download",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(ActionKind::Download),
            "delete" => Ok(ActionKind::Delete),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Append-only audit record; used for statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEvent {
    pub id: i64,
    pub submitter: String,
    pub artifact_id: String,
    pub action: ActionKind,
    pub recorded_at: DateTime<Utc>,
}

impl ActionEvent {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let action: String = row.get("action")?;
        Ok(Self {
            id: row.get("id")?,
            submitter: row.get("submitter")?,
            artifact_id: row.get("artifact_id")?,
            action: action.parse().map_err(|err: String| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, err.into())
            })?,
            recorded_at: epoch_column(row, "recorded_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitterPreference {
    pub submitter: String,
    pub send_description: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmitterPreference {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            submitter: row.get("submitter")?,
            send_description: row.get::<_, i64>("send_description")? != 0,
            created_at: epoch_column(row, "created_at")?,
            updated_at: epoch_column(row, "updated_at")?,
        })
    }
}

/// Totals for one submitter, or for everyone when `submitter` is `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub submitter: Option<String>,
    pub artifact_count: u64,
    pub used_bytes: u64,
    pub downloads_last_7_days: u64,
    pub downloads_last_30_days: u64,
    pub deletes_last_30_days: u64,
}

fn epoch_column(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let index = row.as_ref().column_index(name)?;
    from_epoch(index, row.get(index)?)
}

fn non_negative(row: &Row<'_>, name: &str) -> rusqlite::Result<u64> {
    let index = row.as_ref().column_index(name)?;
    let value: i64 = row.get(index)?;
    u64::try_from(value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiry_is_download_plus_retention() {
        let downloaded = Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap();
        let expires = Artifact::expiry_for(downloaded, Duration::hours(72));
        assert_eq!(expires, Utc.with_ymd_and_hms(2026, 4, 5, 10, 0, 0).unwrap());
    }

    #[test]
    fn generated_ids_are_prefixed() {
        let id = Artifact::generate_id();
        assert!(id.starts_with("vid-"));
        assert_eq!(id.len(), 4 + 32);
    }

    #[test]
    fn action_kind_round_trips_through_text() {
        assert_eq!("delete".parse::<ActionKind>().unwrap(), ActionKind::Delete);
        assert!("rename".parse::<ActionKind>().is_err());
    }
}

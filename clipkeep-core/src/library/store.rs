use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use tracing::debug;

use crate::sqlite::{configure_connection, open_configured, open_flags, to_epoch};

use super::models::{
    ActionEvent, ActionKind, Artifact, SnapshotEntry, SubmitterPreference, UsageStats,
};
use super::{LibraryError, LibraryResult};

const LIBRARY_SCHEMA: &str = include_str!("../../../sql/library.sql");

#[derive(Debug, Clone)]
pub struct SqliteLibraryStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteLibraryStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteLibraryStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> LibraryResult<SqliteLibraryStore> {
        let path = self.path.ok_or(LibraryError::MissingStore)?;
        Ok(SqliteLibraryStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

/// Artifacts, action events and submitter preferences.
#[derive(Debug, Clone)]
pub struct SqliteLibraryStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteLibraryStore {
    pub fn builder() -> SqliteLibraryStoreBuilder {
        SqliteLibraryStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> LibraryResult<Self> {
        SqliteLibraryStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> LibraryResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| LibraryError::OpenDatabase {
            path: self.path.clone(),
            source,
        })
    }

    pub fn initialize(&self) -> LibraryResult<()> {
        let conn = self.open()?;
        conn.execute_batch(LIBRARY_SCHEMA)?;
        Ok(())
    }

    /// Inserts the artifact row and its `download` event in one transaction.
    pub fn insert_artifact(&self, artifact: &Artifact) -> LibraryResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO artifacts (
                id, submitter, source_url, title, requested_quality, downloaded_quality,
                original_quality, size_bytes, processing_seconds, format, codec, normalized,
                source_platform, file_path, thumbnail_path, width, height,
                downloaded_at, expires_at, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20
            )",
            params![
                &artifact.id,
                &artifact.submitter,
                &artifact.source_url,
                &artifact.title,
                &artifact.requested_quality,
                &artifact.downloaded_quality,
                &artifact.original_quality,
                sql_int("size_bytes", artifact.size_bytes)?,
                sql_int("processing_seconds", artifact.processing_seconds)?,
                &artifact.format,
                &artifact.codec,
                if artifact.normalized { 1 } else { 0 },
                &artifact.source_platform,
                &artifact.file_path,
                &artifact.thumbnail_path,
                artifact.width,
                artifact.height,
                to_epoch(artifact.downloaded_at),
                to_epoch(artifact.expires_at),
                to_epoch(artifact.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(LibraryError::Duplicate {
                    id: artifact.id.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        insert_action(
            &tx,
            &artifact.submitter,
            &artifact.id,
            ActionKind::Download,
            artifact.created_at,
        )?;
        tx.commit()?;
        debug!(artifact_id = %artifact.id, size_bytes = artifact.size_bytes, "artifact stored");
        Ok(())
    }

    pub fn fetch_artifact(&self, id: &str) -> LibraryResult<Option<Artifact>> {
        let conn = self.open()?;
        let artifact = conn
            .query_row("SELECT * FROM artifacts WHERE id = ?1", [id], |row| {
                Artifact::from_row(row)
            })
            .optional()?;
        Ok(artifact)
    }

    /// Newest first, optionally restricted to one submitter.
    pub fn list_artifacts(
        &self,
        submitter: Option<&str>,
        limit: usize,
    ) -> LibraryResult<Vec<Artifact>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM artifacts
             WHERE (?1 IS NULL OR submitter = ?1)
             ORDER BY downloaded_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![submitter, limit as i64], |row| Artifact::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Case-insensitive title match, newest first.
    pub fn search_artifacts(
        &self,
        submitter: Option<&str>,
        query: &str,
        limit: usize,
    ) -> LibraryResult<Vec<Artifact>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM artifacts
             WHERE (?1 IS NULL OR submitter = ?1)
               AND title LIKE ?2 ESCAPE '\\'
             ORDER BY downloaded_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![submitter, pattern, limit as i64], |row| {
                Artifact::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every row, oldest download first; ties broken by id.
    pub fn snapshot(&self) -> LibraryResult<Vec<SnapshotEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, size_bytes, downloaded_at, expires_at FROM artifacts
             ORDER BY downloaded_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| SnapshotEntry::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn total_size(&self) -> LibraryResult<u64> {
        let conn = self.open()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM artifacts",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    pub fn count(&self) -> LibraryResult<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Deletes the row and appends a `delete` event in one transaction.
    /// Returns the removed row, or `None` when the id is unknown.
    pub fn remove_artifact(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> LibraryResult<Option<Artifact>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let existing = tx
            .query_row("SELECT * FROM artifacts WHERE id = ?1", [id], |row| {
                Artifact::from_row(row)
            })
            .optional()?;
        let Some(artifact) = existing else {
            return Ok(None);
        };
        tx.execute("DELETE FROM artifacts WHERE id = ?1", [id])?;
        insert_action(&tx, &artifact.submitter, id, ActionKind::Delete, at)?;
        tx.commit()?;
        Ok(Some(artifact))
    }

    /// File and thumbnail paths currently owned by a row.
    pub fn referenced_paths(&self) -> LibraryResult<HashSet<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT file_path, thumbnail_path FROM artifacts")?;
        let mut rows = stmt.query([])?;
        let mut paths = HashSet::new();
        while let Some(row) = rows.next()? {
            paths.insert(row.get::<_, String>(0)?);
            if let Some(thumbnail) = row.get::<_, Option<String>>(1)? {
                paths.insert(thumbnail);
            }
        }
        Ok(paths)
    }

    pub fn record_action(
        &self,
        submitter: &str,
        artifact_id: &str,
        action: ActionKind,
        at: DateTime<Utc>,
    ) -> LibraryResult<()> {
        let conn = self.open()?;
        insert_action(&conn, submitter, artifact_id, action, at)?;
        Ok(())
    }

    /// Most recent first.
    pub fn action_events(
        &self,
        submitter: Option<&str>,
        limit: usize,
    ) -> LibraryResult<Vec<ActionEvent>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM action_events
             WHERE (?1 IS NULL OR submitter = ?1)
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![submitter, limit as i64], |row| {
                ActionEvent::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn usage_stats(
        &self,
        submitter: Option<&str>,
        now: DateTime<Utc>,
    ) -> LibraryResult<UsageStats> {
        let conn = self.open()?;
        let (count, used): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM artifacts
             WHERE (?1 IS NULL OR submitter = ?1)",
            params![submitter],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let week = to_epoch(now - Duration::days(7));
        let month = to_epoch(now - Duration::days(30));
        let (last_7, last_30, deletes_30): (i64, i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN action = 'download' AND recorded_at >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN action = 'download' AND recorded_at >= ?3 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN action = 'delete' AND recorded_at >= ?3 THEN 1 ELSE 0 END), 0)
             FROM action_events
             WHERE (?1 IS NULL OR submitter = ?1)",
            params![submitter, week, month],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(UsageStats {
            submitter: submitter.map(str::to_string),
            artifact_count: count.max(0) as u64,
            used_bytes: used.max(0) as u64,
            downloads_last_7_days: last_7.max(0) as u64,
            downloads_last_30_days: last_30.max(0) as u64,
            deletes_last_30_days: deletes_30.max(0) as u64,
        })
    }

    pub fn preference(&self, submitter: &str) -> LibraryResult<Option<SubmitterPreference>> {
        let conn = self.open()?;
        let preference = conn
            .query_row(
                "SELECT * FROM submitter_preferences WHERE submitter = ?1",
                [submitter],
                |row| SubmitterPreference::from_row(row),
            )
            .optional()?;
        Ok(preference)
    }

    /// Stored preference, or `default` when the submitter never set one.
    pub fn send_description(&self, submitter: &str, default: bool) -> LibraryResult<bool> {
        Ok(self
            .preference(submitter)?
            .map(|pref| pref.send_description)
            .unwrap_or(default))
    }

    pub fn set_send_description(
        &self,
        submitter: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> LibraryResult<SubmitterPreference> {
        let conn = self.open()?;
        let at = to_epoch(now);
        conn.execute(
            "INSERT INTO submitter_preferences (submitter, send_description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(submitter) DO UPDATE SET
                send_description = excluded.send_description,
                updated_at = excluded.updated_at",
            params![submitter, if enabled { 1 } else { 0 }, at],
        )?;
        let preference = conn.query_row(
            "SELECT * FROM submitter_preferences WHERE submitter = ?1",
            [submitter],
            |row| SubmitterPreference::from_row(row),
        )?;
        Ok(preference)
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> LibraryResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest = Connection::open(destination_path)?;
        configure_connection(&dest).map_err(|source| LibraryError::OpenDatabase {
            path: destination_path.to_path_buf(),
            source,
        })?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }
}

fn insert_action(
    conn: &Connection,
    submitter: &str,
    artifact_id: &str,
    action: ActionKind,
    at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO action_events (submitter, artifact_id, action, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![submitter, artifact_id, action.as_str(), to_epoch(at)],
    )?;
    Ok(())
}

fn sql_int(field: &'static str, value: u64) -> LibraryResult<i64> {
    i64::try_from(value).map_err(|_| LibraryError::OutOfRange { field, value })
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

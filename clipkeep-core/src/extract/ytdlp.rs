use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::command::{describe, stderr_tail, CommandExecutor, SystemCommandExecutor};
use crate::job::QualityHint;

use super::select::{original_quality, select_stream, FormatDescriptor};
use super::{ExtractError, ExtractResult, Extractor, FetchedMedia, Resolution};

const STDERR_TAIL_CHARS: usize = 600;

/// The subset of `--dump-single-json` output the pipeline uses.
#[derive(Debug, Deserialize)]
struct InfoDocument {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    extractor_key: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<FormatDescriptor>,
    #[serde(default)]
    format_id: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    tbr: Option<f64>,
}

impl InfoDocument {
    /// Single-format sources report the stream at the top level only.
    fn formats(&self) -> Vec<FormatDescriptor> {
        if !self.formats.is_empty() {
            return self.formats.clone();
        }
        vec![FormatDescriptor {
            format_id: self.format_id.clone().unwrap_or_else(|| "best".to_string()),
            ext: self.ext.clone(),
            width: self.width,
            height: self.height,
            vcodec: self.vcodec.clone(),
            acodec: self.acodec.clone(),
            tbr: self.tbr,
            ..Default::default()
        }]
    }
}

/// Extractor backed by the `yt-dlp` command line tool.
pub struct YtDlpExtractor {
    program: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for YtDlpExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YtDlpExtractor")
            .field("program", &self.program)
            .finish()
    }
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<PathBuf>, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            program: program.into(),
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    async fn run(&self, command: &mut Command) -> ExtractResult<std::process::Output> {
        debug!(command = %describe(command), "running extractor");
        let output = self
            .executor
            .run(command)
            .await
            .map_err(|source| ExtractError::Io {
                source,
                path: self.program.clone(),
            })?;
        if !output.status.success() {
            return Err(ExtractError::from_tool_output(stderr_tail(
                &output,
                STDERR_TAIL_CHARS,
            )));
        }
        Ok(output)
    }

    fn base_command(&self, credentials: Option<&Path>) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--no-playlist").arg("--no-warnings");
        if let Some(cookies) = credentials {
            command.arg("--cookies").arg(cookies);
        }
        command
    }
}

#[async_trait::async_trait]
impl Extractor for YtDlpExtractor {
    async fn resolve(
        &self,
        url: &str,
        hint: QualityHint,
        credentials: Option<&Path>,
    ) -> ExtractResult<Resolution> {
        let mut command = self.base_command(credentials);
        command.arg("--dump-single-json").arg(url);
        let output = self.run(&mut command).await?;

        let info: InfoDocument = serde_json::from_slice(&output.stdout)
            .map_err(|err| ExtractError::Parse(err.to_string()))?;
        let formats = info.formats();
        let selection = select_stream(&formats, hint).ok_or_else(|| ExtractError::NoFormats {
            url: url.to_string(),
        })?;
        let original_quality = if hint.is_audio() {
            None
        } else {
            original_quality(&formats)
        };
        info!(
            url,
            media_id = %info.id,
            format = %selection.format_spec,
            quality = %selection.achieved_quality(),
            "resolved source"
        );

        Ok(Resolution {
            url: url.to_string(),
            title: info
                .title
                .clone()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| info.id.clone()),
            media_id: info.id,
            description: info.description.filter(|text| !text.trim().is_empty()),
            source_platform: info.extractor_key,
            duration_seconds: info.duration,
            formats,
            selection,
            original_quality,
            credentials: credentials.map(Path::to_path_buf),
        })
    }

    async fn fetch(&self, resolution: &Resolution, dest_dir: &Path) -> ExtractResult<FetchedMedia> {
        fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| ExtractError::Io {
                source,
                path: dest_dir.to_path_buf(),
            })?;
        let stem = safe_stem(&resolution.media_id);
        let selection = &resolution.selection;

        let mut command = self.base_command(resolution.credentials.as_deref());
        command
            .arg("--no-mtime")
            .arg("-f")
            .arg(&selection.format_spec)
            .arg("-o")
            .arg(dest_dir.join(format!("{stem}.%(ext)s")));
        if selection.audio_only {
            command.arg("-x").arg("--audio-format").arg("mp3");
        } else {
            command.arg("--merge-output-format").arg("mp4");
        }
        command.arg(&resolution.url);
        self.run(&mut command).await?;

        let path = locate_output(dest_dir, &stem, selection.container()).await?;
        let size_bytes = fs::metadata(&path)
            .await
            .map_err(|source| ExtractError::Io {
                source,
                path: path.clone(),
            })?
            .len();
        Ok(FetchedMedia {
            path,
            size_bytes,
            selection: selection.clone(),
        })
    }
}

/// File name stem derived from an extractor id; never escapes the directory.
fn safe_stem(media_id: &str) -> String {
    let stem: String = media_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .take(80)
        .collect();
    if stem.is_empty() {
        "media".to_string()
    } else {
        stem
    }
}

/// The tool picks the final extension; prefer the requested container.
async fn locate_output(dir: &Path, stem: &str, container: &str) -> ExtractResult<PathBuf> {
    let expected = dir.join(format!("{stem}.{container}"));
    if fs::try_exists(&expected).await.unwrap_or(false) {
        return Ok(expected);
    }
    let mut entries = fs::read_dir(dir).await.map_err(|source| ExtractError::Io {
        source,
        path: dir.to_path_buf(),
    })?;
    let prefix = format!("{stem}.");
    while let Some(entry) = entries.next_entry().await.map_err(|source| ExtractError::Io {
        source,
        path: dir.to_path_buf(),
    })? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            return Ok(entry.path());
        }
    }
    Err(ExtractError::Unavailable(format!(
        "extractor reported success but produced no file for {stem}"
    )))
}

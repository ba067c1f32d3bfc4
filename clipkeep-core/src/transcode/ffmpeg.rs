use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::command::{describe, stderr_tail, CommandExecutor, SystemCommandExecutor};
use crate::config::TranscodeSection;

use super::{NormalizedMedia, TranscodeError, TranscodeResult, Transcoder};

const EVEN_SCALE_FILTER: &str = "scale=trunc(iw/2)*2:trunc(ih/2)*2";
const STDERR_TAIL_CHARS: usize = 600;

/// Encoder settings for the normalized output.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeProfile {
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

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            profile: "main".into(),
            level: "4.0".into(),
            pix_fmt: "yuv420p".into(),
            preset: "veryfast".into(),
            crf: 23,
            keyint: 48,
            audio_codec: "aac".into(),
            audio_bitrate: "128k".into(),
            audio_sample_rate: 44_100,
            faststart: true,
            thumbnail_max_side: 320,
        }
    }
}

impl From<&TranscodeSection> for TranscodeProfile {
    fn from(section: &TranscodeSection) -> Self {
        Self {
            video_codec: section.video_codec.clone(),
            profile: section.profile.clone(),
            level: section.level.clone(),
            pix_fmt: section.pix_fmt.clone(),
            preset: section.preset.clone(),
            crf: section.crf,
            keyint: section.keyint,
            audio_codec: section.audio_codec.clone(),
            audio_bitrate: section.audio_bitrate.clone(),
            audio_sample_rate: section.audio_sample_rate,
            faststart: section.faststart,
            thumbnail_max_side: section.thumbnail_max_side,
        }
    }
}

impl TranscodeProfile {
    /// Codec name recorded on the artifact.
    pub fn codec_label(&self) -> String {
        match self.video_codec.as_str() {
            "libx264" => "h264".to_string(),
            "libx265" => "hevc".to_string(),
            "libvpx-vp9" => "vp9".to_string(),
            other => other.to_string(),
        }
    }

    fn thumbnail_filter(&self) -> String {
        let side = self.thumbnail_max_side.max(2);
        format!("scale=w='if(gte(iw,ih),{side},-2)':h='if(gte(iw,ih),-2,{side})'")
    }
}

pub struct FfmpegTranscoder {
    program: PathBuf,
    profile: TranscodeProfile,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for FfmpegTranscoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegTranscoder")
            .field("program", &self.program)
            .field("profile", &self.profile)
            .finish()
    }
}

impl FfmpegTranscoder {
    pub fn new(
        program: impl Into<PathBuf>,
        profile: TranscodeProfile,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        Self {
            program: program.into(),
            profile,
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    pub fn profile(&self) -> &TranscodeProfile {
        &self.profile
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error");
        command
    }

    pub(crate) fn normalize_command(&self, input: &Path, output: &Path) -> Command {
        let profile = &self.profile;
        let keyint = profile.keyint.to_string();
        let mut command = self.base_command();
        command
            .arg("-i")
            .arg(input)
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("0:a:0?")
            .arg("-vf")
            .arg(EVEN_SCALE_FILTER)
            .arg("-c:v")
            .arg(&profile.video_codec)
            .arg("-profile:v")
            .arg(&profile.profile)
            .arg("-level:v")
            .arg(&profile.level)
            .arg("-pix_fmt")
            .arg(&profile.pix_fmt)
            .arg("-preset")
            .arg(&profile.preset)
            .arg("-crf")
            .arg(profile.crf.to_string())
            .arg("-g")
            .arg(&keyint)
            .arg("-keyint_min")
            .arg(&keyint)
            .arg("-sc_threshold")
            .arg("0")
            .arg("-c:a")
            .arg(&profile.audio_codec)
            .arg("-b:a")
            .arg(&profile.audio_bitrate)
            .arg("-ar")
            .arg(profile.audio_sample_rate.to_string())
            .arg("-ac")
            .arg("2");
        if profile.faststart {
            command.arg("-movflags").arg("+faststart");
        }
        command.arg(output);
        command
    }

    pub(crate) fn thumbnail_command(&self, input: &Path, output: &Path, seek: bool) -> Command {
        let mut command = self.base_command();
        if seek {
            command.arg("-ss").arg("1");
        }
        command
            .arg("-i")
            .arg(input)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg(self.profile.thumbnail_filter())
            .arg("-q:v")
            .arg("3")
            .arg(output);
        command
    }

    async fn execute(&self, command: &mut Command, output: &Path) -> TranscodeResult<u64> {
        debug!(command = %describe(command), "running encoder");
        let result = self
            .executor
            .run(command)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: self.program.clone(),
            })?;
        if !result.status.success() {
            return Err(TranscodeError::Failed {
                status: result.status.to_string(),
                stderr: stderr_tail(&result, STDERR_TAIL_CHARS),
            });
        }
        match fs::metadata(output).await {
            Ok(metadata) if metadata.len() > 0 => Ok(metadata.len()),
            _ => Err(TranscodeError::MissingOutput {
                path: output.to_path_buf(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn normalize(&self, input: &Path, output: &Path) -> TranscodeResult<NormalizedMedia> {
        let mut command = self.normalize_command(input, output);
        let size_bytes = self.execute(&mut command, output).await?;
        Ok(NormalizedMedia {
            path: output.to_path_buf(),
            video_codec: self.profile.codec_label(),
            size_bytes,
        })
    }

    async fn thumbnail(&self, input: &Path, output: &Path) -> TranscodeResult<()> {
        let mut seeked = self.thumbnail_command(input, output, true);
        match self.execute(&mut seeked, output).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // Clips shorter than the seek offset yield no frame.
                warn!(input = %input.display(), error = %err, "thumbnail at 1s failed, retrying from start");
                let mut command = self.thumbnail_command(input, output, false);
                self.execute(&mut command, output).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder() -> FfmpegTranscoder {
        FfmpegTranscoder::new("ffmpeg", TranscodeProfile::default(), None)
    }

    #[test]
    fn normalize_command_carries_profile() {
        let command = transcoder().normalize_command(Path::new("in.webm"), Path::new("out.mp4"));
        let line = describe(&command);
        assert!(line.starts_with("ffmpeg -y -hide_banner"));
        assert!(line.contains("-vf scale=trunc(iw/2)*2:trunc(ih/2)*2"));
        assert!(line.contains("-c:v libx264 -profile:v main -level:v 4.0 -pix_fmt yuv420p"));
        assert!(line.contains("-g 48 -keyint_min 48 -sc_threshold 0"));
        assert!(line.contains("-c:a aac -b:a 128k -ar 44100 -ac 2"));
        assert!(line.ends_with("-movflags +faststart out.mp4"));
    }

    #[test]
    fn thumbnail_command_scales_longest_side() {
        let command = transcoder().thumbnail_command(Path::new("in.mp4"), Path::new("t.jpg"), true);
        let line = describe(&command);
        assert!(line.contains("-ss 1 -i in.mp4 -frames:v 1"));
        assert!(line.contains("scale=w='if(gte(iw,ih),320,-2)':h='if(gte(iw,ih),-2,320)'"));
        let unseeked = transcoder().thumbnail_command(Path::new("in.mp4"), Path::new("t.jpg"), false);
        assert!(!describe(&unseeked).contains("-ss"));
    }

    #[test]
    fn codec_label_names_the_format() {
        assert_eq!(TranscodeProfile::default().codec_label(), "h264");
    }
}

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::job::QualityHint;

/// One entry of the extractor's `formats` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    /// Total bitrate in kbit/s.
    #[serde(default)]
    pub tbr: Option<f64>,
    /// Audio bitrate in kbit/s.
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
}

impl FormatDescriptor {
    /// A format without any codec information is treated as combined.
    pub fn has_video(&self) -> bool {
        match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.acodec.is_none() || self.height.is_some(),
        }
    }

    pub fn has_audio(&self) -> bool {
        match self.acodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.vcodec.is_none(),
        }
    }

    pub fn is_combined(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    fn height_or_zero(&self) -> u32 {
        self.height.unwrap_or(0)
    }

    fn bitrate(&self) -> f64 {
        self.tbr.or(self.abr).unwrap_or(0.0)
    }

    fn audio_bitrate(&self) -> f64 {
        self.abr.or(self.tbr).unwrap_or(0.0)
    }

    fn video_codec(&self) -> Option<String> {
        self.vcodec
            .as_deref()
            .filter(|codec| *codec != "none")
            .map(str::to_string)
    }
}

/// Which streams to fetch and what the result will look like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSelection {
    /// Extractor format expression, e.g. `"137+140"` or `"22"`.
    pub format_spec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
    pub audio_only: bool,
}

impl StreamSelection {
    /// Label stored as `downloaded_quality`.
    pub fn achieved_quality(&self) -> String {
        if self.audio_only {
            return "audio".to_string();
        }
        match self.height {
            Some(height) => format!("{height}p"),
            None => "best".to_string(),
        }
    }

    pub fn container(&self) -> &'static str {
        if self.audio_only {
            "mp3"
        } else {
            "mp4"
        }
    }

    fn single(format: &FormatDescriptor) -> Self {
        Self {
            format_spec: format.format_id.clone(),
            width: format.width,
            height: format.height,
            video_codec: format.video_codec(),
            audio_only: false,
        }
    }

    fn merged(video: &FormatDescriptor, audio: &FormatDescriptor) -> Self {
        Self {
            format_spec: format!("{}+{}", video.format_id, audio.format_id),
            ..Self::single(video)
        }
    }

    fn audio(format: &FormatDescriptor) -> Self {
        Self {
            format_spec: format.format_id.clone(),
            width: None,
            height: None,
            video_codec: None,
            audio_only: true,
        }
    }
}

fn by_video_rank(a: &&FormatDescriptor, b: &&FormatDescriptor) -> Ordering {
    a.height_or_zero()
        .cmp(&b.height_or_zero())
        .then_with(|| a.bitrate().total_cmp(&b.bitrate()))
}

fn by_audio_rank(a: &&FormatDescriptor, b: &&FormatDescriptor) -> Ordering {
    a.audio_bitrate().total_cmp(&b.audio_bitrate())
}

/// Picks the streams to fetch for a quality hint, or `None` when nothing
/// usable was offered.
pub fn select_stream(formats: &[FormatDescriptor], hint: QualityHint) -> Option<StreamSelection> {
    let combined: Vec<&FormatDescriptor> = formats.iter().filter(|f| f.is_combined()).collect();
    let video_only: Vec<&FormatDescriptor> = formats
        .iter()
        .filter(|f| f.has_video() && !f.has_audio())
        .collect();
    let best_audio = formats
        .iter()
        .filter(|f| f.has_audio() && !f.has_video())
        .max_by(by_audio_rank);

    match hint {
        QualityHint::AudioOnly => best_audio
            .or_else(|| {
                formats
                    .iter()
                    .filter(|f| f.has_audio())
                    .max_by(by_audio_rank)
            })
            .map(StreamSelection::audio),
        QualityHint::MaxHeight(limit) => {
            let fits = |f: &&&FormatDescriptor| f.height.map(|h| h <= limit).unwrap_or(false);
            if let Some(format) = combined.iter().filter(fits).max_by(|a, b| by_video_rank(a, b)) {
                return Some(StreamSelection::single(format));
            }
            if let (Some(video), Some(audio)) = (
                video_only.iter().filter(fits).max_by(|a, b| by_video_rank(a, b)),
                best_audio,
            ) {
                return Some(StreamSelection::merged(video, audio));
            }
            select_best(&combined, &video_only, best_audio)
        }
        QualityHint::Best => select_best(&combined, &video_only, best_audio),
    }
}

fn select_best(
    combined: &[&FormatDescriptor],
    video_only: &[&FormatDescriptor],
    best_audio: Option<&FormatDescriptor>,
) -> Option<StreamSelection> {
    let tallest = combined
        .iter()
        .chain(video_only.iter())
        .map(|f| f.height_or_zero())
        .max()?;

    let combined_at_top = combined
        .iter()
        .filter(|f| f.height_or_zero() == tallest)
        .max_by(|a, b| by_video_rank(a, b));
    if let Some(format) = combined_at_top {
        return Some(StreamSelection::single(format));
    }

    let video_at_top = video_only
        .iter()
        .filter(|f| f.height_or_zero() == tallest)
        .max_by(|a, b| by_video_rank(a, b));
    if let (Some(video), Some(audio)) = (video_at_top, best_audio) {
        return Some(StreamSelection::merged(video, audio));
    }

    if let Some(format) = combined.iter().max_by(|a, b| by_video_rank(a, b)) {
        return Some(StreamSelection::single(format));
    }
    video_at_top.map(|format| StreamSelection::single(format))
}

/// Best quality the source offers, as `"WxH (Hp)"`.
pub fn original_quality(formats: &[FormatDescriptor]) -> Option<String> {
    formats
        .iter()
        .filter(|f| f.has_video() && f.width.is_some() && f.height.is_some())
        .max_by(by_video_rank)
        .and_then(|f| match (f.width, f.height) {
            (Some(width), Some(height)) => Some(format!("{width}x{height} ({height}p)")),
            _ => None,
        })
}

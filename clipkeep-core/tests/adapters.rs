#![cfg(unix)]

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clipkeep_core::{
    CommandExecutor, CredentialStore, ExtractError, Extractor, FfmpegTranscoder, QualityHint,
    TranscodeError, TranscodeProfile, Transcoder, YtDlpExtractor,
};
use tempfile::TempDir;
use tokio::process::Command;

/// What a scripted run writes before it "exits".
#[derive(Debug, Clone)]
enum Effect {
    Nothing,
    /// Fill the `-o` template with this extension.
    WriteTemplate(&'static str),
    /// Write to the last argument.
    WriteLastArg,
}

#[derive(Debug, Clone)]
struct Scripted {
    code: i32,
    stdout: String,
    stderr: String,
    effect: Effect,
}

impl Scripted {
    fn ok(stdout: &str, effect: Effect) -> Self {
        Self {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            effect,
        }
    }

    fn fail(stderr: &str) -> Self {
        Self {
            code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
            effect: Effect::Nothing,
        }
    }
}

#[derive(Default)]
struct ScriptedExecutor {
    responses: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedExecutor {
    fn new(responses: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::default(),
        })
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        self.calls.lock().unwrap().push(args.clone());
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected command");

        match scripted.effect {
            Effect::Nothing => {}
            Effect::WriteTemplate(ext) => {
                let index = args.iter().position(|a| a == "-o").unwrap();
                let target = args[index + 1].replace("%(ext)s", ext);
                std::fs::write(target, b"fetched")?;
            }
            Effect::WriteLastArg => {
                std::fs::write(args.last().unwrap(), b"encoded")?;
            }
        }
        Ok(Output {
            status: ExitStatus::from_raw(scripted.code << 8),
            stdout: scripted.stdout.into_bytes(),
            stderr: scripted.stderr.into_bytes(),
        })
    }
}

const INFO_JSON: &str = r#"{
    "id": "dQw4w9WgXcQ",
    "title": "Never Gonna Give You Up",
    "description": "Official video",
    "extractor_key": "Youtube",
    "duration": 212.0,
    "formats": [
        {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5},
        {"format_id": "18", "ext": "mp4", "width": 640, "height": 360, "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "tbr": 500.0},
        {"format_id": "22", "ext": "mp4", "width": 1280, "height": 720, "vcodec": "avc1.64001F", "acodec": "mp4a.40.2", "tbr": 1500.0},
        {"format_id": "137", "ext": "mp4", "width": 1920, "height": 1080, "vcodec": "avc1.640028", "acodec": "none", "tbr": 4400.0}
    ]
}"#;

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let index = args.iter().position(|a| a == flag)?;
    args.get(index + 1).map(String::as_str)
}

#[tokio::test]
async fn resolve_reads_metadata_and_picks_a_stream() {
    let executor = ScriptedExecutor::new(vec![Scripted::ok(INFO_JSON, Effect::Nothing)]);
    let extractor = YtDlpExtractor::new("yt-dlp", Some(executor.clone()));
    let cookies = PathBuf::from("/var/lib/clipkeep/cookies/youtube.txt");

    let resolution = extractor
        .resolve(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            QualityHint::MaxHeight(720),
            Some(cookies.as_path()),
        )
        .await
        .unwrap();

    assert_eq!(resolution.media_id, "dQw4w9WgXcQ");
    assert_eq!(resolution.title, "Never Gonna Give You Up");
    assert_eq!(resolution.source_platform.as_deref(), Some("Youtube"));
    assert_eq!(resolution.selection.format_spec, "22");
    assert_eq!(resolution.original_quality.as_deref(), Some("1920x1080 (1080p)"));
    assert_eq!(resolution.formats.len(), 4);

    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains(&"--dump-single-json".to_string()));
    assert!(calls[0].contains(&"--no-playlist".to_string()));
    assert_eq!(
        arg_after(&calls[0], "--cookies"),
        Some("/var/lib/clipkeep/cookies/youtube.txt")
    );
}

#[tokio::test]
async fn resolve_classifies_tool_failures() {
    let executor = ScriptedExecutor::new(vec![
        Scripted::fail("ERROR: [youtube] abc: Sign in to confirm your age"),
        Scripted::fail("ERROR: [generic] Unsupported URL: https://example.com/page"),
        Scripted::ok("this is not json", Effect::Nothing),
    ]);
    let extractor = YtDlpExtractor::new("yt-dlp", Some(executor));

    let auth = extractor
        .resolve("https://www.youtube.com/watch?v=abc", QualityHint::Best, None)
        .await
        .unwrap_err();
    assert!(auth.is_auth_required(), "{auth}");

    let unsupported = extractor
        .resolve("https://example.com/page", QualityHint::Best, None)
        .await
        .unwrap_err();
    assert!(matches!(unsupported, ExtractError::Unavailable(_)), "{unsupported}");

    let garbled = extractor
        .resolve("https://example.com/page", QualityHint::Best, None)
        .await
        .unwrap_err();
    assert!(matches!(garbled, ExtractError::Parse(_)), "{garbled}");
}

#[tokio::test]
async fn fetch_downloads_the_selected_streams_into_staging() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new(vec![
        Scripted::ok(INFO_JSON, Effect::Nothing),
        Scripted::ok("", Effect::WriteTemplate("mp4")),
    ]);
    let extractor = YtDlpExtractor::new("yt-dlp", Some(executor.clone()));
    let resolution = extractor
        .resolve("https://youtu.be/dQw4w9WgXcQ", QualityHint::Best, None)
        .await
        .unwrap();
    assert_eq!(resolution.selection.format_spec, "137+140");

    let staging = dir.path().join("job-7").join("source");
    let fetched = extractor.fetch(&resolution, &staging).await.unwrap();

    assert_eq!(fetched.path, staging.join("dQw4w9WgXcQ.mp4"));
    assert_eq!(fetched.size_bytes, b"fetched".len() as u64);
    let calls = executor.calls();
    let fetch_args = &calls[1];
    assert_eq!(arg_after(fetch_args, "-f"), Some("137+140"));
    assert_eq!(arg_after(fetch_args, "--merge-output-format"), Some("mp4"));
    assert!(fetch_args.contains(&"--no-mtime".to_string()));
    assert_eq!(fetch_args.last().map(String::as_str), Some("https://youtu.be/dQw4w9WgXcQ"));
}

#[tokio::test]
async fn audio_fetch_extracts_mp3() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new(vec![
        Scripted::ok(INFO_JSON, Effect::Nothing),
        Scripted::ok("", Effect::WriteTemplate("mp3")),
    ]);
    let extractor = YtDlpExtractor::new("yt-dlp", Some(executor.clone()));
    let resolution = extractor
        .resolve("https://youtu.be/dQw4w9WgXcQ", QualityHint::AudioOnly, None)
        .await
        .unwrap();
    assert!(resolution.original_quality.is_none());

    let fetched = extractor.fetch(&resolution, dir.path()).await.unwrap();
    assert_eq!(fetched.path.extension().unwrap(), "mp3");
    let calls = executor.calls();
    assert_eq!(arg_after(&calls[1], "--audio-format"), Some("mp3"));
    assert!(calls[1].contains(&"-x".to_string()));
}

#[tokio::test]
async fn fetch_reports_missing_output() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new(vec![
        Scripted::ok(INFO_JSON, Effect::Nothing),
        Scripted::ok("", Effect::Nothing),
    ]);
    let extractor = YtDlpExtractor::new("yt-dlp", Some(executor));
    let resolution = extractor
        .resolve("https://youtu.be/dQw4w9WgXcQ", QualityHint::Best, None)
        .await
        .unwrap();
    let err = extractor.fetch(&resolution, dir.path()).await.unwrap_err();
    assert!(matches!(err, ExtractError::Unavailable(_)), "{err}");
}

fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
    let input = dir.path().join("source.webm");
    std::fs::write(&input, b"source").unwrap();
    (input, dir.path().join("normalized.mp4"))
}

#[tokio::test]
async fn normalize_uses_the_configured_profile() {
    let dir = TempDir::new().unwrap();
    let (input, output) = paths(&dir);
    let executor = ScriptedExecutor::new(vec![Scripted::ok("", Effect::WriteLastArg)]);
    let transcoder =
        FfmpegTranscoder::new("ffmpeg", TranscodeProfile::default(), Some(executor.clone()));

    let normalized = transcoder.normalize(&input, &output).await.unwrap();
    assert_eq!(normalized.path, output);
    assert_eq!(normalized.video_codec, "h264");
    assert_eq!(normalized.size_bytes, b"encoded".len() as u64);

    let args = &executor.calls()[0];
    assert_eq!(arg_after(args, "-c:v"), Some("libx264"));
    assert_eq!(arg_after(args, "-pix_fmt"), Some("yuv420p"));
    assert_eq!(arg_after(args, "-c:a"), Some("aac"));
    assert_eq!(arg_after(args, "-g"), Some("48"));
    assert_eq!(arg_after(args, "-movflags"), Some("+faststart"));
}

#[tokio::test]
async fn normalize_failure_carries_encoder_output() {
    let dir = TempDir::new().unwrap();
    let (input, output) = paths(&dir);
    let executor = ScriptedExecutor::new(vec![Scripted::fail(
        "Error while opening encoder for output stream #0:0",
    )]);
    let transcoder = FfmpegTranscoder::new("ffmpeg", TranscodeProfile::default(), Some(executor));

    match transcoder.normalize(&input, &output).await.unwrap_err() {
        TranscodeError::Failed { stderr, .. } => assert!(stderr.contains("opening encoder")),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn normalize_without_output_is_an_error() {
    let dir = TempDir::new().unwrap();
    let (input, output) = paths(&dir);
    let executor = ScriptedExecutor::new(vec![Scripted::ok("", Effect::Nothing)]);
    let transcoder = FfmpegTranscoder::new("ffmpeg", TranscodeProfile::default(), Some(executor));

    let err = transcoder.normalize(&input, &output).await.unwrap_err();
    assert!(matches!(err, TranscodeError::MissingOutput { .. }), "{err}");
}

#[tokio::test]
async fn thumbnail_retries_from_the_first_frame() {
    let dir = TempDir::new().unwrap();
    let (input, _) = paths(&dir);
    let thumbnail = dir.path().join("thumbnail.jpg");
    let executor = ScriptedExecutor::new(vec![
        Scripted::fail("Output file is empty, nothing was encoded"),
        Scripted::ok("", Effect::WriteLastArg),
    ]);
    let transcoder =
        FfmpegTranscoder::new("ffmpeg", TranscodeProfile::default(), Some(executor.clone()));

    transcoder.thumbnail(&input, &thumbnail).await.unwrap();
    assert!(thumbnail.is_file());
    let calls = executor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(arg_after(&calls[0], "-ss"), Some("1"));
    assert!(arg_after(&calls[1], "-ss").is_none());
}

#[test]
fn credentials_are_matched_by_host_suffix() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("instagram.txt"), "# Netscape HTTP Cookie File\n").unwrap();
    let store = CredentialStore::new(dir.path(), Default::default());

    assert_eq!(
        store.lookup("https://www.instagram.com/reel/Cxyz/"),
        Some(dir.path().join("instagram.txt"))
    );
    assert_eq!(store.platform_for("https://x.com/user/status/1"), Some("x.com"));
    assert!(store.lookup("https://x.com/user/status/1").is_none(), "file missing");
    assert!(store.lookup("https://notinstagram.com/p/1").is_none());
    assert!(CredentialStore::disabled()
        .lookup("https://www.instagram.com/reel/Cxyz/")
        .is_none());
}

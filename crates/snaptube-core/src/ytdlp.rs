//! `yt-dlp` subprocess backend.
//!
//! Metadata comes from `--dump-single-json`. Downloads run with `--newline`
//! and a progress template that prints one machine-readable line per tick,
//! so progress can be parsed without scraping the human progress bar. The
//! classic `[download]  42.0%` line is still understood as a fallback.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::backend::{
    Extractor, ProgressSender, TransferControl, TransferOutcome, TransferProgress, TransferRequest,
};
use crate::error::{ResolutionError, TransferError};
use crate::media::RawMetadata;
use crate::process::{capture, run_streaming};

const TOOL: &str = "yt-dlp";

/// Prefix of the lines printed by our progress template.
const PROGRESS_MARKER: &str = "snaptube-progress";

/// Output filename template, relative to the job destination.
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

static PERCENT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").ok());

static DESTINATION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\[(?:download|ExtractAudio)\]\s+Destination:\s+(.+)$").ok()
});

static MERGE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"$"#).ok());

static ALREADY_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").ok()
});

/// Configuration for [`YtDlpExtractor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YtDlpConfig {
    /// Path or name of the `yt-dlp` binary.
    pub binary: PathBuf,
    /// Extra arguments appended to every invocation (cookies, proxy, ...).
    pub extra_args: Vec<String>,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(TOOL),
            extra_args: Vec::new(),
        }
    }
}

impl YtDlpConfig {
    /// Use a specific binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Append an extra argument.
    #[must_use]
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

/// [`Extractor`] backed by the `yt-dlp` command line tool.
#[derive(Debug, Clone, Default)]
pub struct YtDlpExtractor {
    config: YtDlpConfig,
}

impl YtDlpExtractor {
    /// Create an extractor with the given configuration.
    #[must_use]
    pub const fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &YtDlpConfig {
        &self.config
    }

    fn command(&self) -> Command {
        Command::new(&self.config.binary)
    }
}

impl Extractor for YtDlpExtractor {
    fn extract(&self, locator: &str) -> Result<RawMetadata, ResolutionError> {
        debug!("Fetching metadata for {}", locator);

        let mut command = self.command();
        command
            .args(metadata_args(&self.config.extra_args))
            .arg("--")
            .arg(locator);

        let stdout = capture(&mut command).map_err(|e| e.into_resolution(TOOL))?;
        serde_json::from_slice(&stdout).map_err(|e| ResolutionError::MalformedMetadata {
            reason: e.to_string(),
        })
    }

    fn download(
        &self,
        request: &TransferRequest,
        control: &TransferControl,
        progress: ProgressSender,
    ) -> Result<TransferOutcome, TransferError> {
        std::fs::create_dir_all(&request.output_dir).map_err(|e| TransferError::Io {
            path: request.output_dir.clone(),
            reason: e.to_string(),
        })?;

        info!(
            "Starting yt-dlp download of {} into {}",
            request.locator,
            request.output_dir.display()
        );

        let mut command = self.command();
        command
            .args(download_args(request, &self.config.extra_args))
            .arg("--")
            .arg(&request.locator);

        let mut output_path: Option<PathBuf> = None;
        run_streaming(&mut command, control, |line| match parse_line(line) {
            OutputLine::Progress(tick) => {
                // Receiver gone means the job no longer listens
                let _ = progress.send(tick);
            }
            OutputLine::Destination(path) => output_path = Some(path),
            OutputLine::Other => {}
        })
        .map_err(|e| e.into_transfer(TOOL))?;

        let output_path = output_path.ok_or_else(|| TransferError::Io {
            path: request.output_dir.clone(),
            reason: "yt-dlp did not report an output file".to_string(),
        })?;

        Ok(TransferOutcome {
            title: title_from_path(&output_path),
            output_path,
        })
    }
}

fn metadata_args(extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> = [
        "--dump-single-json",
        "--no-playlist",
        "--no-warnings",
        "--skip-download",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    args.extend(extra.iter().cloned());
    args
}

fn download_args(request: &TransferRequest, extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--progress".into(),
        "--progress-template".into(),
        format!(
            "download:{PROGRESS_MARKER} %(progress.downloaded_bytes)s \
             %(progress.total_bytes)s %(progress.total_bytes_estimate)s"
        ),
        "-o".into(),
        request
            .output_dir
            .join(OUTPUT_TEMPLATE)
            .to_string_lossy()
            .into_owned(),
    ];

    match request.audio {
        Some(bitrate) => {
            args.extend([
                "-f".into(),
                "bestaudio/best".into(),
                "--extract-audio".into(),
                "--audio-format".into(),
                "mp3".into(),
                "--audio-quality".into(),
                format!("{}K", bitrate.kbps()),
            ]);
        }
        None => {
            args.extend(["-f".into(), request.format_selector.clone()]);
        }
    }

    args.extend(extra.iter().cloned());
    args
}

/// A classified stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputLine {
    Progress(TransferProgress),
    Destination(PathBuf),
    Other,
}

fn parse_line(line: &str) -> OutputLine {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
        return parse_template_progress(rest).map_or(OutputLine::Other, OutputLine::Progress);
    }

    if let Some(percent) = capture_group(&PERCENT_RE, line).and_then(|p| p.parse::<f64>().ok()) {
        let permille = (percent.clamp(0.0, 100.0) * 10.0) as u64;
        return OutputLine::Progress(TransferProgress::new(permille, Some(1000)));
    }

    for re in [&DESTINATION_RE, &MERGE_RE, &ALREADY_RE] {
        if let Some(path) = capture_group(re, line) {
            return OutputLine::Destination(PathBuf::from(path));
        }
    }

    OutputLine::Other
}

/// Parse `"<downloaded> <total> <estimate>"`, where any field may be `NA`.
fn parse_template_progress(rest: &str) -> Option<TransferProgress> {
    let mut fields = rest.split_whitespace().map(parse_number);
    let downloaded = fields.next().flatten()?;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();
    Some(TransferProgress::new(downloaded, total.or(estimate)))
}

fn parse_number(field: &str) -> Option<u64> {
    field.parse::<u64>().ok().or_else(|| {
        field
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
    })
}

fn capture_group<'a>(re: &LazyLock<Option<Regex>>, line: &'a str) -> Option<&'a str> {
    let re = re.as_ref()?;
    Some(re.captures(line)?.get(1)?.as_str())
}

fn title_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::AudioBitrate;

    fn request(audio: Option<AudioBitrate>) -> TransferRequest {
        TransferRequest {
            locator: "https://example.com/v".to_string(),
            format_selector: "best[height<=720]".to_string(),
            output_dir: PathBuf::from("/downloads"),
            audio,
        }
    }

    #[test]
    fn test_parse_template_progress() {
        assert_eq!(
            parse_line("snaptube-progress 1024 4096 NA"),
            OutputLine::Progress(TransferProgress::new(1024, Some(4096)))
        );
        assert_eq!(
            parse_line("snaptube-progress 2048 NA 8192.5"),
            OutputLine::Progress(TransferProgress::new(2048, Some(8192)))
        );
        assert_eq!(
            parse_line("snaptube-progress 10 NA NA"),
            OutputLine::Progress(TransferProgress::new(10, None))
        );
        assert_eq!(parse_line("snaptube-progress NA NA NA"), OutputLine::Other);
    }

    #[test]
    fn test_parse_percent_fallback() {
        assert_eq!(
            parse_line("[download]  45.2% of 10.00MiB at 1.00MiB/s ETA 00:05"),
            OutputLine::Progress(TransferProgress::new(452, Some(1000)))
        );
    }

    #[test]
    fn test_parse_destinations() {
        assert_eq!(
            parse_line("[download] Destination: /downloads/Clip.f137.mp4"),
            OutputLine::Destination(PathBuf::from("/downloads/Clip.f137.mp4"))
        );
        assert_eq!(
            parse_line(r#"[Merger] Merging formats into "/downloads/Clip.mp4""#),
            OutputLine::Destination(PathBuf::from("/downloads/Clip.mp4"))
        );
        assert_eq!(
            parse_line("[ExtractAudio] Destination: /downloads/Song.mp3"),
            OutputLine::Destination(PathBuf::from("/downloads/Song.mp3"))
        );
        assert_eq!(
            parse_line("[download] /downloads/Clip.mp4 has already been downloaded"),
            OutputLine::Destination(PathBuf::from("/downloads/Clip.mp4"))
        );
        assert_eq!(parse_line("[youtube] abc: Downloading webpage"), OutputLine::Other);
    }

    #[test]
    fn test_video_download_args() {
        let args = download_args(&request(None), &[]);
        let f = args.iter().position(|a| a == "-f").expect("-f present");
        assert_eq!(args[f + 1], "best[height<=720]");
        assert!(!args.contains(&"--extract-audio".to_string()));
        assert!(args.contains(&"--newline".to_string()));
    }

    #[test]
    fn test_audio_download_args() {
        let bitrate = "320".parse::<AudioBitrate>().expect("valid bitrate");
        let args = download_args(&request(Some(bitrate)), &["--proxy".to_string(), "x".to_string()]);
        assert!(args.contains(&"--extract-audio".to_string()));
        assert!(args.contains(&"320K".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("x"));
    }

    #[test]
    fn test_metadata_args() {
        let args = metadata_args(&[]);
        assert_eq!(args[0], "--dump-single-json");
        assert!(args.contains(&"--skip-download".to_string()));
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(
            title_from_path(Path::new("/downloads/My Clip.mp4")),
            Some("My Clip".to_string())
        );
    }

    #[test]
    fn test_missing_binary() {
        let extractor =
            YtDlpExtractor::new(YtDlpConfig::default().with_binary("snaptube-no-such-ytdlp"));
        let err = extractor
            .extract("https://example.com/v")
            .expect_err("binary does not exist");
        assert!(matches!(err, ResolutionError::ToolMissing { .. }));
    }
}

//! `ffmpeg` subprocess backend for audio extraction.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::{
    ConversionRequest, Converter, ProgressSender, TransferControl, TransferOutcome,
    TransferProgress,
};
use crate::error::TransferError;
use crate::format::sanitize_filename;
use crate::process::{capture, run_streaming};

const FFMPEG: &str = "ffmpeg";
const FFPROBE: &str = "ffprobe";

/// Subdirectory of the input's folder receiving extracted audio.
pub const AUDIO_SUBDIR: &str = "audio";

/// Configuration for [`FfmpegConverter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegConfig {
    /// Path or name of the `ffmpeg` binary.
    pub ffmpeg: PathBuf,
    /// Path or name of the `ffprobe` binary.
    pub ffprobe: PathBuf,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from(FFMPEG),
            ffprobe: PathBuf::from(FFPROBE),
        }
    }
}

/// [`Converter`] backed by `ffmpeg` and `ffprobe`.
#[derive(Debug, Clone, Default)]
pub struct FfmpegConverter {
    config: FfmpegConfig,
}

impl FfmpegConverter {
    /// Create a converter with the given configuration.
    #[must_use]
    pub const fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Duration of a media file in microseconds, if `ffprobe` can tell.
    pub fn media_duration_us(&self, input: &Path) -> Result<Option<u64>, TransferError> {
        let mut command = Command::new(&self.config.ffprobe);
        command
            .args(["-v", "error", "-print_format", "json", "-show_format"])
            .arg(input);

        let stdout = capture(&mut command).map_err(|e| e.into_transfer(FFPROBE))?;
        let parsed: ProbeOutput =
            serde_json::from_slice(&stdout).map_err(|e| TransferError::InvalidInput {
                path: input.to_path_buf(),
                reason: format!("unreadable ffprobe output: {e}"),
            })?;

        Ok(parsed
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| (secs * 1_000_000.0) as u64))
    }
}

impl Converter for FfmpegConverter {
    fn extract_audio(
        &self,
        request: &ConversionRequest,
        control: &TransferControl,
        progress: ProgressSender,
    ) -> Result<TransferOutcome, TransferError> {
        if !request.input.is_file() {
            return Err(TransferError::InvalidInput {
                path: request.input.clone(),
                reason: "input file does not exist".to_string(),
            });
        }

        if let Some(parent) = request.output.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TransferError::Io {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        // Without a duration, progress stays unknown
        let total_us = match self.media_duration_us(&request.input) {
            Ok(duration) => duration,
            Err(e) => {
                warn!("Could not read the duration of {}: {}", request.input.display(), e);
                None
            }
        };

        info!(
            "Extracting audio from {} to {} at {}",
            request.input.display(),
            request.output.display(),
            request.bitrate
        );

        let mut command = Command::new(&self.config.ffmpeg);
        command
            .args(["-nostdin", "-y", "-i"])
            .arg(&request.input)
            .args(["-vn", "-acodec", "libmp3lame", "-b:a"])
            .arg(request.bitrate.ffmpeg_arg())
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(&request.output);

        run_streaming(&mut command, control, |line| {
            if let Some(done_us) = parse_progress_line(line) {
                let _ = progress.send(TransferProgress::new(done_us, total_us));
            }
        })
        .map_err(|e| e.into_transfer(FFMPEG))?;

        debug!("ffmpeg finished {}", request.output.display());

        Ok(TransferOutcome {
            title: request
                .input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
            output_path: request.output.clone(),
        })
    }
}

/// Default output for an audio extraction: `<input dir>/audio/<stem>.mp3`.
#[must_use]
pub fn default_audio_output(input: &Path) -> PathBuf {
    input
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(AUDIO_SUBDIR)
        .join(audio_file_name(input))
}

/// File name of the mp3 extracted from `input`: its sanitized stem plus
/// `.mp3`, or `audio.mp3` when nothing usable is left.
#[must_use]
pub fn audio_file_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| sanitize_filename(&s.to_string_lossy()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "audio".to_string());
    format!("{stem}.mp3")
}

/// Parse an `out_time_us=` / `out_time_ms=` line of `-progress` output.
///
/// Both keys carry microseconds; `out_time_ms` is misnamed upstream.
fn parse_progress_line(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.trim().parse::<u64>().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

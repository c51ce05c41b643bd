//! Media descriptions and rendition types.
//!
//! [`RawMetadata`] mirrors what the extraction tool reports for a resource;
//! [`MediaDescription`] is the normalized, immutable snapshot handed to the
//! presentation layer.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::format::{format_duration, format_file_size};

/// Video container extensions recognized in the local library.
pub const SUPPORTED_VIDEO_EXTENSIONS: &[&str] =
    &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

/// Audio extensions recognized in the local library.
pub const SUPPORTED_AUDIO_EXTENSIONS: &[&str] =
    &["mp3", "wav", "ogg", "flac", "aac", "wma", "m4a"];

/// Raw metadata for a remote resource, as reported by the extractor.
///
/// Every field is optional: extractors differ wildly in what they fill in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    /// Resource title.
    #[serde(default)]
    pub title: Option<String>,
    /// Uploader / author name.
    #[serde(default)]
    pub uploader: Option<String>,
    /// Channel name, used when the uploader is missing.
    #[serde(default)]
    pub channel: Option<String>,
    /// Duration in seconds.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub duration: Option<u64>,
    /// Number of views.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub view_count: Option<u64>,
    /// Description text.
    #[serde(default)]
    pub description: Option<String>,
    /// Thumbnail URL.
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Extractor name (e.g. `"youtube"`).
    #[serde(default)]
    pub extractor: Option<String>,
    /// Extractor display key (e.g. `"Youtube"`).
    #[serde(default)]
    pub extractor_key: Option<String>,
    /// Available formats.
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

/// One raw format entry reported by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFormat {
    /// Extractor-specific format identifier.
    #[serde(default)]
    pub format_id: String,
    /// File extension.
    #[serde(default)]
    pub ext: Option<String>,
    /// Vertical resolution.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub height: Option<u64>,
    /// Frames per second.
    #[serde(default)]
    pub fps: Option<f64>,
    /// Video codec, `"none"` for audio-only formats.
    #[serde(default)]
    pub vcodec: Option<String>,
    /// Audio codec, `"none"` for video-only formats.
    #[serde(default)]
    pub acodec: Option<String>,
    /// Average audio bitrate in kbps.
    #[serde(default)]
    pub abr: Option<f64>,
    /// Exact file size in bytes.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize: Option<u64>,
    /// Approximate file size in bytes.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize_approx: Option<u64>,
}

impl RawFormat {
    /// Whether a visual track is present. A missing codec field counts as present.
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    /// Whether an audio track is present. A missing codec field counts as present.
    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    /// Exact size, or the approximate one.
    #[must_use]
    pub fn size_bytes(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx).filter(|size| *size > 0)
    }
}

/// Accept integers, non-negative floats or null for a `u64` field.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_u64().or_else(|| {
            v.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })
    }))
}

/// A rendition carrying both a visual and an audio track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRendition {
    /// Extractor-specific format identifier.
    pub format_id: String,
    /// Vertical resolution, if known.
    pub height: Option<u64>,
    /// File extension.
    pub extension: String,
    /// Frames per second.
    pub fps: Option<f64>,
    /// Video codec.
    pub video_codec: Option<String>,
    /// Audio codec.
    pub audio_codec: Option<String>,
    /// Size in bytes, if known.
    pub size_bytes: Option<u64>,
}

impl VideoRendition {
    /// Quality label, e.g. `"720p"`.
    #[must_use]
    pub fn label(&self) -> String {
        self.height
            .map_or_else(|| "unknown".to_string(), |h| format!("{h}p"))
    }

    /// Human-readable size.
    #[must_use]
    pub fn size_label(&self) -> String {
        self.size_bytes
            .map_or_else(|| "unknown".to_string(), format_file_size)
    }
}

/// An audio-only rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRendition {
    /// Extractor-specific format identifier.
    pub format_id: String,
    /// Average bitrate in kbps, if known.
    pub bitrate_kbps: Option<u32>,
    /// File extension.
    pub extension: String,
    /// Audio codec.
    pub audio_codec: Option<String>,
    /// Size in bytes, if known.
    pub size_bytes: Option<u64>,
}

impl AudioRendition {
    /// Quality label, e.g. `"128 kbps"`.
    #[must_use]
    pub fn label(&self) -> String {
        self.bitrate_kbps
            .map_or_else(|| "unknown".to_string(), |kbps| format!("{kbps} kbps"))
    }

    /// Human-readable size.
    #[must_use]
    pub fn size_label(&self) -> String {
        self.size_bytes
            .map_or_else(|| "unknown".to_string(), format_file_size)
    }
}

/// Normalized description of a remote media resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// The locator that was resolved.
    pub locator: String,
    /// Title.
    pub title: String,
    /// Uploader / author.
    pub uploader: String,
    /// Duration in seconds (0 when unknown).
    pub duration_secs: u64,
    /// View count (0 when unknown).
    pub view_count: u64,
    /// Description text.
    pub description: String,
    /// Thumbnail URL.
    pub thumbnail_url: Option<String>,
    /// Platform label.
    pub platform: String,
    /// Renditions with video and audio, best first.
    pub video_renditions: Vec<VideoRendition>,
    /// Audio-only renditions, best first.
    pub audio_renditions: Vec<AudioRendition>,
}

impl MediaDescription {
    /// Duration formatted as `MM:SS` / `HH:MM:SS`.
    #[must_use]
    pub fn duration_label(&self) -> String {
        format_duration(self.duration_secs)
    }
}

/// Kind of a local media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFileKind {
    /// A video container.
    Video,
    /// An audio file.
    Audio,
}

impl MediaFileKind {
    /// Classify a path by its extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        if SUPPORTED_VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            Some(Self::Video)
        } else if SUPPORTED_AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            Some(Self::Audio)
        } else {
            None
        }
    }
}

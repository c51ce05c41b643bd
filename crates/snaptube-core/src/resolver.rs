//! Media info resolution.
//!
//! [`MediaResolver`] turns a locator into a [`MediaDescription`]: the locator
//! is validated first, the extractor is asked for raw metadata, and the
//! result is normalized into placeholders and sorted rendition lists.

use std::cmp::Reverse;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::Extractor;
use crate::error::{Error, Result};
use crate::locator::{Platform, validate_locator};
use crate::media::{AudioRendition, MediaDescription, RawFormat, RawMetadata, VideoRendition};

/// Placeholder for a missing title.
pub const UNTITLED: &str = "Untitled";
/// Placeholder for a missing uploader.
pub const UNKNOWN_UPLOADER: &str = "Unknown";
/// Placeholder for a missing description.
pub const NO_DESCRIPTION: &str = "No description";

/// Extractor label used for sites without a dedicated extractor.
const GENERIC_EXTRACTOR: &str = "generic";

/// Resolves locators into media descriptions.
///
/// Stateless apart from the extractor handle; never touches the job registry.
#[derive(Clone)]
pub struct MediaResolver {
    extractor: Arc<dyn Extractor>,
}

impl std::fmt::Debug for MediaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaResolver").finish_non_exhaustive()
    }
}

impl MediaResolver {
    /// Create a resolver over an extractor.
    #[must_use]
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }

    /// Resolve a locator, blocking until the extractor answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocator`] without calling the extractor when
    /// the locator is malformed, and [`Error::Resolution`] when extraction
    /// fails.
    pub fn resolve(&self, locator: &str) -> Result<MediaDescription> {
        let url = validate_locator(locator)?;
        let locator = locator.trim();

        debug!("Resolving {}", locator);
        let raw = self.extractor.extract(locator).map_err(|e| {
            warn!("Failed to resolve {}: {}", locator, e);
            Error::from(e)
        })?;

        let description = normalize(locator, Platform::detect(&url), raw);
        info!(
            "Resolved '{}' ({} video, {} audio renditions)",
            description.title,
            description.video_renditions.len(),
            description.audio_renditions.len()
        );
        Ok(description)
    }

    /// Resolve a locator on tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`MediaResolver::resolve`], plus [`Error::Runtime`] if the
    /// blocking task dies.
    pub async fn resolve_async(&self, locator: &str) -> Result<MediaDescription> {
        let resolver = self.clone();
        let locator = locator.to_string();
        tokio::task::spawn_blocking(move || resolver.resolve(&locator))
            .await
            .map_err(|e| Error::Runtime(format!("resolver task failed: {e}")))?
    }
}

fn normalize(locator: &str, detected: Platform, raw: RawMetadata) -> MediaDescription {
    let (video_renditions, audio_renditions) = partition_renditions(&raw.formats);

    let platform = raw
        .extractor_key
        .or(raw.extractor)
        .filter(|label| !label.trim().is_empty() && !label.eq_ignore_ascii_case(GENERIC_EXTRACTOR))
        .unwrap_or_else(|| detected.label().to_string());

    MediaDescription {
        locator: locator.to_string(),
        title: non_empty(raw.title).unwrap_or_else(|| UNTITLED.to_string()),
        uploader: non_empty(raw.uploader)
            .or_else(|| non_empty(raw.channel))
            .unwrap_or_else(|| UNKNOWN_UPLOADER.to_string()),
        duration_secs: raw.duration.unwrap_or(0),
        view_count: raw.view_count.unwrap_or(0),
        description: non_empty(raw.description).unwrap_or_else(|| NO_DESCRIPTION.to_string()),
        thumbnail_url: non_empty(raw.thumbnail),
        platform,
        video_renditions,
        audio_renditions,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Split raw formats into combined video renditions and audio-only ones.
///
/// Both lists are sorted best first; entries without the sort metric keep
/// their relative order at the end.
fn partition_renditions(formats: &[RawFormat]) -> (Vec<VideoRendition>, Vec<AudioRendition>) {
    let mut video = Vec::new();
    let mut audio = Vec::new();

    for format in formats {
        if format.has_video() && format.has_audio() {
            video.push(VideoRendition {
                format_id: format.format_id.clone(),
                height: format.height,
                extension: format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
                fps: format.fps,
                video_codec: format.vcodec.clone(),
                audio_codec: format.acodec.clone(),
                size_bytes: format.size_bytes(),
            });
        } else if !format.has_video() && format.has_audio() {
            audio.push(AudioRendition {
                format_id: format.format_id.clone(),
                bitrate_kbps: format
                    .abr
                    .filter(|abr| abr.is_finite() && *abr > 0.0)
                    .map(|abr| abr.round() as u32),
                extension: format.ext.clone().unwrap_or_else(|| "mp3".to_string()),
                audio_codec: format.acodec.clone(),
                size_bytes: format.size_bytes(),
            });
        }
    }

    // sort_by_key is stable; `None` sorts after every `Some(Reverse(_))`
    video.sort_by_key(|r| missing_last(r.height));
    audio.sort_by_key(|r| missing_last(r.bitrate_kbps.map(u64::from)));

    (video, audio)
}

fn missing_last(metric: Option<u64>) -> (bool, Reverse<u64>) {
    (metric.is_none(), Reverse(metric.unwrap_or(0)))
}

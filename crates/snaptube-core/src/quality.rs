//! Quality selectors for video and audio jobs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Requested video quality, mapped onto a yt-dlp format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoQuality {
    /// At most 144 lines.
    P144,
    /// At most 240 lines.
    P240,
    /// At most 360 lines.
    P360,
    /// At most 480 lines.
    P480,
    /// At most 720 lines.
    #[default]
    P720,
    /// At most 1080 lines.
    P1080,
    /// At most 1440 lines.
    P1440,
    /// At most 2160 lines.
    P2160,
    /// Best available rendition.
    Best,
    /// Smallest available rendition.
    Worst,
}

impl VideoQuality {
    /// All qualities in display order.
    pub const ALL: [Self; 10] = [
        Self::P144,
        Self::P240,
        Self::P360,
        Self::P480,
        Self::P720,
        Self::P1080,
        Self::P1440,
        Self::P2160,
        Self::Best,
        Self::Worst,
    ];

    /// Human-readable label, as stored in settings.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::P144 => "144p",
            Self::P240 => "240p",
            Self::P360 => "360p",
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::P1440 => "1440p",
            Self::P2160 => "4K",
            Self::Best => "best",
            Self::Worst => "worst",
        }
    }

    /// yt-dlp format selector for this quality.
    ///
    /// Low resolutions pick the worst stream under the cap, which keeps the
    /// file small; everything from 480p up picks the best one.
    #[must_use]
    pub const fn format_selector(self) -> &'static str {
        match self {
            Self::P144 => "worst[height<=144]",
            Self::P240 => "worst[height<=240]",
            Self::P360 => "worst[height<=360]",
            Self::P480 => "best[height<=480]",
            Self::P720 => "best[height<=720]",
            Self::P1080 => "best[height<=1080]",
            Self::P1440 => "best[height<=1440]",
            Self::P2160 => "best[height<=2160]",
            Self::Best => "best",
            Self::Worst => "worst",
        }
    }

    /// Resolve a free-form label to a format selector.
    ///
    /// Unknown labels select the best rendition.
    #[must_use]
    pub fn selector_for(label: &str) -> &'static str {
        label
            .parse::<Self>()
            .map_or(Self::Best.format_selector(), Self::format_selector)
    }
}

impl std::fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for VideoQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "144p" => Ok(Self::P144),
            "240p" => Ok(Self::P240),
            "360p" => Ok(Self::P360),
            "480p" => Ok(Self::P480),
            "720p" => Ok(Self::P720),
            "1080p" => Ok(Self::P1080),
            "1440p" => Ok(Self::P1440),
            "4k" | "2160p" => Ok(Self::P2160),
            "best" => Ok(Self::Best),
            "worst" => Ok(Self::Worst),
            _ => Err(format!("Unknown video quality: {s}")),
        }
    }
}

/// Audio bitrate in kbps for audio downloads and conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AudioBitrate(u32);

impl AudioBitrate {
    /// Supported bitrates.
    pub const SUPPORTED: [u32; 5] = [64, 128, 192, 256, 320];

    /// Default bitrate (192 kbps).
    pub const DEFAULT: Self = Self(192);

    /// Bitrate in kbps.
    #[must_use]
    pub const fn kbps(self) -> u32 {
        self.0
    }

    /// Label used in job identities and displays, e.g. `"192 kbps"`.
    #[must_use]
    pub fn label(self) -> String {
        format!("{} kbps", self.0)
    }

    /// ffmpeg / yt-dlp bitrate argument, e.g. `"192k"`.
    #[must_use]
    pub fn ffmpeg_arg(self) -> String {
        format!("{}k", self.0)
    }
}

impl Default for AudioBitrate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for AudioBitrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} kbps", self.0)
    }
}

impl FromStr for AudioBitrate {
    type Err = String;

    /// Accepts `"192"`, `"192k"` and `"192 kbps"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let digits = lowered
            .strip_suffix("kbps")
            .or_else(|| lowered.strip_suffix('k'))
            .unwrap_or(&lowered)
            .trim();

        let kbps: u32 = digits
            .parse()
            .map_err(|_| format!("Invalid audio bitrate: {s}"))?;

        if Self::SUPPORTED.contains(&kbps) {
            Ok(Self(kbps))
        } else {
            Err(format!("Unsupported audio bitrate: {kbps} kbps"))
        }
    }
}

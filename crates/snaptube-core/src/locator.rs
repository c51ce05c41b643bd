//! Locator validation and platform detection.
//!
//! A locator is the URL of a remote media resource. It is validated before
//! any job starts or any extractor is called.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Platform hosting a remote media resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Platform {
    /// youtube.com / youtu.be
    YouTube,
    /// facebook.com / fb.watch
    Facebook,
    /// instagram.com
    Instagram,
    /// tiktok.com
    TikTok,
    /// twitter.com / x.com
    Twitter,
    /// vimeo.com
    Vimeo,
    /// dailymotion.com
    Dailymotion,
    /// soundcloud.com
    SoundCloud,
    /// twitch.tv
    Twitch,
    /// reddit.com
    Reddit,
    /// Any other host.
    #[default]
    Other,
}

/// Known domains per platform. Subdomains match too.
const PLATFORM_DOMAINS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
    ("instagram.com", Platform::Instagram),
    ("tiktok.com", Platform::TikTok),
    ("twitter.com", Platform::Twitter),
    ("x.com", Platform::Twitter),
    ("vimeo.com", Platform::Vimeo),
    ("dailymotion.com", Platform::Dailymotion),
    ("soundcloud.com", Platform::SoundCloud),
    ("twitch.tv", Platform::Twitch),
    ("reddit.com", Platform::Reddit),
];

impl Platform {
    /// Detect the platform from a parsed URL's host.
    #[must_use]
    pub fn detect(url: &Url) -> Self {
        let Some(host) = url.host_str() else {
            return Self::Other;
        };
        let host = host.to_lowercase();

        PLATFORM_DOMAINS
            .iter()
            .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{domain}")))
            .map_or(Self::Other, |(_, platform)| *platform)
    }

    /// Display label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::YouTube => "YouTube",
            Self::Facebook => "Facebook",
            Self::Instagram => "Instagram",
            Self::TikTok => "TikTok",
            Self::Twitter => "Twitter",
            Self::Vimeo => "Vimeo",
            Self::Dailymotion => "Dailymotion",
            Self::SoundCloud => "SoundCloud",
            Self::Twitch => "Twitch",
            Self::Reddit => "Reddit",
            Self::Other => "Unknown",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Validate a locator and return the parsed URL.
///
/// The locator must be an absolute `http`/`https` URL with a host.
pub fn validate_locator(locator: &str) -> Result<Url> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_locator(locator, "URL cannot be empty"));
    }

    let url = Url::parse(trimmed).map_err(|e| Error::invalid_locator(locator, e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_locator(
            locator,
            "URL must start with http:// or https://",
        ));
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::invalid_locator(locator, "URL has no host"));
    }

    Ok(url)
}

/// Result of analysing a locator before submitting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorAnalysis {
    /// Whether the locator is valid.
    pub is_valid: bool,
    /// Platform detected from the host.
    pub platform: Platform,
    /// The normalized URL (if valid).
    pub normalized_url: Option<String>,
    /// Error message if validation failed.
    pub error_message: Option<String>,
}

/// Analyse a locator: validate it and detect its platform.
#[must_use]
pub fn analyze_locator(locator: &str) -> LocatorAnalysis {
    match validate_locator(locator) {
        Ok(url) => LocatorAnalysis {
            is_valid: true,
            platform: Platform::detect(&url),
            normalized_url: Some(url.to_string()),
            error_message: None,
        },
        Err(e) => LocatorAnalysis {
            is_valid: false,
            platform: Platform::Other,
            normalized_url: None,
            error_message: Some(e.to_string()),
        },
    }
}

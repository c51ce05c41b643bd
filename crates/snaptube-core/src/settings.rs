//! Application settings management.
//!
//! Settings live in a flat JSON document mapping option names to values.
//! The document is loaded once, kept in memory, and rewritten in full on
//! every mutation. A missing or corrupted document is replaced by the fixed
//! default set instead of surfacing an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, SettingsError};
use crate::quality::AudioBitrate;

/// Recognized settings keys.
pub mod keys {
    /// Presentation color scheme.
    pub const THEME: &str = "theme";
    /// Presentation locale.
    pub const LANGUAGE: &str = "language";
    /// Default destination directory for new jobs.
    pub const DOWNLOAD_PATH: &str = "download_path";
    /// Default rendition selector for new video jobs.
    pub const DEFAULT_QUALITY: &str = "default_quality";
    /// Whether completed video jobs also trigger an audio extraction.
    pub const AUTO_CONVERT_AUDIO: &str = "auto_convert_audio";
    /// Maximum number of jobs transferring at the same time.
    pub const CONCURRENT_DOWNLOADS: &str = "concurrent_downloads";
    /// Whether notifications play a sound.
    pub const NOTIFICATION_SOUND: &str = "notification_sound";
}

/// Default number of concurrently running jobs.
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;

/// Minimum allowed concurrent jobs.
pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

/// Maximum allowed concurrent jobs.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Default video quality label.
pub const DEFAULT_QUALITY: &str = "720p";

/// Theme setting for the application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    /// Dark theme (default).
    #[default]
    Dark,
    /// Light theme.
    Light,
    /// Follow system preference.
    Auto,
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dark => write!(f, "dark"),
            Self::Light => write!(f, "light"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Typed view over the settings document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Presentation color scheme.
    pub theme: Theme,
    /// Presentation locale.
    pub language: String,
    /// Default destination directory for new jobs.
    pub download_path: PathBuf,
    /// Default rendition selector for new video jobs.
    pub default_quality: String,
    /// Whether completed video jobs also trigger an audio extraction.
    pub auto_convert_audio: bool,
    /// Maximum number of jobs transferring at the same time.
    pub concurrent_downloads: usize,
    /// Whether notifications play a sound.
    pub notification_sound: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            language: "en".to_string(),
            download_path: default_download_directory(),
            default_quality: DEFAULT_QUALITY.to_string(),
            auto_convert_audio: false,
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            notification_sound: true,
        }
    }
}

impl Settings {
    /// The admission limit clamped to the supported range.
    #[must_use]
    pub fn max_concurrent_jobs(&self) -> usize {
        self.concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS)
    }

    /// The bitrate used when a completed video is converted to audio.
    #[must_use]
    pub const fn conversion_bitrate(&self) -> AudioBitrate {
        AudioBitrate::DEFAULT
    }

    fn to_document(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Persistent, thread-safe key/value settings store.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    document: RwLock<Map<String, Value>>,
}

impl SettingsStore {
    /// Open the store at `path`.
    ///
    /// If the document is absent, unreadable, or not a JSON object, the
    /// default set is used and written back immediately.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let defaults = Settings::default().to_document();

        let document = match read_document(&path) {
            Ok(mut document) => {
                for (key, value) in &defaults {
                    document.entry(key.clone()).or_insert_with(|| value.clone());
                }
                info!("Loaded settings from {}", path.display());
                document
            }
            Err(e) => {
                if path.exists() {
                    warn!("Replacing unusable settings with defaults: {}", e);
                } else {
                    debug!("Settings file not found, using defaults");
                }
                if let Err(e) = write_document(&path, &defaults) {
                    warn!("Failed to save default settings: {}", e);
                }
                defaults
            }
        };

        Self {
            path,
            document: RwLock::new(document),
        }
    }

    /// Open the store at the platform default location.
    pub fn open_default() -> Self {
        Self::open(default_settings_path())
    }

    /// Path of the persisted document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a setting, or `default` when it is missing or has another type.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_value(key)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(default)
    }

    /// Get the raw JSON value of a setting.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let document = self.document.read().unwrap_or_else(PoisonError::into_inner);
        document.get(key).cloned()
    }

    /// Set a setting and rewrite the whole document.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut document = self
            .document
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Memory only changes once the document is on disk
        let mut updated = document.clone();
        updated.insert(key.to_string(), value);
        write_document(&self.path, &updated)?;
        *document = updated;
        debug!("Setting '{}' updated", key);
        Ok(())
    }

    /// Typed snapshot of the current settings.
    #[must_use]
    pub fn snapshot(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            theme: self.get(keys::THEME, defaults.theme),
            language: self.get(keys::LANGUAGE, defaults.language),
            download_path: self.get(keys::DOWNLOAD_PATH, defaults.download_path),
            default_quality: self.get(keys::DEFAULT_QUALITY, defaults.default_quality),
            auto_convert_audio: self.get(keys::AUTO_CONVERT_AUDIO, defaults.auto_convert_audio),
            concurrent_downloads: self
                .get(keys::CONCURRENT_DOWNLOADS, defaults.concurrent_downloads),
            notification_sound: self.get(keys::NOTIFICATION_SOUND, defaults.notification_sound),
        }
    }

    /// Reset to the default set and persist it.
    pub fn reset(&self) -> Result<()> {
        let defaults = Settings::default().to_document();
        let mut document = self
            .document
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        write_document(&self.path, &defaults)?;
        *document = defaults;
        info!("Settings reset to defaults");
        Ok(())
    }
}

fn read_document(path: &Path) -> std::result::Result<Map<String, Value>, SettingsError> {
    let content = fs::read_to_string(path).map_err(|e| SettingsError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    match serde_json::from_str(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SettingsError::Parse {
            path: path.to_path_buf(),
            reason: "document is not a JSON object".to_string(),
        }),
        Err(e) => Err(SettingsError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn write_document(
    path: &Path,
    document: &Map<String, Value>,
) -> std::result::Result<(), SettingsError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| SettingsError::Write {
            path: path.to_path_buf(),
            reason: format!("Failed to create settings directory: {e}"),
        })?;
    }

    let content =
        serde_json::to_string_pretty(document).map_err(|e| SettingsError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    fs::write(path, content).map_err(|e| SettingsError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Get the default download directory.
#[must_use]
pub fn default_download_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// Get the default path of the settings document.
#[must_use]
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("snaptube")
        .join("settings.json")
}

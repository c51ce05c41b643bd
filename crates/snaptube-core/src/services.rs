//! Application services container.
//!
//! [`AppServices`] owns the long-lived components (settings, notifications,
//! job registry, resolver) and is built once at startup with explicit
//! configuration, then shut down explicitly on exit.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{Converter, Extractor};
use crate::error::Result;
use crate::ffmpeg::{FfmpegConfig, FfmpegConverter};
use crate::jobs::{JobRegistry, RegistryConfig};
use crate::library::{self, LibraryEntry};
use crate::notify::NotificationHub;
use crate::resolver::MediaResolver;
use crate::settings::{SettingsStore, default_settings_path};
use crate::ytdlp::{YtDlpConfig, YtDlpExtractor};

/// Startup configuration for [`AppServices`].
#[derive(Clone, Default)]
pub struct ServicesConfig {
    /// Settings file; the platform default when `None`.
    pub settings_path: Option<PathBuf>,
    /// `yt-dlp` configuration, used unless an extractor is supplied.
    pub ytdlp: YtDlpConfig,
    /// `ffmpeg` configuration, used unless a converter is supplied.
    pub ffmpeg: FfmpegConfig,
    extractor: Option<Arc<dyn Extractor>>,
    converter: Option<Arc<dyn Converter>>,
}

impl std::fmt::Debug for ServicesConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicesConfig")
            .field("settings_path", &self.settings_path)
            .field("ytdlp", &self.ytdlp)
            .field("ffmpeg", &self.ffmpeg)
            .field("custom_extractor", &self.extractor.is_some())
            .field("custom_converter", &self.converter.is_some())
            .finish()
    }
}

impl ServicesConfig {
    /// Use a specific settings file.
    #[must_use]
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    /// Use a custom extractor instead of `yt-dlp`.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Use a custom converter instead of `ffmpeg`.
    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }
}

/// The application's long-lived components.
#[derive(Debug, Clone)]
pub struct AppServices {
    settings: Arc<SettingsStore>,
    notifications: Arc<NotificationHub>,
    registry: JobRegistry,
    resolver: MediaResolver,
}

impl AppServices {
    /// Build every component. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Runtime`] outside a tokio runtime.
    pub fn initialize(config: ServicesConfig) -> Result<Self> {
        let settings_path = config
            .settings_path
            .clone()
            .unwrap_or_else(default_settings_path);
        let settings = Arc::new(SettingsStore::open(settings_path));
        let snapshot = settings.snapshot();

        info!(
            "Download directory from settings: {}",
            snapshot.download_path.display()
        );
        if let Err(e) = std::fs::create_dir_all(&snapshot.download_path) {
            warn!(
                "Could not create download directory {}: {}",
                snapshot.download_path.display(),
                e
            );
        }

        let extractor: Arc<dyn Extractor> = config
            .extractor
            .unwrap_or_else(|| Arc::new(YtDlpExtractor::new(config.ytdlp)));
        let converter: Arc<dyn Converter> = config
            .converter
            .unwrap_or_else(|| Arc::new(FfmpegConverter::new(config.ffmpeg)));

        let notifications = Arc::new(NotificationHub::new());
        let registry = JobRegistry::new(
            RegistryConfig::from_settings(&snapshot),
            Arc::clone(&extractor),
            converter,
            Arc::clone(&notifications),
        )?;
        let resolver = MediaResolver::new(extractor);

        info!("Services initialized");
        Ok(Self {
            settings,
            notifications,
            registry,
            resolver,
        })
    }

    /// Settings store.
    #[must_use]
    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    /// Notification hub.
    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.notifications
    }

    /// Job registry.
    #[must_use]
    pub const fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Media info resolver.
    #[must_use]
    pub const fn resolver(&self) -> &MediaResolver {
        &self.resolver
    }

    /// Media files currently in the download directory.
    pub fn library(&self) -> Result<Vec<LibraryEntry>> {
        library::scan(&self.settings.snapshot().download_path)
    }

    /// Cancel outstanding jobs and wait for their workers.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.registry.shutdown().await;
    }
}

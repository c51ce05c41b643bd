//! `SnapTube` Core Library
//!
//! This crate coordinates media downloads and audio conversions that are
//! delegated to external tools:
//! - Job registry with duplicate suppression, admission control, pause,
//!   cancellation, progress/completion hooks and a history log
//! - Media info resolution into normalized descriptions and renditions
//! - Notification hub fanning messages out to observers
//! - Persistent key/value settings with a fixed default set
//! - `yt-dlp` and `ffmpeg` subprocess backends behind mockable traits
//! - Local library scanning and structured logging setup
//!
//! # Error Handling
//!
//! Fallible operations return [`Result`], whose [`Error`] nests a typed
//! error per domain. See the [`error`] module for details.
//!
//! ```rust,ignore
//! use snaptube_core::{AppServices, JobCallbacks, JobRequest, ServicesConfig};
//!
//! let services = AppServices::initialize(ServicesConfig::default())?;
//! let job = services.registry().submit(
//!     JobRequest::video("https://vimeo.com/76979871", "720p"),
//!     JobCallbacks::new().on_progress(|id, p| println!("{id}: {}%", p.percent)),
//! )?;
//! ```

pub mod backend;
pub mod error;
pub mod ffmpeg;
pub mod format;
pub mod history;
pub mod jobs;
pub mod library;
pub mod locator;
pub mod logging;
pub mod media;
pub mod notify;
mod process;
pub mod quality;
pub mod resolver;
pub mod services;
pub mod settings;
pub mod ytdlp;

pub use backend::{
    ConversionRequest, Converter, Extractor, ProgressSender, TransferControl, TransferOutcome,
    TransferProgress, TransferRequest,
};
pub use error::{Error, ErrorKind, ResolutionError, Result, SettingsError, TransferError};
pub use ffmpeg::{FfmpegConfig, FfmpegConverter, default_audio_output};
pub use format::{format_duration, format_file_size, sanitize_filename};
pub use history::{DownloadHistory, HistoryEntry};
pub use jobs::{
    CompletionCallback, JobCallbacks, JobCompletion, JobIdentity, JobKind, JobProgress, JobRecord,
    JobRegistry, JobRequest, JobResult, JobStatus, ProgressCallback, RegistryConfig,
};
pub use library::{LibraryEntry, scan as scan_library};
pub use locator::{LocatorAnalysis, Platform, analyze_locator, validate_locator};
pub use logging::{LogFormat, LogRotation, LoggingConfig, LoggingError, LoggingGuard};
pub use media::{
    AudioRendition, MediaDescription, MediaFileKind, RawFormat, RawMetadata,
    SUPPORTED_AUDIO_EXTENSIONS, SUPPORTED_VIDEO_EXTENSIONS, VideoRendition,
};
pub use notify::{Notification, NotificationHub, Observer, Severity, SubscriptionId};
pub use quality::{AudioBitrate, VideoQuality};
pub use resolver::MediaResolver;
pub use services::{AppServices, ServicesConfig};
pub use settings::{Settings, SettingsStore, Theme};
pub use ytdlp::{YtDlpConfig, YtDlpExtractor};

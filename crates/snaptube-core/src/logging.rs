//! Structured logging setup.
//!
//! [`init`] installs one console layer and one rolling file layer. The console
//! honors `RUST_LOG` when it is set; the file always records this crate at the
//! configured file level, as text lines or JSON objects.

use std::io::IsTerminal;
use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const CRATE_TARGET: &str = "snaptube_core";

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directory receiving the log files.
    pub log_directory: PathBuf,
    /// File name prefix: `snaptube` gives `snaptube.2026-01-15.log`.
    pub log_file_prefix: String,
    /// Console level for this crate when `RUST_LOG` is unset.
    pub console_level: Level,
    /// File level for this crate.
    pub file_level: Level,
    /// How often a new file is started.
    pub rotation: LogRotation,
    /// Rotated files kept on disk; `None` keeps them all.
    pub retained_files: Option<usize>,
    /// Line format of the file.
    pub file_format: LogFormat,
}

/// Log rotation frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// Every hour.
    Hourly,
    /// Every day.
    Daily,
    /// A single file.
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

/// Log file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One human-readable line per event: timestamp, level, message.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl Default for LoggingConfig {
    /// Debug builds log this crate at DEBUG on the console and TRACE in the
    /// file; release builds one step quieter on both.
    fn default() -> Self {
        let (console_level, file_level) = if cfg!(debug_assertions) {
            (Level::DEBUG, Level::TRACE)
        } else {
            (Level::INFO, Level::DEBUG)
        };
        Self {
            log_directory: default_log_directory(),
            log_file_prefix: "snaptube".to_string(),
            console_level,
            file_level,
            rotation: LogRotation::Daily,
            retained_files: Some(7),
            file_format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Log into `directory`.
    #[must_use]
    pub fn with_log_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.log_directory = directory.into();
        self
    }

    /// Use `prefix` for file names.
    #[must_use]
    pub fn with_log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_file_prefix = prefix.into();
        self
    }

    /// Set the console level.
    #[must_use]
    pub const fn with_console_level(mut self, level: Level) -> Self {
        self.console_level = level;
        self
    }

    /// Set the rotation frequency.
    #[must_use]
    pub const fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the file format.
    #[must_use]
    pub const fn with_file_format(mut self, format: LogFormat) -> Self {
        self.file_format = format;
        self
    }
}

/// Keeps the file writer alive. Dropping it flushes pending entries.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the log directory or file cannot be opened, or if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let (writer, file_guard) = file_writer(config)?;

    let console = fmt::layer()
        .with_ansi(std::io::stdout().is_terminal())
        .with_target(false)
        .with_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| crate_filter("warn", config.console_level)),
        );

    // Exactly one of the two is installed
    let (text_file, json_file) = match config.file_format {
        LogFormat::Text => (
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(crate_filter("info", config.file_level)),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(crate_filter("info", config.file_level)),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(text_file)
        .with(json_file)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn file_writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    std::fs::create_dir_all(&config.log_directory).map_err(|e| {
        LoggingError::DirectoryCreationFailed {
            path: config.log_directory.clone(),
            reason: e.to_string(),
        }
    })?;

    let mut appender = RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(&config.log_file_prefix)
        .filename_suffix("log");
    if let Some(keep) = config.retained_files {
        appender = appender.max_log_files(keep.max(1));
    }
    let appender = appender
        .build(&config.log_directory)
        .map_err(|e| LoggingError::AppenderFailed(e.to_string()))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Other crates at `base`, this crate at `level`.
fn crate_filter(base: &str, level: Level) -> EnvFilter {
    EnvFilter::new(format!(
        "{base},{CRATE_TARGET}={}",
        level.as_str().to_ascii_lowercase()
    ))
}

/// `<data_local_dir>/snaptube/logs`.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snaptube")
        .join("logs")
}

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("Failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// The rolling file appender could not be opened.
    #[error("Failed to open log file: {0}")]
    AppenderFailed(String),

    /// A global subscriber was already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

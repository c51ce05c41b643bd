//! Error types for SnapTube core operations.
//!
//! Errors are grouped by domain: metadata resolution, transfers (downloads
//! and conversions), and settings persistence. The top-level [`Error`] wraps
//! them and exposes a flat [`ErrorKind`] for presentation code.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while retrieving metadata for a remote resource.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The extraction tool is not installed or not on `PATH`.
    #[error("{tool} is not installed or could not be started")]
    ToolMissing {
        /// Name of the missing tool.
        tool: String,
    },

    /// The extraction tool exited with a failure.
    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    ToolFailed {
        /// Name of the tool.
        tool: String,
        /// Process exit code, if any.
        code: Option<i32>,
        /// Tail of the tool's stderr output.
        stderr: String,
    },

    /// The tool produced metadata that could not be decoded.
    #[error("Malformed metadata: {reason}")]
    MalformedMetadata {
        /// Why decoding failed.
        reason: String,
    },

    /// I/O failure talking to the tool.
    #[error("I/O error during resolution: {0}")]
    Io(String),
}

/// Errors raised by a download or conversion in flight.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The tool performing the transfer is not installed.
    #[error("{tool} is not installed or could not be started")]
    ToolMissing {
        /// Name of the missing tool.
        tool: String,
    },

    /// The tool exited with a failure (network loss, unsupported codec, ...).
    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    ToolFailed {
        /// Name of the tool.
        tool: String,
        /// Process exit code, if any.
        code: Option<i32>,
        /// Tail of the tool's stderr output.
        stderr: String,
    },

    /// The transfer was cancelled before it finished.
    #[error("Transfer cancelled")]
    Cancelled,

    /// The input of a conversion is missing or unusable.
    #[error("Invalid input {path}: {reason}")]
    InvalidInput {
        /// Offending input path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Local I/O failure (disk full, permission denied, ...).
    #[error("I/O error at {path}: {reason}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Error message.
        reason: String,
    },

    /// The worker running the transfer died unexpectedly.
    #[error("Transfer worker failed: {0}")]
    Worker(String),
}

/// Errors raised by the settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings document could not be read.
    #[error("Failed to read settings {path}: {reason}")]
    Read {
        /// Settings file path.
        path: PathBuf,
        /// Error message.
        reason: String,
    },

    /// The settings document could not be written.
    #[error("Failed to write settings {path}: {reason}")]
    Write {
        /// Settings file path.
        path: PathBuf,
        /// Error message.
        reason: String,
    },

    /// The settings document is not valid JSON.
    #[error("Failed to parse settings {path}: {reason}")]
    Parse {
        /// Settings file path.
        path: PathBuf,
        /// Error message.
        reason: String,
    },
}

/// Errors that can occur in SnapTube core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The locator failed validation before any work started.
    #[error("Invalid locator '{locator}': {reason}")]
    InvalidLocator {
        /// The rejected locator.
        locator: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Metadata for a remote resource could not be retrieved.
    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    /// A download or conversion failed.
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Settings could not be loaded or saved.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// File system operation failed.
    #[error("File system error at {path}: {reason}")]
    FileSystem {
        /// Path where the error occurred.
        path: PathBuf,
        /// Error message.
        reason: String,
    },

    /// No async runtime was available for spawning workers.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Flat error category for presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid locator.
    InvalidLocator,
    /// Metadata resolution failure.
    Resolution,
    /// Download or conversion failure.
    Transfer,
    /// Settings failure.
    Settings,
    /// File system or IO failure.
    FileSystem,
    /// Runtime failure.
    Runtime,
    /// Serialization failure.
    Serialization,
}

impl Error {
    /// Create an invalid locator error.
    pub fn invalid_locator(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Get the category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidLocator { .. } => ErrorKind::InvalidLocator,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::Settings(_) => ErrorKind::Settings,
            Self::FileSystem { .. } | Self::Io(_) => ErrorKind::FileSystem,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether this error represents a user-initiated cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Transfer(TransferError::Cancelled))
    }
}

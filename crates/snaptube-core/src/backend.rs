//! Seams to the external extraction and conversion tools.
//!
//! The job registry never talks to a tool directly. It calls an
//! [`Extractor`] or a [`Converter`] on a blocking thread, hands it a
//! [`TransferControl`] for cooperative pause/cancel, and receives progress
//! through a [`ProgressSender`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ResolutionError, TransferError};
use crate::media::RawMetadata;
use crate::quality::AudioBitrate;

/// How often a paused transfer re-checks its control flags.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A progress tick reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Units done so far (bytes for downloads, microseconds for conversions).
    pub transferred: u64,
    /// Total units, if known.
    pub total: Option<u64>,
}

impl TransferProgress {
    /// Create a progress tick.
    #[must_use]
    pub const fn new(transferred: u64, total: Option<u64>) -> Self {
        Self { transferred, total }
    }

    /// Completion percentage in `[0, 100]`, or `None` when the total is unknown.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(total) if total > 0 => {
                let percent = self.transferred.saturating_mul(100) / total;
                Some(percent.min(100) as u8)
            }
            _ => None,
        }
    }
}

/// Channel on which backends report progress.
pub type ProgressSender = mpsc::UnboundedSender<TransferProgress>;

/// Cooperative pause/cancel signals shared between a job and its backend.
#[derive(Debug, Default)]
pub struct TransferControl {
    cancel: CancellationToken,
    paused: AtomicBool,
}

impl TransferControl {
    /// Create a control in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Request a pause.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Lift a pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether a pause is requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block the calling thread while paused.
    ///
    /// Returns `Err(Cancelled)` as soon as cancellation is observed, whether
    /// paused or not. Backends call this between units of work.
    pub fn checkpoint(&self) -> Result<(), TransferError> {
        loop {
            if self.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if !self.is_paused() {
                return Ok(());
            }
            std::thread::sleep(PAUSE_POLL_INTERVAL);
        }
    }
}

/// A download handed to an [`Extractor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Remote locator.
    pub locator: String,
    /// Format selector understood by the extractor.
    pub format_selector: String,
    /// Directory receiving the file.
    pub output_dir: PathBuf,
    /// Extract audio at this bitrate instead of keeping the video.
    pub audio: Option<AudioBitrate>,
}

/// An audio extraction handed to a [`Converter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Local input file.
    pub input: PathBuf,
    /// Output file to create.
    pub output: PathBuf,
    /// Target bitrate.
    pub bitrate: AudioBitrate,
}

/// What a finished transfer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Title reported by the tool, if any.
    pub title: Option<String>,
    /// Local file that was written.
    pub output_path: PathBuf,
}

/// Media extraction capability: metadata lookup and download.
#[cfg_attr(test, mockall::automock)]
pub trait Extractor: Send + Sync {
    /// Retrieve raw metadata for a locator. Blocks until the tool returns.
    fn extract(&self, locator: &str) -> Result<RawMetadata, ResolutionError>;

    /// Download a resource, reporting progress on `progress`.
    ///
    /// Implementations must honor `control` between units of work.
    fn download(
        &self,
        request: &TransferRequest,
        control: &TransferControl,
        progress: ProgressSender,
    ) -> Result<TransferOutcome, TransferError>;
}

/// Media conversion capability.
#[cfg_attr(test, mockall::automock)]
pub trait Converter: Send + Sync {
    /// Extract the audio track of a local file.
    fn extract_audio(
        &self,
        request: &ConversionRequest,
        control: &TransferControl,
        progress: ProgressSender,
    ) -> Result<TransferOutcome, TransferError>;
}

//! In-memory log of completed jobs.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::JobKind;

/// One successfully completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Title of the downloaded resource.
    pub title: String,
    /// Locator (or input path for conversions).
    pub locator: String,
    /// Quality label the job ran with.
    pub quality: String,
    /// Job kind.
    pub kind: JobKind,
    /// Output file.
    pub output_path: PathBuf,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Append-only history. Failed and cancelled jobs are never recorded.
#[derive(Debug, Default)]
pub struct DownloadHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl DownloadHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn append(&self, entry: HistoryEntry) {
        self.lock().push(entry);
    }

    /// Snapshot of all entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

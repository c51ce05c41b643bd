//! Job registry for downloads and conversions.
//!
//! This module tracks every live job by its structural [`JobIdentity`]:
//! - At most one live record per identity; duplicate submissions are no-ops
//! - One tokio task per job, with the blocking tool call on the blocking pool
//! - Admission control bounding the number of concurrent transfers
//! - Cooperative pause/resume and cancellation through [`TransferControl`]
//! - Progress and completion callbacks, history and notifications
//!
//! Records are evicted once a job reaches a terminal state, so polling a
//! finished job returns `None`.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{
    ConversionRequest, Converter, Extractor, TransferControl, TransferOutcome, TransferProgress,
    TransferRequest,
};
use crate::error::{Error, Result, TransferError};
use crate::ffmpeg::{audio_file_name, default_audio_output};
use crate::history::{DownloadHistory, HistoryEntry};
use crate::locator::validate_locator;
use crate::notify::NotificationHub;
use crate::quality::{AudioBitrate, VideoQuality};
use crate::settings::{MAX_CONCURRENT_DOWNLOADS, MIN_CONCURRENT_DOWNLOADS, Settings};

/// Subdirectory of the download directory receiving audio downloads.
pub const AUDIO_DOWNLOAD_SUBDIR: &str = "audio";

/// Format selector for audio downloads.
const AUDIO_FORMAT_SELECTOR: &str = "bestaudio/best";

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Download a video rendition.
    Video,
    /// Download audio only.
    Audio,
    /// Extract the audio track of a local file.
    Conversion,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Conversion => write!(f, "conversion"),
        }
    }
}

/// Structural key of a job: two identities are equal exactly when the
/// requests they came from are semantically identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    kind: JobKind,
    locator: String,
    quality: String,
}

impl JobIdentity {
    /// Build an identity. Locator and quality are trimmed.
    #[must_use]
    pub fn new(kind: JobKind, locator: &str, quality: &str) -> Self {
        Self {
            kind,
            locator: locator.trim().to_string(),
            quality: quality.trim().to_string(),
        }
    }

    /// Job kind.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.kind
    }

    /// Locator, or input path for conversions.
    #[must_use]
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Quality label.
    #[must_use]
    pub fn quality(&self) -> &str {
        &self.quality
    }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.kind, self.quality, self.locator)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for an admission slot.
    Preparing,
    /// Downloading.
    Downloading,
    /// Converting.
    Converting,
    /// Finished successfully.
    Completed,
    /// Failed.
    Error,
}

impl JobStatus {
    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "Preparing"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Converting => write!(f, "Converting"),
            Self::Completed => write!(f, "Completed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Payload of a successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// The job that produced it.
    pub identity: JobIdentity,
    /// Title of the resource.
    pub title: String,
    /// Produced file.
    pub output_path: PathBuf,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Outcome delivered to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCompletion {
    /// The job finished and produced a file.
    Succeeded(JobResult),
    /// The job failed; the string describes why.
    Failed(String),
}

impl JobCompletion {
    /// Whether the job succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Progress delivered to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Completion percentage in `[0, 100]`.
    pub percent: u8,
    /// Units transferred so far.
    pub bytes_transferred: u64,
    /// Total units, if known.
    pub bytes_total: Option<u64>,
}

/// Point-in-time view of a live job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identity.
    pub identity: JobIdentity,
    /// Job kind.
    pub kind: JobKind,
    /// Current state.
    pub status: JobStatus,
    /// Completion percentage in `[0, 100]`.
    pub progress: u8,
    /// Locator, or input path for conversions.
    pub locator: String,
    /// Quality label.
    pub quality: String,
    /// Destination directory.
    pub destination: PathBuf,
    /// Result, once completed.
    pub result: Option<JobResult>,
    /// Failure detail, once failed.
    pub error: Option<String>,
    /// Whether a pause was requested.
    pub paused: bool,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(identity: &JobIdentity, destination: PathBuf) -> Self {
        Self {
            identity: identity.clone(),
            kind: identity.kind,
            status: JobStatus::Preparing,
            progress: 0,
            locator: identity.locator.clone(),
            quality: identity.quality.clone(),
            destination,
            result: None,
            error: None,
            paused: false,
            created_at: Utc::now(),
        }
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    kind: JobKind,
    locator: String,
    quality: String,
    destination: Option<PathBuf>,
}

impl JobRequest {
    /// Download a video. An empty quality uses the configured default.
    pub fn video(locator: impl Into<String>, quality: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Video,
            locator: locator.into(),
            quality: quality.into(),
            destination: None,
        }
    }

    /// Download audio only, converted to mp3 at `bitrate`.
    pub fn audio(locator: impl Into<String>, bitrate: AudioBitrate) -> Self {
        Self {
            kind: JobKind::Audio,
            locator: locator.into(),
            quality: bitrate.label(),
            destination: None,
        }
    }

    /// Extract the audio track of a local file.
    pub fn conversion(input: impl AsRef<Path>, bitrate: AudioBitrate) -> Self {
        Self {
            kind: JobKind::Conversion,
            locator: input.as_ref().to_string_lossy().into_owned(),
            quality: bitrate.label(),
            destination: None,
        }
    }

    /// Write the output into `destination` instead of the default location.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Job kind.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.kind
    }
}

/// Called with every forwarded progress tick.
pub type ProgressCallback = Arc<dyn Fn(&JobIdentity, &JobProgress) + Send + Sync>;

/// Called once when a job reaches a terminal state.
pub type CompletionCallback = Arc<dyn Fn(&JobIdentity, &JobCompletion) + Send + Sync>;

/// Caller hooks for one job. Both are optional.
#[derive(Clone, Default)]
pub struct JobCallbacks {
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompletionCallback>,
}

impl std::fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl JobCallbacks {
    /// No hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the progress hook.
    #[must_use]
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobIdentity, &JobProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Set the completion hook.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobIdentity, &JobCompletion) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

/// Registry configuration, usually derived from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Default destination for downloads.
    pub download_dir: PathBuf,
    /// Quality used for video requests without one.
    pub default_quality: String,
    /// Queue an audio extraction after every completed video job.
    pub auto_convert_audio: bool,
    /// Maximum number of jobs transferring at once.
    pub max_concurrent_jobs: usize,
    /// Bitrate for automatic conversions and audio requests without one.
    pub conversion_bitrate: AudioBitrate,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RegistryConfig {
    /// Derive the configuration from a settings snapshot.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            download_dir: settings.download_path.clone(),
            default_quality: settings.default_quality.clone(),
            auto_convert_audio: settings.auto_convert_audio,
            max_concurrent_jobs: settings.max_concurrent_jobs(),
            conversion_bitrate: settings.conversion_bitrate(),
        }
    }

    /// Set the download directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Set the admission limit.
    #[must_use]
    pub const fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable automatic audio extraction.
    #[must_use]
    pub const fn with_auto_convert_audio(mut self, enabled: bool) -> Self {
        self.auto_convert_audio = enabled;
        self
    }

    fn admission_limit(&self) -> usize {
        self.max_concurrent_jobs
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS)
    }
}

/// The tool invocation a job performs.
#[derive(Debug, Clone)]
enum Work {
    Download(TransferRequest),
    Convert(ConversionRequest),
}

/// A validated request, ready to run.
#[derive(Debug)]
struct JobPlan {
    identity: JobIdentity,
    destination: PathBuf,
    work: Work,
}

impl JobPlan {
    fn prepare(request: JobRequest, config: &RegistryConfig) -> Result<Self> {
        let quality = request.quality.trim();
        match request.kind {
            JobKind::Video => {
                let locator = checked_locator(&request.locator)?;
                let label = if quality.is_empty() {
                    config.default_quality.trim()
                } else {
                    quality
                };
                // Spellings of the same quality share one identity
                let quality = label.parse::<VideoQuality>().unwrap_or(VideoQuality::Best);
                let destination = request
                    .destination
                    .unwrap_or_else(|| config.download_dir.clone());

                Ok(Self {
                    identity: JobIdentity::new(JobKind::Video, &locator, quality.label()),
                    work: Work::Download(TransferRequest {
                        locator,
                        format_selector: quality.format_selector().to_string(),
                        output_dir: destination.clone(),
                        audio: None,
                    }),
                    destination,
                })
            }
            JobKind::Audio => {
                let locator = checked_locator(&request.locator)?;
                let bitrate = quality
                    .parse::<AudioBitrate>()
                    .unwrap_or(config.conversion_bitrate);
                let destination = request
                    .destination
                    .unwrap_or_else(|| config.download_dir.join(AUDIO_DOWNLOAD_SUBDIR));

                Ok(Self {
                    identity: JobIdentity::new(JobKind::Audio, &locator, &bitrate.label()),
                    work: Work::Download(TransferRequest {
                        locator,
                        format_selector: AUDIO_FORMAT_SELECTOR.to_string(),
                        output_dir: destination.clone(),
                        audio: Some(bitrate),
                    }),
                    destination,
                })
            }
            JobKind::Conversion => {
                let input = PathBuf::from(request.locator.trim());
                if !input.is_file() {
                    return Err(Error::invalid_locator(
                        request.locator,
                        "input file does not exist",
                    ));
                }
                let bitrate = quality
                    .parse::<AudioBitrate>()
                    .unwrap_or(config.conversion_bitrate);
                let output = match request.destination {
                    Some(dir) => dir.join(audio_file_name(&input)),
                    None => default_audio_output(&input),
                };
                let destination = output
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

                Ok(Self {
                    identity: JobIdentity::new(
                        JobKind::Conversion,
                        &input.to_string_lossy(),
                        &bitrate.label(),
                    ),
                    work: Work::Convert(ConversionRequest {
                        input,
                        output,
                        bitrate,
                    }),
                    destination,
                })
            }
        }
    }
}

fn checked_locator(locator: &str) -> Result<String> {
    validate_locator(locator)?;
    Ok(locator.trim().to_string())
}

/// A live job as held by the registry.
struct LiveJob {
    record: JobRecord,
    control: Arc<TransferControl>,
    /// Distinguishes this run from a later job reusing the same identity.
    ticket: u64,
}

struct Inner {
    extractor: Arc<dyn Extractor>,
    converter: Arc<dyn Converter>,
    notifications: Arc<NotificationHub>,
    history: DownloadHistory,
    config: RegistryConfig,
    admission: Arc<Semaphore>,
    jobs: Mutex<HashMap<JobIdentity, LiveJob>>,
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_ticket: AtomicU64,
    shutting_down: AtomicBool,
    runtime: Handle,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobIdentity, LiveJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to the record if it still belongs to `ticket`.
    fn update_record<F>(&self, identity: &JobIdentity, ticket: u64, update: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        match self.jobs().get_mut(identity) {
            Some(job) if job.ticket == ticket => {
                update(&mut job.record);
                true
            }
            _ => false,
        }
    }

    /// Remove the record if it still belongs to `ticket`.
    fn evict(&self, identity: &JobIdentity, ticket: u64) {
        let mut jobs = self.jobs();
        if jobs.get(identity).is_some_and(|job| job.ticket == ticket) {
            jobs.remove(identity);
        }
    }
}

/// Registry of live download and conversion jobs.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("active", &self.active_count())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl JobRegistry {
    /// Create a registry whose workers run on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when called outside a tokio runtime.
    pub fn new(
        config: RegistryConfig,
        extractor: Arc<dyn Extractor>,
        converter: Arc<dyn Converter>,
        notifications: Arc<NotificationHub>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("job registry needs a tokio runtime: {e}")))?;

        let permits = config.admission_limit();
        info!("Job registry ready ({} concurrent jobs)", permits);

        Ok(Self {
            inner: Arc::new(Inner {
                extractor,
                converter,
                notifications,
                history: DownloadHistory::new(),
                admission: Arc::new(Semaphore::new(permits)),
                config,
                jobs: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                runtime,
            }),
        })
    }

    /// The registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Submit a job and return its identity immediately.
    ///
    /// If a job with the same identity is live, nothing new starts: a
    /// warning is published and the existing identity is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocator`] for a malformed locator or a missing
    /// conversion input, and [`Error::Runtime`] after [`JobRegistry::shutdown`].
    pub fn submit(&self, request: JobRequest, callbacks: JobCallbacks) -> Result<JobIdentity> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Runtime("job registry is shut down".to_string()));
        }

        let plan = JobPlan::prepare(request, &self.inner.config)?;
        let identity = plan.identity.clone();
        let control = Arc::new(TransferControl::new());

        let ticket = {
            let mut jobs = self.inner.jobs();
            if jobs.contains_key(&identity) {
                drop(jobs);
                debug!("Ignoring duplicate submission of {}", identity);
                self.inner
                    .notifications
                    .warning(format!("Already running: {}", identity.locator));
                return Ok(identity);
            }

            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            jobs.insert(
                identity.clone(),
                LiveJob {
                    record: JobRecord::new(&identity, plan.destination.clone()),
                    control: Arc::clone(&control),
                    ticket,
                },
            );
            ticket
        };

        info!("Submitted job {}", identity);

        let worker = Worker {
            inner: Arc::clone(&self.inner),
            identity: identity.clone(),
            ticket,
            control,
            callbacks,
        };

        // Hold the map while spawning so the worker cannot deregister first
        let mut workers = self.inner.workers();
        let handle = self.inner.runtime.spawn(worker.run(plan.work));
        workers.insert(ticket, handle);

        Ok(identity)
    }

    /// Request a pause. Returns `false` for unknown identities.
    pub fn pause(&self, identity: &JobIdentity) -> bool {
        self.set_paused(identity, true)
    }

    /// Lift a pause. Returns `false` for unknown identities.
    pub fn resume(&self, identity: &JobIdentity) -> bool {
        self.set_paused(identity, false)
    }

    fn set_paused(&self, identity: &JobIdentity, paused: bool) -> bool {
        let mut jobs = self.inner.jobs();
        let Some(job) = jobs.get_mut(identity) else {
            return false;
        };

        job.record.paused = paused;
        if paused {
            job.control.pause();
        } else {
            job.control.resume();
        }
        drop(jobs);

        info!("Job {} {}", identity, if paused { "paused" } else { "resumed" });
        true
    }

    /// Cancel a job: the record is evicted and the transfer aborted.
    ///
    /// Returns `false` for unknown identities.
    pub fn cancel(&self, identity: &JobIdentity) -> bool {
        let mut jobs = self.inner.jobs();
        let Some(control) = jobs.get(identity).map(|job| Arc::clone(&job.control)) else {
            return false;
        };
        // The token fires before eviction so a finishing worker sees it
        control.cancel();
        jobs.remove(identity);
        drop(jobs);

        info!("Cancelled job {}", identity);
        self.inner
            .notifications
            .info(format!("Cancelled: {}", identity.locator));
        true
    }

    /// Point-in-time copy of a live record.
    #[must_use]
    pub fn status(&self, identity: &JobIdentity) -> Option<JobRecord> {
        self.inner.jobs().get(identity).map(|job| job.record.clone())
    }

    /// Snapshot of every live record.
    #[must_use]
    pub fn list_active(&self) -> HashMap<JobIdentity, JobRecord> {
        self.inner
            .jobs()
            .iter()
            .map(|(identity, job)| (identity.clone(), job.record.clone()))
            .collect()
    }

    /// Number of live jobs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Completed jobs, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.entries()
    }

    /// Wait until every spawned worker has exited, including workers
    /// spawned while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut workers = self.inner.workers();
                workers.drain().map(|(_, handle)| handle).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Job worker ended abnormally: {}", e);
                }
            }
        }
    }

    /// Cancel every live job, refuse new ones and wait for workers to exit.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let drained: Vec<(JobIdentity, LiveJob)> = self.inner.jobs().drain().collect();
        if !drained.is_empty() {
            info!("Shutting down job registry, cancelling {} jobs", drained.len());
        }
        for (identity, job) in drained {
            debug!("Cancelling {} for shutdown", identity);
            job.control.cancel();
        }

        self.wait_idle().await;
        info!("Job registry stopped");
    }
}

/// Drives one job from admission to eviction.
struct Worker {
    inner: Arc<Inner>,
    identity: JobIdentity,
    ticket: u64,
    control: Arc<TransferControl>,
    callbacks: JobCallbacks,
}

impl Worker {
    async fn run(self, work: Work) {
        self.execute(work).await;
        self.inner.workers().remove(&self.ticket);
    }

    async fn execute(&self, work: Work) {
        let admission = Arc::clone(&self.inner.admission);
        let _permit = tokio::select! {
            permit = admission.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    self.fail(&TransferError::Worker(e.to_string()));
                    return;
                }
            },
            () = self.control.cancelled() => {
                debug!("Job {} cancelled before admission", self.identity);
                return;
            }
        };

        let status = match work {
            Work::Download(_) => JobStatus::Downloading,
            Work::Convert(_) => JobStatus::Converting,
        };
        if !self
            .inner
            .update_record(&self.identity, self.ticket, |record| record.status = status)
        {
            return;
        }
        info!("Job {} is now {}", self.identity, status);

        let (tx, mut rx) = mpsc::unbounded_channel::<TransferProgress>();
        let extractor = Arc::clone(&self.inner.extractor);
        let converter = Arc::clone(&self.inner.converter);
        let control = Arc::clone(&self.control);
        let operation = tokio::task::spawn_blocking(move || match work {
            Work::Download(request) => extractor.download(&request, &control, tx),
            Work::Convert(request) => converter.extract_audio(&request, &control, tx),
        });

        let mut last_percent: Option<u8> = None;
        while let Some(tick) = rx.recv().await {
            self.relay_progress(tick, &mut last_percent);
        }

        let outcome = operation
            .await
            .unwrap_or_else(|e| Err(TransferError::Worker(e.to_string())));

        if self.control.is_cancelled() {
            info!("Job {} stopped after cancellation", self.identity);
            return;
        }

        match outcome {
            Ok(outcome) => self.succeed(outcome),
            Err(e) => self.fail(&e),
        }
    }

    fn relay_progress(&self, tick: TransferProgress, last_percent: &mut Option<u8>) {
        let Some(percent) = tick.percent() else {
            return;
        };
        if last_percent.is_some_and(|last| percent <= last) {
            return;
        }
        if self.control.is_cancelled() {
            return;
        }

        let updated = self
            .inner
            .update_record(&self.identity, self.ticket, |record| record.progress = percent);
        if !updated {
            return;
        }
        *last_percent = Some(percent);

        debug!("Job {} at {}%", self.identity, percent);
        if let Some(callback) = &self.callbacks.on_progress {
            let progress = JobProgress {
                percent,
                bytes_transferred: tick.transferred,
                bytes_total: tick.total,
            };
            guarded("progress", || callback(&self.identity, &progress));
        }
    }

    fn succeed(&self, outcome: TransferOutcome) {
        let title = outcome
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                outcome
                    .output_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| self.identity.locator.clone());

        let result = JobResult {
            identity: self.identity.clone(),
            title: title.clone(),
            output_path: outcome.output_path.clone(),
            completed_at: Utc::now(),
        };

        let live = self.inner.update_record(&self.identity, self.ticket, |record| {
            record.status = JobStatus::Completed;
            record.progress = 100;
            record.result = Some(result.clone());
        });
        if !live || self.control.is_cancelled() {
            return;
        }

        info!(
            "Job {} completed: {}",
            self.identity,
            outcome.output_path.display()
        );

        if let Some(callback) = &self.callbacks.on_complete {
            let completion = JobCompletion::Succeeded(result.clone());
            guarded("completion", || callback(&self.identity, &completion));
        }

        self.inner.history.append(HistoryEntry {
            title: title.clone(),
            locator: self.identity.locator.clone(),
            quality: self.identity.quality.clone(),
            kind: self.identity.kind,
            output_path: result.output_path.clone(),
            completed_at: result.completed_at,
        });
        self.inner
            .notifications
            .success(format!("Completed: {title}"));

        self.inner.evict(&self.identity, self.ticket);

        if self.identity.kind == JobKind::Video && self.inner.config.auto_convert_audio {
            self.queue_conversion(&result.output_path);
        }
    }

    fn fail(&self, err: &TransferError) {
        let detail = err.to_string();
        let live = self.inner.update_record(&self.identity, self.ticket, |record| {
            record.status = JobStatus::Error;
            record.error = Some(detail.clone());
        });
        if !live || self.control.is_cancelled() {
            return;
        }

        error!("Job {} failed: {}", self.identity, detail);

        if let Some(callback) = &self.callbacks.on_complete {
            let completion = JobCompletion::Failed(detail.clone());
            guarded("completion", || callback(&self.identity, &completion));
        }

        self.inner
            .notifications
            .error(format!("Failed: {} ({detail})", self.identity.locator));

        self.inner.evict(&self.identity, self.ticket);
    }

    fn queue_conversion(&self, video: &Path) {
        let registry = JobRegistry {
            inner: Arc::clone(&self.inner),
        };
        let request = JobRequest::conversion(video, self.inner.config.conversion_bitrate);
        match registry.submit(request, JobCallbacks::default()) {
            Ok(identity) => info!("Queued audio extraction {}", identity),
            Err(e) => warn!("Could not queue audio extraction for {}: {}", video.display(), e),
        }
    }
}

/// Run a caller hook, logging instead of unwinding into the worker.
fn guarded<F: FnOnce()>(hook: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Job {} callback panicked", hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockConverter, MockExtractor, ProgressSender};
    use crate::notify::{Notification, Severity};
    use std::time::Duration;
    use tempfile::TempDir;

    const LOCATOR: &str = "https://www.youtube.com/watch?v=abc";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Progress(u8),
        Complete(bool),
    }

    struct Harness {
        registry: JobRegistry,
        events: Arc<Mutex<Vec<Event>>>,
        notifications: Arc<Mutex<Vec<Notification>>>,
        _dir: TempDir,
    }

    impl Harness {
        fn new(extractor: MockExtractor, converter: MockConverter, config: RegistryConfig) -> Self {
            let dir = TempDir::new().expect("tempdir");
            let hub = Arc::new(NotificationHub::new());
            let notifications = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&notifications);
            hub.subscribe(move |n| sink.lock().expect("lock").push(n.clone()));

            let registry = JobRegistry::new(
                config.with_download_dir(dir.path()),
                Arc::new(extractor),
                Arc::new(converter),
                hub,
            )
            .expect("registry");

            Self {
                registry,
                events: Arc::new(Mutex::new(Vec::new())),
                notifications,
                _dir: dir,
            }
        }

        fn callbacks(&self) -> JobCallbacks {
            let progress = Arc::clone(&self.events);
            let complete = Arc::clone(&self.events);
            JobCallbacks::new()
                .on_progress(move |_, p| progress.lock().expect("lock").push(Event::Progress(p.percent)))
                .on_complete(move |_, c| {
                    complete
                        .lock()
                        .expect("lock")
                        .push(Event::Complete(c.is_success()));
                })
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().expect("lock").clone()
        }

        fn severities(&self) -> Vec<Severity> {
            self.notifications
                .lock()
                .expect("lock")
                .iter()
                .map(|n| n.severity)
                .collect()
        }
    }

    fn config() -> RegistryConfig {
        RegistryConfig::default().with_max_concurrent_jobs(3)
    }

    fn outcome(path: &str) -> TransferOutcome {
        TransferOutcome {
            title: Some("Clip".to_string()),
            output_path: PathBuf::from(path),
        }
    }

    /// Block the backend until `gate` opens, honoring pause and cancel.
    fn hold(gate: &AtomicBool, control: &TransferControl) -> std::result::Result<(), TransferError> {
        while !gate.load(Ordering::SeqCst) {
            control.checkpoint()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        control.checkpoint()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_progress_then_completion_then_eviction() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_download()
            .times(1)
            .returning(|_, _, progress: ProgressSender| {
                for done in [10, 55, 100] {
                    progress.send(TransferProgress::new(done, Some(100))).expect("send");
                }
                Ok(outcome("/downloads/Clip.mp4"))
            });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let identity = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), harness.callbacks())
            .expect("submit");
        harness.registry.wait_idle().await;

        assert_eq!(
            harness.events(),
            vec![
                Event::Progress(10),
                Event::Progress(55),
                Event::Progress(100),
                Event::Complete(true)
            ]
        );
        assert!(harness.registry.status(&identity).is_none());
        assert_eq!(harness.registry.history().len(), 1);
        assert_eq!(harness.severities(), vec![Severity::Success]);
    }

    #[tokio::test]
    async fn test_progress_never_goes_backwards() {
        let mut extractor = MockExtractor::new();
        extractor.expect_download().returning(|_, _, progress: ProgressSender| {
            // Separate video and audio streams restart from zero
            for done in [30, 60, 10, 60, 90, 150] {
                progress.send(TransferProgress::new(done, Some(100))).expect("send");
            }
            Ok(outcome("/downloads/Clip.mp4"))
        });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), harness.callbacks())
            .expect("submit");
        harness.registry.wait_idle().await;

        assert_eq!(
            harness.events(),
            vec![
                Event::Progress(30),
                Event::Progress(60),
                Event::Progress(90),
                Event::Progress(100),
                Event::Complete(true)
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_reports_and_evicts() {
        let mut extractor = MockExtractor::new();
        extractor.expect_download().times(1).returning(|_, _, _| {
            Err(TransferError::ToolFailed {
                tool: "yt-dlp".to_string(),
                code: Some(1),
                stderr: "network unreachable".to_string(),
            })
        });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let details = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&details);
        let callbacks = JobCallbacks::new().on_complete(move |_, completion| {
            if let JobCompletion::Failed(detail) = completion {
                sink.lock().expect("lock").push(detail.clone());
            }
        });

        let identity = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), callbacks)
            .expect("submit");
        harness.registry.wait_idle().await;

        let details = details.lock().expect("lock");
        assert_eq!(details.len(), 1);
        assert!(details[0].contains("network unreachable"));
        assert_eq!(harness.severities(), vec![Severity::Error]);
        assert!(harness.registry.status(&identity).is_none());
        assert!(harness.registry.history().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submission_starts_one_worker() {
        let gate = Arc::new(AtomicBool::new(false));
        let backend_gate = Arc::clone(&gate);

        let mut extractor = MockExtractor::new();
        extractor
            .expect_download()
            .times(1)
            .returning(move |_, control, _| {
                hold(&backend_gate, control)?;
                Ok(outcome("/downloads/Clip.mp4"))
            });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let first = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), JobCallbacks::new())
            .expect("submit");
        let second = harness
            .registry
            .submit(JobRequest::video(format!("  {LOCATOR} "), " 720p"), JobCallbacks::new())
            .expect("submit");

        assert_eq!(first, second);
        assert_eq!(harness.registry.active_count(), 1);
        assert_eq!(harness.severities(), vec![Severity::Warning]);

        gate.store(true, Ordering::SeqCst);
        harness.registry.wait_idle().await;
        assert_eq!(harness.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_quality_spellings_share_one_identity() {
        let gate = Arc::new(AtomicBool::new(false));
        let backend_gate = Arc::clone(&gate);
        let selectors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&selectors);

        let mut extractor = MockExtractor::new();
        extractor
            .expect_download()
            .times(3)
            .returning(move |request, control, _| {
                seen.lock().expect("lock").push(request.format_selector.clone());
                hold(&backend_gate, control)?;
                Ok(outcome("/downloads/Clip.mp4"))
            });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let submit = |quality: &str| {
            harness
                .registry
                .submit(JobRequest::video(LOCATOR, quality), JobCallbacks::new())
                .expect("submit")
        };

        let lower = submit("720p");
        let upper = submit("720P");
        assert_eq!(lower, upper);
        assert_eq!(lower.quality(), "720p");

        let uhd = submit("2160p");
        assert_eq!(submit("4K"), uhd);
        assert_eq!(uhd.quality(), "4K");

        let unknown = submit("8K");
        assert_eq!(submit("best"), unknown);
        assert_eq!(unknown.quality(), "best");

        assert_eq!(harness.registry.active_count(), 3);

        gate.store(true, Ordering::SeqCst);
        harness.registry.wait_idle().await;

        let mut selectors = selectors.lock().expect("lock").clone();
        selectors.sort();
        assert_eq!(
            selectors,
            vec!["best", "best[height<=2160]", "best[height<=720]"]
        );
    }

    #[tokio::test]
    async fn test_cancel_wins_over_a_finishing_backend() {
        let mut extractor = MockExtractor::new();
        extractor.expect_download().returning(|_, control, _| {
            // Finishes as soon as cancellation is visible, ignoring it
            while !control.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(outcome("/downloads/Clip.mp4"))
        });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let identity = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), harness.callbacks())
            .expect("submit");

        let registry = harness.registry.clone();
        let watched = identity.clone();
        wait_until(move || {
            registry
                .status(&watched)
                .is_some_and(|r| r.status == JobStatus::Downloading)
        })
        .await;

        assert!(harness.registry.cancel(&identity));
        harness.registry.wait_idle().await;

        assert!(harness.events().is_empty());
        assert!(harness.registry.history().is_empty());
        assert_eq!(harness.severities(), vec![Severity::Info]);
    }

    #[tokio::test]
    async fn test_invalid_locator_rejected_before_any_work() {
        let mut extractor = MockExtractor::new();
        extractor.expect_download().never();

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let err = harness
            .registry
            .submit(JobRequest::video("not a url", "720p"), JobCallbacks::new())
            .expect_err("invalid locator");

        assert!(matches!(err, Error::InvalidLocator { .. }));
        assert_eq!(harness.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_conversion_input_rejected() {
        let harness = Harness::new(MockExtractor::new(), MockConverter::new(), config());
        let err = harness
            .registry
            .submit(
                JobRequest::conversion("/definitely/not/here.mp4", AudioBitrate::DEFAULT),
                JobCallbacks::new(),
            )
            .expect_err("missing input");
        assert!(matches!(err, Error::InvalidLocator { .. }));
    }

    #[tokio::test]
    async fn test_admission_limit_and_cancel_while_waiting() {
        let gate = Arc::new(AtomicBool::new(false));
        let backend_gate = Arc::clone(&gate);

        let mut extractor = MockExtractor::new();
        extractor
            .expect_download()
            .times(1)
            .returning(move |_, control, _| {
                hold(&backend_gate, control)?;
                Ok(outcome("/downloads/First.mp4"))
            });

        let harness = Harness::new(
            extractor,
            MockConverter::new(),
            config().with_max_concurrent_jobs(1),
        );
        let first = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), JobCallbacks::new())
            .expect("submit");
        let second = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "1080p"), harness.callbacks())
            .expect("submit");

        let registry = harness.registry.clone();
        let running = first.clone();
        wait_until(move || {
            registry
                .status(&running)
                .is_some_and(|r| r.status == JobStatus::Downloading)
        })
        .await;

        let waiting = harness.registry.status(&second).expect("second is live");
        assert_eq!(waiting.status, JobStatus::Preparing);

        assert!(harness.registry.cancel(&second));
        assert!(!harness.registry.cancel(&second));
        assert!(harness.registry.status(&second).is_none());

        gate.store(true, Ordering::SeqCst);
        harness.registry.wait_idle().await;

        assert!(harness.events().is_empty());
        assert_eq!(harness.registry.history().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job_discards_result() {
        let mut extractor = MockExtractor::new();
        extractor.expect_download().returning(|_, control, progress: ProgressSender| {
            let mut done = 0;
            loop {
                control.checkpoint()?;
                done = (done + 1).min(99);
                let _ = progress.send(TransferProgress::new(done, Some(100)));
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let identity = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), harness.callbacks())
            .expect("submit");

        let registry = harness.registry.clone();
        let watched = identity.clone();
        wait_until(move || registry.status(&watched).is_some_and(|r| r.progress > 0)).await;

        assert!(harness.registry.cancel(&identity));
        harness.registry.wait_idle().await;

        assert!(!harness.events().contains(&Event::Complete(false)));
        assert!(!harness.events().contains(&Event::Complete(true)));
        assert!(harness.registry.history().is_empty());
        assert!(!harness.severities().contains(&Severity::Error));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let gate = Arc::new(AtomicBool::new(false));
        let backend_gate = Arc::clone(&gate);

        let mut extractor = MockExtractor::new();
        extractor.expect_download().returning(move |_, control, _| {
            hold(&backend_gate, control)?;
            Ok(outcome("/downloads/Clip.mp4"))
        });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let identity = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), harness.callbacks())
            .expect("submit");

        assert!(harness.registry.pause(&identity));
        assert!(harness.registry.status(&identity).expect("live").paused);

        // Opening the gate while paused must not finish the job
        gate.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.registry.status(&identity).is_some());

        assert!(harness.registry.resume(&identity));
        harness.registry.wait_idle().await;

        assert_eq!(harness.events(), vec![Event::Complete(true)]);
        let unknown = JobIdentity::new(JobKind::Audio, LOCATOR, "192 kbps");
        assert!(!harness.registry.pause(&unknown));
        assert!(!harness.registry.resume(&unknown));
    }

    #[tokio::test]
    async fn test_auto_convert_queues_audio_extraction() {
        let media = TempDir::new().expect("tempdir");
        let video = media.path().join("Clip.mp4");
        std::fs::write(&video, b"video bytes").expect("write");

        let downloaded = video.clone();
        let mut extractor = MockExtractor::new();
        extractor.expect_download().times(1).returning(move |_, _, _| {
            Ok(TransferOutcome {
                title: Some("Clip".to_string()),
                output_path: downloaded.clone(),
            })
        });

        let expected_input = video.clone();
        let mut converter = MockConverter::new();
        converter
            .expect_extract_audio()
            .withf(move |request, _, _| request.input == expected_input)
            .times(1)
            .returning(|request, _, _| {
                Ok(TransferOutcome {
                    title: None,
                    output_path: request.output.clone(),
                })
            });

        let harness = Harness::new(
            extractor,
            converter,
            config().with_auto_convert_audio(true),
        );
        harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), JobCallbacks::new())
            .expect("submit");
        harness.registry.wait_idle().await;

        let kinds: Vec<JobKind> = harness.registry.history().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JobKind::Video, JobKind::Conversion]);
        let converted = &harness.registry.history()[1];
        assert_eq!(converted.output_path, media.path().join("audio").join("Clip.mp3"));
        assert_eq!(converted.title, "Clip");
    }

    #[tokio::test]
    async fn test_conversion_output_name_is_sanitized() {
        let media = TempDir::new().expect("tempdir");
        let input = media.path().join("Q&A: live *uncut*.mp4");
        std::fs::write(&input, b"video bytes").expect("write");
        let target = media.path().join("exports");

        let expected = target.join("Q&A live uncut.mp3");
        let mut converter = MockConverter::new();
        converter
            .expect_extract_audio()
            .withf(move |request, _, _| request.output == expected)
            .times(1)
            .returning(|request, _, _| {
                Ok(TransferOutcome {
                    title: None,
                    output_path: request.output.clone(),
                })
            });

        let harness = Harness::new(MockExtractor::new(), converter, config());
        harness
            .registry
            .submit(
                JobRequest::conversion(&input, AudioBitrate::DEFAULT).with_destination(target.clone()),
                JobCallbacks::new(),
            )
            .expect("submit");
        harness.registry.wait_idle().await;

        assert_eq!(harness.registry.history().len(), 1);
    }

    #[tokio::test]
    async fn test_audio_request_defaults() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_download()
            .withf(|request, _, _| {
                request.audio == Some(AudioBitrate::DEFAULT)
                    && request.format_selector == AUDIO_FORMAT_SELECTOR
                    && request.output_dir.ends_with(AUDIO_DOWNLOAD_SUBDIR)
            })
            .times(1)
            .returning(|_, _, _| Ok(outcome("/downloads/audio/Song.mp3")));

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let identity = harness
            .registry
            .submit(JobRequest::audio(LOCATOR, AudioBitrate::DEFAULT), JobCallbacks::new())
            .expect("submit");
        assert_eq!(identity.quality(), "192 kbps");
        harness.registry.wait_idle().await;
        assert_eq!(harness.registry.history()[0].kind, JobKind::Audio);
    }

    #[tokio::test]
    async fn test_empty_quality_uses_default() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_download()
            .withf(|request, _, _| request.format_selector == "best[height<=720]")
            .returning(|_, _, _| Ok(outcome("/downloads/Clip.mp4")));

        let harness = Harness::new(extractor, MockConverter::new(), config());
        let identity = harness
            .registry
            .submit(JobRequest::video(LOCATOR, ""), JobCallbacks::new())
            .expect("submit");
        assert_eq!(identity.quality(), "720p");
        harness.registry.wait_idle().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_refuses_new_jobs() {
        let mut extractor = MockExtractor::new();
        extractor.expect_download().returning(|_, control, _| {
            loop {
                control.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let harness = Harness::new(extractor, MockConverter::new(), config());
        harness
            .registry
            .submit(JobRequest::video(LOCATOR, "720p"), harness.callbacks())
            .expect("submit");

        harness.registry.shutdown().await;

        assert_eq!(harness.registry.active_count(), 0);
        assert!(harness.events().is_empty());
        let err = harness
            .registry
            .submit(JobRequest::video(LOCATOR, "480p"), JobCallbacks::new())
            .expect_err("registry is shut down");
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[test]
    fn test_registry_requires_runtime() {
        let result = JobRegistry::new(
            RegistryConfig::default(),
            Arc::new(MockExtractor::new()),
            Arc::new(MockConverter::new()),
            Arc::new(NotificationHub::new()),
        );
        assert!(matches!(result, Err(Error::Runtime(_))));
    }

    #[test]
    fn test_identity_trims_and_compares_structurally() {
        let a = JobIdentity::new(JobKind::Video, " https://a.b/c ", "720p ");
        let b = JobIdentity::new(JobKind::Video, "https://a.b/c", "720p");
        let c = JobIdentity::new(JobKind::Audio, "https://a.b/c", "720p");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "video [720p] https://a.b/c");
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialManager;
use crate::classify::classify;
use crate::error::UploadError;
use crate::http::PlatformApi;
use crate::jobs::{scan_pending, JobDescriptor, PendingJob};
use crate::ledger::{raw_source_for, CompletionLedger};
use crate::throttle::{rate_per_window, ThrottleController, ThrottleDecision, ThrottleSettings};
use crate::ui::Progress;
use crate::utils::{format_duration, pluralize};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub progress_every: usize,
    pub throttle: ThrottleSettings,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            progress_every: 5,
            throttle: ThrottleSettings::default(),
        }
    }
}

/// Why a run ended before every job was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The throttle gave up after too many consecutive failures.
    QuotaExhausted { failures: usize },
    /// A failure that needs a person, usually a new authorization code.
    Fatal {
        message: String,
        reauthorize_url: Option<String>,
    },
    /// Ctrl+C.
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::QuotaExhausted { failures } => write!(
                f,
                "stopped after {failures} consecutive failures, the upload quota is likely exhausted"
            ),
            StopReason::Fatal { message, .. } => write!(f, "stopped: {message}"),
            StopReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Counters and the stop flag for one invocation. Workers only touch it
/// through atomics; the stop flag only ever goes from false to true.
#[derive(Debug)]
pub struct RunState {
    total: usize,
    uploaded: AtomicUsize,
    skipped: AtomicUsize,
    started: Instant,
    stopped: AtomicBool,
    stop_signal: watch::Sender<bool>,
    stop_reason: Mutex<Option<StopReason>>,
}

impl RunState {
    pub fn new(total: usize) -> Self {
        let (stop_signal, _) = watch::channel(false);
        Self {
            total,
            uploaded: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            started: Instant::now(),
            stopped: AtomicBool::new(false),
            stop_signal,
            stop_reason: Mutex::new(None),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Set the stop flag and wake every sleeping worker. The first reason
    /// recorded is the one reported.
    pub fn stop(&self, reason: StopReason) {
        {
            let mut slot = match self.stop_reason.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.get_or_insert(reason);
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.send_replace(true);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.stop_reason.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sleep for `duration` unless the run is stopped first. Returns true
    /// when the full sleep elapsed and the run is still going.
    pub async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let mut stop = self.stop_signal.subscribe();
        if self.is_stopped() {
            return false;
        }
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return !self.is_stopped(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow_and_update() {
                        return false;
                    }
                }
            }
        }
    }

    fn record_upload(&self) -> usize {
        self.uploaded.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Result of one obtain-credential, submit, classify round.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success,
    RetryAfter(Duration),
    Abort { failures: usize },
    Fatal(UploadError),
}

/// Map a failed attempt onto what the worker does next. Authentication
/// problems end the run; everything else goes through the throttle.
pub fn resolve_failure(
    err: UploadError,
    throttle: &ThrottleController,
    elapsed: Duration,
    uploaded: usize,
) -> AttemptOutcome {
    if err.is_fatal() {
        return AttemptOutcome::Fatal(err);
    }
    match throttle.on_failure(elapsed, uploaded) {
        ThrottleDecision::Pause {
            duration,
            rate_per_window,
        } => {
            warn!(
                error = %err,
                uploaded,
                failures = throttle.consecutive_failures(),
                pause_secs = duration.as_secs(),
                rate_per_window = (rate_per_window as u64),
                "upload attempt failed, pausing until the next quota window"
            );
            AttemptOutcome::RetryAfter(duration)
        }
        ThrottleDecision::Abort { failures } => {
            error!(error = %err, failures, "too many consecutive failures");
            AttemptOutcome::Abort { failures }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Uploaded,
    Skipped,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    pub stop_reason: Option<StopReason>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.stop_reason.is_none()
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} / {} {} successfully uploaded in {}",
            self.uploaded,
            self.total,
            pluralize(self.total, "activity", Some("activities")),
            format_duration(self.elapsed.as_secs())
        );
        if self.skipped > 0 {
            line.push_str(&format!(" ({} skipped)", self.skipped));
        }
        if let Some(reason) = &self.stop_reason {
            line.push_str(&format!(", {reason}"));
        }
        line
    }
}

struct Worker {
    api: Arc<dyn PlatformApi>,
    credentials: CredentialManager,
    throttle: ThrottleController,
    ledger: CompletionLedger,
    state: Arc<RunState>,
    jobs: Vec<PendingJob>,
    next_job: AtomicUsize,
    progress: Progress,
    progress_every: usize,
}

impl Worker {
    async fn run(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.state.is_stopped() {
                debug!(worker_id, "stop flag set, not claiming more jobs");
                break;
            }
            let index = self.next_job.fetch_add(1, Ordering::SeqCst);
            let Some(job) = self.jobs.get(index) else {
                break;
            };
            let outcome = self.process(job).await;
            debug!(worker_id, job = %job.label(), ?outcome, "job finished");
        }
    }

    async fn process(&self, job: &PendingJob) -> JobOutcome {
        let descriptor = match job.load() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(job = %job.label(), error = %err, "skipping unreadable job descriptor");
                self.skip(job, &format!("unreadable descriptor: {err}"));
                return JobOutcome::Skipped;
            }
        };
        let payload = job.payload_path(&descriptor);
        if !payload.is_file() {
            warn!(job = %job.label(), payload = %payload.display(), "skipping job with missing payload");
            self.skip(job, &format!("payload {} not found", payload.display()));
            return JobOutcome::Skipped;
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            debug!(job = %job.label(), attempt, "uploading");
            match self.attempt(&descriptor, &payload).await {
                AttemptOutcome::Success => return self.complete(job, &payload),
                AttemptOutcome::RetryAfter(pause) => {
                    self.progress.println(&format!(
                        "   - Waiting {} after {} uploads to adjust the upload rate ({}/{}m)",
                        format_duration(pause.as_secs()),
                        self.state.uploaded(),
                        self.rate_per_window() as u64,
                        self.throttle.settings().window.as_secs() / 60
                    ));
                    if !self.state.sleep_unless_stopped(pause).await {
                        return JobOutcome::Stopped;
                    }
                }
                AttemptOutcome::Abort { failures } => {
                    self.state.stop(StopReason::QuotaExhausted { failures });
                    self.progress.println(&format!(
                        "   - Upload terminated at {} uploads ({}) since the upload limit is reached",
                        self.state.uploaded(),
                        job.label()
                    ));
                    return JobOutcome::Stopped;
                }
                AttemptOutcome::Fatal(err) => {
                    error!(job = %job.label(), error = %err, "fatal upload failure, stopping run");
                    self.state.stop(StopReason::Fatal {
                        message: err.to_string(),
                        reauthorize_url: needs_reauthorization(&err)
                            .then(|| self.api.authorize_url()),
                    });
                    return JobOutcome::Stopped;
                }
            }
        }
    }

    async fn attempt(&self, descriptor: &JobDescriptor, payload: &Path) -> AttemptOutcome {
        let credential = match self.credentials.obtain_or_refresh().await {
            Ok(credential) => credential,
            Err(err) => return self.failure(err),
        };
        let response = match self
            .api
            .upload(descriptor, payload, &credential.authorization_header())
            .await
        {
            Ok(response) => response,
            Err(err) => return self.failure(err),
        };
        match classify(response.status, &response.body).into_result(&self.api.authorize_url()) {
            Ok(_) => AttemptOutcome::Success,
            Err(err) => self.failure(err),
        }
    }

    fn failure(&self, err: UploadError) -> AttemptOutcome {
        resolve_failure(
            err,
            &self.throttle,
            self.state.elapsed(),
            self.state.uploaded(),
        )
    }

    fn complete(&self, job: &PendingJob, payload: &Path) -> JobOutcome {
        self.throttle.on_success();

        let raw_source = raw_source_for(payload);
        let moved = match self
            .ledger
            .archive(&job.descriptor_path, payload, raw_source.as_deref())
        {
            Ok(moved) => moved,
            Err(err) => {
                error!(job = %job.label(), error = %err, "uploaded but could not archive, stopping run");
                self.state.stop(StopReason::Fatal {
                    message: format!("{} was uploaded but not archived: {err}", job.label()),
                    reauthorize_url: None,
                });
                return JobOutcome::Stopped;
            }
        };
        info!(
            job = %job.label(),
            files = moved.len(),
            completed_dir = %self.ledger.completed_dir().display(),
            "uploaded and archived"
        );

        let uploaded = self.state.record_upload();
        self.progress.inc();
        if self.progress_every > 0 && uploaded % self.progress_every == 0 {
            let total = self.state.total().max(1);
            self.progress.println(&format!(
                "   - {}: Uploaded {} / {} ({}%) activities ({}/{}m)",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                uploaded,
                self.state.total(),
                uploaded * 100 / total,
                self.rate_per_window() as u64,
                self.throttle.settings().window.as_secs() / 60
            ));
        }
        JobOutcome::Uploaded
    }

    fn skip(&self, job: &PendingJob, reason: &str) {
        self.state.record_skip();
        self.progress.inc();
        self.progress
            .println(&format!("   - Skipping {}: {reason}", job.label()));
    }

    fn rate_per_window(&self) -> f64 {
        rate_per_window(
            self.state.uploaded(),
            self.state.elapsed(),
            self.throttle.settings().window,
        )
    }
}

fn needs_reauthorization(err: &UploadError) -> bool {
    matches!(
        err,
        UploadError::InvalidAuthorizationCode { .. }
            | UploadError::Authentication(_)
            | UploadError::MissingAuthorizationCode(_)
    )
}

/// Scans the pending directory once, then drives a bounded set of workers
/// over the resulting job list until it is exhausted or the run stops.
pub struct Pipeline {
    api: Arc<dyn PlatformApi>,
    credentials: CredentialManager,
    pending_dir: PathBuf,
    options: PipelineOptions,
    state: Arc<RunState>,
    jobs: Vec<PendingJob>,
}

impl Pipeline {
    pub fn scan(
        api: Arc<dyn PlatformApi>,
        credentials: CredentialManager,
        pending_dir: &Path,
        options: PipelineOptions,
    ) -> Result<Self> {
        let jobs = scan_pending(pending_dir)
            .with_context(|| format!("failed to scan {}", pending_dir.display()))?;
        Ok(Self {
            api,
            credentials,
            pending_dir: pending_dir.to_path_buf(),
            options,
            state: Arc::new(RunState::new(jobs.len())),
            jobs,
        })
    }

    pub fn jobs(&self) -> &[PendingJob] {
        &self.jobs
    }

    /// Shared handle to the run state, for wiring external stop signals.
    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    pub async fn run(self, progress: Progress) -> Result<RunSummary> {
        let state = Arc::clone(&self.state);
        info!(
            pending_dir = %self.pending_dir.display(),
            jobs = self.jobs.len(),
            "starting upload run"
        );
        if self.jobs.is_empty() {
            return Ok(summarize(&state));
        }

        // Fail fast on authorization problems before fanning out. Transient
        // errors are left for the workers' retry loop.
        if let Err(err) = self.credentials.obtain_or_refresh().await {
            if err.is_fatal() {
                error!(error = %err, "could not obtain an access token");
                state.stop(StopReason::Fatal {
                    message: err.to_string(),
                    reauthorize_url: needs_reauthorization(&err).then(|| self.api.authorize_url()),
                });
                return Ok(summarize(&state));
            }
            warn!(error = %err, "could not obtain an access token yet, workers will retry");
        }

        let worker_count = self.options.workers.max(1).min(self.jobs.len());
        let worker = Arc::new(Worker {
            api: self.api,
            credentials: self.credentials,
            throttle: ThrottleController::new(self.options.throttle),
            ledger: CompletionLedger::for_pending_dir(&self.pending_dir),
            state: Arc::clone(&state),
            jobs: self.jobs,
            next_job: AtomicUsize::new(0),
            progress,
            progress_every: self.options.progress_every,
        });

        let mut join_set = tokio::task::JoinSet::new();
        for worker_id in 0..worker_count {
            join_set.spawn(Arc::clone(&worker).run(worker_id));
        }
        while let Some(joined) = join_set.join_next().await {
            joined.context("upload worker join failed")?;
        }
        worker.progress.finish();

        Ok(summarize(&state))
    }
}

fn summarize(state: &RunState) -> RunSummary {
    RunSummary {
        total: state.total(),
        uploaded: state.uploaded(),
        skipped: state.skipped(),
        elapsed: state.elapsed(),
        stop_reason: state.stop_reason(),
    }
}

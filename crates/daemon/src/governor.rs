//! Job execution and resource governor.
//!
//! Admits or rejects uploads against the concurrency ceiling and resource
//! thresholds, runs each admitted transcode under supervision, and guarantees
//! that the job's table entry and input file are gone by the time `submit`
//! returns, whatever the outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityProbe;
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::inspect::MediaInspector;
use crate::process::{signal_group, spawn_in_group, ProcessOutcome};
use crate::resources::{ResourceProbe, ResourceSample, SystemResources};
use crate::scheduler::{remove_quietly, DeletionScheduler};
use crate::transform::{PolicyTier, Strategy, TranscodeCommand, TransformGenerator};
use nix::sys::signal::Signal;

/// Longest diagnostic string returned to callers.
pub const MAX_DIAGNOSTIC_CHARS: usize = 300;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Why a transcode run did not produce a usable output.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("transcoder exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("transcoder was terminated by a signal: {stderr}")]
    Signaled { stderr: String },

    #[error("no output produced")]
    NoOutput,

    #[error("failed to launch transcoder: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ExecutionFailure {
    /// Only a plain non-zero exit is worth retrying with the fallback command.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExecutionFailure::NonZeroExit { .. })
    }
}

/// Error type for job submission
#[derive(Debug, Error)]
pub enum JobError {
    /// Upload rejected before any resource was consumed
    #[error("invalid upload: {0}")]
    Validation(String),

    /// Admission control tripped; retry later
    #[error("server busy: {0}")]
    Overload(String),

    /// Transcode exceeded its time budget and was killed
    #[error("processing timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    /// Filesystem or supervision IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Overload,
    Timeout,
    ExecutionFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Overload => "overload",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionFailure => "execution_failure",
        }
    }
}

fn head_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Validation(_) => ErrorKind::Validation,
            JobError::Overload(_) => ErrorKind::Overload,
            JobError::Timeout(_) => ErrorKind::Timeout,
            JobError::Execution(_) | JobError::Io(_) => ErrorKind::ExecutionFailure,
        }
    }

    /// Short, caller-safe description. Transcoder output is cut to its last
    /// lines, where the actual error usually is.
    pub fn diagnostic(&self) -> String {
        let text = match self {
            JobError::Execution(ExecutionFailure::NonZeroExit { code, stderr }) => {
                format!("transcoder exited with code {}: {}", code, tail_chars(stderr.trim(), 240))
            }
            JobError::Execution(ExecutionFailure::Signaled { .. }) => {
                "transcoder was terminated by a signal".to_string()
            }
            JobError::Io(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        head_chars(&text, MAX_DIAGNOSTIC_CHARS)
    }
}

/// Lifecycle stage of an active job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Admitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut
        )
    }
}

/// One entry of the active-job table
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: Uuid,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub started_at: Instant,
    pub state: JobState,
    /// Process group of the transcoder currently running for this job
    pub pgid: Option<i32>,
}

impl ActiveJob {
    pub fn new(id: Uuid, input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            id,
            input_path,
            output_path,
            started_at: Instant::now(),
            state: JobState::Admitted,
            pgid: None,
        }
    }
}

/// Jobs currently owned by a governor. Its size is the concurrency counter.
#[derive(Debug, Default)]
pub struct ActiveJobTable {
    jobs: Mutex<HashMap<Uuid, ActiveJob>>,
}

impl ActiveJobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `job` unless the table already holds `ceiling` entries.
    /// The count check and the insert happen under one lock.
    pub fn try_admit(&self, ceiling: usize, job: ActiveJob) -> bool {
        let mut jobs = self.lock();
        if jobs.len() >= ceiling {
            return false;
        }
        jobs.insert(job.id, job);
        true
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut ActiveJob)) {
        if let Some(job) = self.lock().get_mut(&id) {
            f(job);
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<ActiveJob> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `path` is the input or output of an active job.
    pub fn owns_path(&self, path: &Path) -> bool {
        self.lock()
            .values()
            .any(|j| j.input_path == path || j.output_path == path)
    }

    /// Process groups of every running transcoder.
    pub fn pgids(&self) -> Vec<i32> {
        self.lock().values().filter_map(|j| j.pgid).collect()
    }

    /// Copy of every entry, for reporting.
    pub fn snapshot(&self) -> Vec<ActiveJob> {
        self.lock().values().cloned().collect()
    }
}

/// Removes the job's table entry and input file on every exit path,
/// including cancellation of the submitting future.
struct JobGuard {
    table: Arc<ActiveJobTable>,
    id: Uuid,
    input_path: PathBuf,
    output_path: PathBuf,
    keep_output: bool,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Some(job) = self.table.remove(self.id) {
            if !job.state.is_terminal() {
                if let Some(pgid) = job.pgid {
                    signal_group(pgid, Signal::SIGKILL);
                }
            }
        }
        remove_quietly(&self.input_path);
        if !self.keep_output {
            remove_quietly(&self.output_path);
        }
    }
}

/// Governor settings, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub work_dir: PathBuf,
    pub max_upload_bytes: u64,
    /// Lowercase with a leading dot.
    pub allowed_extensions: Vec<String>,
    pub max_concurrent_jobs: usize,
    pub max_memory_bytes: u64,
    pub min_disk_free_bytes: u64,
    pub standard_timeout: Duration,
    pub conservative_timeout: Duration,
    pub kill_grace: Duration,
    pub output_grace: Duration,
    pub fallback_on_failure: bool,
}

impl GovernorConfig {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            work_dir: cfg.storage.work_dir.clone(),
            max_upload_bytes: cfg.storage.max_upload_bytes,
            allowed_extensions: cfg.storage.allowed_extensions.clone(),
            max_concurrent_jobs: plan.max_concurrent_jobs.max(1) as usize,
            max_memory_bytes: cfg.limits.max_memory_bytes,
            min_disk_free_bytes: cfg.limits.min_disk_free_bytes,
            standard_timeout: Duration::from_secs(cfg.timeouts.standard_secs),
            conservative_timeout: Duration::from_secs(cfg.timeouts.conservative_secs),
            kill_grace: Duration::from_millis(cfg.timeouts.kill_grace_ms),
            output_grace: Duration::from_secs(cfg.storage.output_grace_secs),
            fallback_on_failure: cfg.engine.fallback_on_failure,
        }
    }

    /// Wall-clock budget for a primary transcode of the given tier.
    pub fn timeout_for(&self, tier: PolicyTier) -> Duration {
        match tier {
            PolicyTier::Standard => self.standard_timeout,
            PolicyTier::Conservative => self.conservative_timeout,
        }
    }
}

/// A successfully produced output.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub processing_time_secs: f64,
    pub pitch_preserved: bool,
    pub tier: PolicyTier,
    pub strategy: Strategy,
}

/// Governor statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub memory_used_bytes: u64,
    pub disk_free_bytes: Option<u64>,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_rejected: u64,
    pub pending_deletions: usize,
}

/// Health derived from the admission thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Busy,
    Warning,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

/// Owns the active-job table and everything needed to run a job.
pub struct Governor {
    config: GovernorConfig,
    table: Arc<ActiveJobTable>,
    inspector: MediaInspector,
    capability: Arc<CapabilityProbe>,
    generator: TransformGenerator,
    resources: Arc<dyn ResourceProbe>,
    scheduler: DeletionScheduler,
    counters: Counters,
    shutting_down: AtomicBool,
}

impl Governor {
    pub fn new(
        config: GovernorConfig,
        inspector: MediaInspector,
        capability: Arc<CapabilityProbe>,
        generator: TransformGenerator,
        resources: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            config,
            table: Arc::new(ActiveJobTable::new()),
            inspector,
            capability,
            generator,
            resources,
            scheduler: DeletionScheduler::new(),
            counters: Counters::default(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Wire a governor with the real ffmpeg/ffprobe collaborators.
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        let timeouts = &cfg.timeouts;
        Self::new(
            GovernorConfig::from_config(cfg, plan),
            MediaInspector::new(
                &cfg.engine.ffprobe_path,
                Duration::from_secs(timeouts.probe_secs),
            ),
            Arc::new(CapabilityProbe::new(
                &cfg.engine.ffmpeg_path,
                Duration::from_secs(timeouts.capability_secs),
            )),
            TransformGenerator::new(&cfg.engine.ffmpeg_path),
            Arc::new(SystemResources),
        )
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Shared handle to the active-job table, for the retention sweeper.
    pub fn table(&self) -> Arc<ActiveJobTable> {
        Arc::clone(&self.table)
    }

    pub fn capability(&self) -> &CapabilityProbe {
        &self.capability
    }

    pub fn active_jobs(&self) -> usize {
        self.table.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Path of a produced output by file name, if the name is one this
    /// governor could have generated.
    pub fn resolve_output(&self, name: &str) -> Option<PathBuf> {
        is_output_file_name(name).then(|| self.config.work_dir.join(name))
    }

    /// Run one upload through validation, admission and transcoding.
    ///
    /// # Requirements
    ///
    /// - Validation and admission happen before any file is written.
    /// - Admission is decided by inserting into the active-job table under
    ///   its lock, so the ceiling is never exceeded.
    /// - When this returns the job's table entry and input file are gone.
    ///   A failed job's output is gone too; a successful one is scheduled for
    ///   deletion after the output grace period.
    /// - No automatic retry except one explicit fallback run after a
    ///   recoverable primary failure, when enabled.
    pub async fn submit(&self, bytes: &[u8], declared_ext: &str) -> Result<JobOutcome, JobError> {
        let ext = self.validate(bytes, declared_ext)?;
        self.check_admission().await?;

        let id = Uuid::new_v4();
        let input_path = self.config.work_dir.join(format!("in_{}.{}", id, ext));
        let output_path = self.config.work_dir.join(output_file_name(id));

        let job = ActiveJob::new(id, input_path.clone(), output_path.clone());
        if !self.table.try_admit(self.config.max_concurrent_jobs, job) {
            return Err(self.reject(format!(
                "{} jobs already running",
                self.config.max_concurrent_jobs
            )));
        }

        let mut guard = JobGuard {
            table: Arc::clone(&self.table),
            id,
            input_path: input_path.clone(),
            output_path: output_path.clone(),
            keep_output: false,
        };

        info!(job_id = %id, bytes = bytes.len(), ext = %ext, "job admitted");
        let started = Instant::now();
        let result = self.run_admitted(id, bytes, &input_path, &output_path).await;
        let elapsed = started.elapsed();

        match result {
            Ok((command, size_bytes)) => {
                self.table.update(id, |j| j.state = JobState::Succeeded);
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                guard.keep_output = true;
                self.scheduler
                    .schedule(output_path.clone(), self.config.output_grace);

                let processing_time_secs = (elapsed.as_secs_f64() * 100.0).round() / 100.0;
                info!(
                    job_id = %id,
                    tier = %command.tier,
                    strategy = ?command.strategy,
                    size_bytes,
                    processing_time_secs,
                    pitch_preserved = command.pitch_preserved,
                    "job succeeded"
                );

                Ok(JobOutcome {
                    job_id: id,
                    output_path,
                    size_bytes,
                    processing_time_secs,
                    pitch_preserved: command.pitch_preserved,
                    tier: command.tier,
                    strategy: command.strategy,
                })
            }
            Err(e) => {
                if matches!(e, JobError::Timeout(_)) {
                    self.table.update(id, |j| j.state = JobState::TimedOut);
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.table.update(id, |j| j.state = JobState::Failed);
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                error!(job_id = %id, kind = e.kind().as_str(), error = %e, elapsed_secs = elapsed.as_secs_f64(), "job failed");
                Err(e)
            }
        }
    }

    fn validate(&self, bytes: &[u8], declared_ext: &str) -> Result<String, JobError> {
        let ext = declared_ext.trim().trim_start_matches('.').to_ascii_lowercase();
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(JobError::Validation("missing or malformed file extension".into()));
        }
        let dotted = format!(".{}", ext);
        if !self.config.allowed_extensions.iter().any(|e| *e == dotted) {
            return Err(JobError::Validation(format!(
                "file type {} not allowed; allowed: {}",
                dotted,
                self.config.allowed_extensions.join(", ")
            )));
        }
        if bytes.is_empty() {
            return Err(JobError::Validation("empty file".into()));
        }
        if bytes.len() as u64 > self.config.max_upload_bytes {
            return Err(JobError::Validation(format!(
                "file exceeds maximum upload size of {} bytes",
                self.config.max_upload_bytes
            )));
        }
        Ok(ext)
    }

    fn reject(&self, reason: String) -> JobError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(reason = %reason, "job rejected");
        JobError::Overload(reason)
    }

    async fn sample_resources(&self) -> ResourceSample {
        let probe = Arc::clone(&self.resources);
        let dir = self.config.work_dir.clone();
        tokio::task::spawn_blocking(move || probe.sample(&dir))
            .await
            .unwrap_or_default()
    }

    /// Cheap pre-checks. The table insert remains the authoritative one.
    async fn check_admission(&self) -> Result<(), JobError> {
        if self.is_shutting_down() {
            return Err(self.reject("service is shutting down".into()));
        }
        if self.table.len() >= self.config.max_concurrent_jobs {
            return Err(self.reject(format!(
                "{} jobs already running",
                self.config.max_concurrent_jobs
            )));
        }

        let sample = self.sample_resources().await;
        if sample.memory_used_bytes > self.config.max_memory_bytes {
            return Err(self.reject(format!(
                "memory usage {} bytes exceeds limit",
                sample.memory_used_bytes
            )));
        }
        if let Some(free) = sample.disk_free_bytes {
            if free < self.config.min_disk_free_bytes {
                return Err(self.reject(format!("only {} bytes of disk free", free)));
            }
        }
        Ok(())
    }

    async fn run_admitted(
        &self,
        id: Uuid,
        bytes: &[u8],
        input: &Path,
        output: &Path,
    ) -> Result<(TranscodeCommand, u64), JobError> {
        write_input(input, bytes).await?;

        let profile = self.inspector.probe(input).await;
        let time_stretch = self.capability.has_time_stretch_filter().await;
        let primary = self.generator.build(input, output, &profile, time_stretch);
        let timeout = self.config.timeout_for(primary.tier);

        match self.execute(id, &primary, output, timeout).await {
            Ok(size) => Ok((primary, size)),
            Err(JobError::Execution(failure))
                if failure.is_recoverable() && self.config.fallback_on_failure =>
            {
                warn!(job_id = %id, error = %failure, "primary transcode failed; trying fallback");
                remove_quietly(output);
                let fallback = self.generator.build_fallback(input, output, profile.has_audio);
                let size = self
                    .execute(id, &fallback, output, self.config.conservative_timeout)
                    .await?;
                Ok((fallback, size))
            }
            Err(e) => Err(e),
        }
    }

    /// Run one command to completion and verify its output.
    async fn execute(
        &self,
        id: Uuid,
        command: &TranscodeCommand,
        output: &Path,
        timeout: Duration,
    ) -> Result<u64, JobError> {
        if self.is_shutting_down() {
            return Err(JobError::Overload("service is shutting down".into()));
        }

        let process = spawn_in_group(&command.argv).map_err(ExecutionFailure::Spawn)?;
        let pgid = process.pgid();
        self.table.update(id, |j| {
            j.state = JobState::Running;
            j.pgid = Some(pgid);
        });

        let outcome = process
            .wait_with_timeout(timeout, self.config.kill_grace)
            .await;
        self.table.update(id, |j| j.pgid = None);

        match outcome? {
            ProcessOutcome::TimedOut { .. } => Err(JobError::Timeout(timeout)),
            ProcessOutcome::Exited {
                status,
                stderr_tail,
            } if !status.success() => Err(match status.code() {
                Some(code) => ExecutionFailure::NonZeroExit {
                    code,
                    stderr: stderr_tail,
                },
                None => ExecutionFailure::Signaled {
                    stderr: stderr_tail,
                },
            }
            .into()),
            ProcessOutcome::Exited { .. } => match tokio::fs::metadata(output).await {
                Ok(meta) if meta.len() > 0 => Ok(meta.len()),
                _ => Err(ExecutionFailure::NoOutput.into()),
            },
        }
    }

    /// Current statistics. Samples resources off the async runtime.
    pub async fn stats(&self) -> Stats {
        let sample = self.sample_resources().await;
        Stats {
            active_jobs: self.table.len(),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            memory_used_bytes: sample.memory_used_bytes,
            disk_free_bytes: sample.disk_free_bytes,
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            jobs_rejected: self.counters.rejected.load(Ordering::Relaxed),
            pending_deletions: self.scheduler.pending(),
        }
    }

    /// Same thresholds as admission control.
    pub fn health(&self, stats: &Stats) -> HealthStatus {
        if stats.active_jobs >= self.config.max_concurrent_jobs {
            HealthStatus::Busy
        } else if stats.memory_used_bytes > self.config.max_memory_bytes
            || stats
                .disk_free_bytes
                .is_some_and(|free| free < self.config.min_disk_free_bytes)
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    /// Stop admitting, tear down every running process tree and flush
    /// scheduled deletions.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let jobs = self.table.snapshot();
        info!(jobs = jobs.len(), "governor shutting down");
        for job in &jobs {
            info!(
                job_id = %job.id,
                state = job.state.as_str(),
                running_secs = job.started_at.elapsed().as_secs_f64(),
                "terminating job"
            );
            if let Some(pgid) = job.pgid {
                signal_group(pgid, Signal::SIGTERM);
            }
        }

        self.wait_for_drain(self.config.kill_grace).await;
        for pgid in self.table.pgids() {
            signal_group(pgid, Signal::SIGKILL);
        }
        self.wait_for_drain(self.config.kill_grace).await;

        if !self.table.is_empty() {
            warn!(jobs = self.table.len(), "jobs still unwinding after shutdown");
        }
        self.scheduler.shutdown().await;
    }

    async fn wait_for_drain(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        while !self.table.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }
}

async fn write_input(path: &Path, bytes: &[u8]) -> Result<(), JobError> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    let written = tokio::fs::metadata(path).await?.len();
    if written != bytes.len() as u64 {
        return Err(JobError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("wrote {} of {} bytes", written, bytes.len()),
        )));
    }
    Ok(())
}

/// File name of a job's output.
pub fn output_file_name(id: Uuid) -> String {
    format!("out_{}.mp4", id)
}

/// Whether `name` is exactly `out_<lowercase hyphenated uuid>.mp4`.
pub fn is_output_file_name(name: &str) -> bool {
    name.strip_prefix("out_")
        .and_then(|rest| rest.strip_suffix(".mp4"))
        .and_then(|inner| Uuid::parse_str(inner).ok().map(|id| (inner, id)))
        .is_some_and(|(inner, id)| id.hyphenated().to_string() == inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::FixedResources;
    use crate::test_support::{failing_ffmpeg, fake_ffmpeg, fake_ffprobe, write_script};
    use tempfile::TempDir;

    pub(crate) fn test_config(work_dir: &Path, ceiling: usize) -> GovernorConfig {
        GovernorConfig {
            work_dir: work_dir.to_path_buf(),
            max_upload_bytes: 1024,
            allowed_extensions: vec![".mp4".into(), ".mov".into()],
            max_concurrent_jobs: ceiling,
            max_memory_bytes: 1 << 30,
            min_disk_free_bytes: 1 << 20,
            standard_timeout: Duration::from_secs(10),
            conservative_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(300),
            output_grace: Duration::from_secs(600),
            fallback_on_failure: false,
        }
    }

    pub(crate) fn healthy() -> ResourceSample {
        ResourceSample {
            memory_used_bytes: 1 << 20,
            disk_free_bytes: Some(1 << 40),
        }
    }

    pub(crate) fn governor_with(
        config: GovernorConfig,
        ffmpeg: &Path,
        resources: ResourceSample,
    ) -> Governor {
        governor_probing(config, ffmpeg, Path::new("/nonexistent/ffprobe"), resources)
    }

    fn governor_probing(
        config: GovernorConfig,
        ffmpeg: &Path,
        ffprobe: &Path,
        resources: ResourceSample,
    ) -> Governor {
        Governor::new(
            config,
            MediaInspector::new(ffprobe, Duration::from_secs(5)),
            Arc::new(CapabilityProbe::with_known(true)),
            TransformGenerator::new(ffmpeg),
            Arc::new(FixedResources(resources)),
        )
    }

    struct Fixture {
        _tmp: TempDir,
        work: PathBuf,
        bin: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let work = tmp.path().join("work");
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        Fixture {
            _tmp: tmp,
            work,
            bin,
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_success_cleans_input_and_schedules_output() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "0");
        let gov = governor_with(test_config(&fx.work, 2), &ffmpeg, healthy());

        let outcome = gov.submit(b"video-bytes", ".MP4").await.unwrap();

        assert!(outcome.size_bytes > 0);
        assert!(outcome.output_path.exists());
        assert!(outcome.pitch_preserved);
        assert_eq!(outcome.tier, PolicyTier::Standard);
        assert_eq!(outcome.strategy, Strategy::Primary);
        assert_eq!(gov.active_jobs(), 0);
        assert_eq!(files_in(&fx.work), vec![output_file_name(outcome.job_id)]);

        let stats = gov.stats().await;
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.pending_deletions, 1);

        gov.shutdown().await;
        assert!(!outcome.output_path.exists());
    }

    #[tokio::test]
    async fn test_validation_has_no_side_effects() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "0");
        let gov = governor_with(test_config(&fx.work, 2), &ffmpeg, healthy());

        for (bytes, ext) in [
            (&b"data"[..], "exe"),
            (&b"data"[..], ""),
            (&b"data"[..], "../mp4"),
            (&b""[..], "mp4"),
            (&[0u8; 2048][..], "mp4"),
        ] {
            let err = gov.submit(bytes, ext).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{:?} {:?}", ext, err);
        }
        assert!(files_in(&fx.work).is_empty());
        assert_eq!(gov.stats().await.jobs_rejected, 0);
    }

    #[tokio::test]
    async fn test_ceiling_is_never_exceeded() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "1");
        let gov = Arc::new(governor_with(test_config(&fx.work, 2), &ffmpeg, healthy()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gov = Arc::clone(&gov);
            handles.push(tokio::spawn(async move { gov.submit(b"clip", "mp4").await }));
        }

        let mut ok = 0;
        let mut overload = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) if e.kind() == ErrorKind::Overload => overload += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        assert_eq!(ok, 2);
        assert_eq!(overload, 4);
        assert_eq!(gov.active_jobs(), 0);
        assert_eq!(gov.stats().await.jobs_rejected, 4);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_cleans_up() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "30");
        let mut config = test_config(&fx.work, 1);
        config.standard_timeout = Duration::from_millis(300);
        let gov = governor_with(config, &ffmpeg, healthy());

        let start = Instant::now();
        let err = gov.submit(b"clip", "mp4").await.unwrap_err();

        assert!(matches!(err, JobError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(gov.active_jobs(), 0);
        assert!(files_in(&fx.work).is_empty());
        assert_eq!(gov.stats().await.jobs_timed_out, 1);
    }

    #[tokio::test]
    async fn test_720p_clip_runs_standard_tier() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "0");
        let ffprobe = fake_ffprobe(&fx.bin, 1280, 720, 10.0);
        let gov = governor_probing(test_config(&fx.work, 2), &ffmpeg, &ffprobe, healthy());

        let outcome = gov.submit(b"ten-second-clip", "mp4").await.unwrap();

        assert_eq!(outcome.tier, PolicyTier::Standard);
        assert_eq!(outcome.strategy, Strategy::Primary);
        assert!(outcome.pitch_preserved);
        assert!(outcome.size_bytes > 0);
        assert_eq!(std::fs::metadata(&outcome.output_path).unwrap().len(), outcome.size_bytes);
        assert_eq!(gov.active_jobs(), 0);
        assert_eq!(files_in(&fx.work), vec![output_file_name(outcome.job_id)]);
        gov.shutdown().await;
    }

    #[tokio::test]
    async fn test_4k_clip_runs_conservative_tier() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "0");
        let ffprobe = fake_ffprobe(&fx.bin, 3840, 2160, 60.0);
        let gov = governor_probing(test_config(&fx.work, 2), &ffmpeg, &ffprobe, healthy());

        let outcome = gov.submit(b"uhd-clip", "mp4").await.unwrap();

        assert_eq!(outcome.tier, PolicyTier::Conservative);
        assert!(!outcome.pitch_preserved);
        gov.shutdown().await;
    }

    #[tokio::test]
    async fn test_conservative_tier_uses_its_own_timeout() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "30");
        let ffprobe = fake_ffprobe(&fx.bin, 3840, 2160, 60.0);
        let mut config = test_config(&fx.work, 1);
        config.standard_timeout = Duration::from_secs(60);
        config.conservative_timeout = Duration::from_millis(300);
        let gov = governor_probing(config, &ffmpeg, &ffprobe, healthy());

        let start = Instant::now();
        let err = gov.submit(b"uhd-clip", "mp4").await.unwrap_err();

        assert!(
            matches!(err, JobError::Timeout(t) if t == Duration::from_millis(300)),
            "{:?}",
            err
        );
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(gov.active_jobs(), 0);
        assert!(files_in(&fx.work).is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaces_stderr_excerpt() {
        let fx = fixture();
        let ffmpeg = failing_ffmpeg(&fx.bin);
        let gov = governor_with(test_config(&fx.work, 1), &ffmpeg, healthy());

        let err = gov.submit(b"clip", "mov").await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Execution(ExecutionFailure::NonZeroExit { code: 1, .. })
        ));
        assert!(err.diagnostic().contains("Error initializing complex filters"));
        assert!(files_in(&fx.work).is_empty());
        assert_eq!(gov.stats().await.jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_fails() {
        let fx = fixture();
        let ffmpeg = write_script(&fx.bin, "noop.sh", "exit 0\n");
        let mut config = test_config(&fx.work, 1);
        config.fallback_on_failure = true;
        let gov = governor_with(config, &ffmpeg, healthy());

        let err = gov.submit(b"clip", "mp4").await.unwrap_err();
        assert!(matches!(err, JobError::Execution(ExecutionFailure::NoOutput)));
        assert!(files_in(&fx.work).is_empty());
    }

    #[tokio::test]
    async fn test_fallback_after_recoverable_failure() {
        let fx = fixture();
        let body = r#"for arg; do
  case "$arg" in *unsharp*) echo 'Error reinitializing filters!' >&2; exit 1;; esac
done
for last; do :; done
printf 'fallback-payload' > "$last"
"#;
        let ffmpeg = write_script(&fx.bin, "picky.sh", body);
        let mut config = test_config(&fx.work, 1);
        config.fallback_on_failure = true;
        let gov = governor_with(config, &ffmpeg, healthy());

        let outcome = gov.submit(b"clip", "mp4").await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Fallback);
        assert!(!outcome.pitch_preserved);
        assert_eq!(std::fs::read(&outcome.output_path).unwrap(), b"fallback-payload");
        assert_eq!(files_in(&fx.work).len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_disabled_reports_primary_failure() {
        let fx = fixture();
        let ffmpeg = failing_ffmpeg(&fx.bin);
        let gov = governor_with(test_config(&fx.work, 1), &ffmpeg, healthy());

        let err = gov.submit(b"clip", "mp4").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    }

    #[tokio::test]
    async fn test_missing_transcoder_is_execution_failure() {
        let fx = fixture();
        let gov = governor_with(
            test_config(&fx.work, 1),
            Path::new("/nonexistent/ffmpeg"),
            healthy(),
        );

        let err = gov.submit(b"clip", "mp4").await.unwrap_err();
        assert!(matches!(err, JobError::Execution(ExecutionFailure::Spawn(_))));
        assert!(files_in(&fx.work).is_empty());
    }

    #[tokio::test]
    async fn test_memory_pressure_rejects_before_io() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "0");
        let readings = ResourceSample {
            memory_used_bytes: 4 << 30,
            disk_free_bytes: Some(1 << 40),
        };
        let gov = governor_with(test_config(&fx.work, 2), &ffmpeg, readings);

        let err = gov.submit(b"clip", "mp4").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overload);
        assert!(files_in(&fx.work).is_empty());

        let stats = gov.stats().await;
        assert_eq!(gov.health(&stats), HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_low_disk_rejects() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "0");
        let readings = ResourceSample {
            memory_used_bytes: 1,
            disk_free_bytes: Some(1024),
        };
        let gov = governor_with(test_config(&fx.work, 2), &ffmpeg, readings);

        let err = gov.submit(b"clip", "mp4").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overload);
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_job() {
        let fx = fixture();
        let ffmpeg = fake_ffmpeg(&fx.bin, "30");
        let mut config = test_config(&fx.work, 1);
        config.standard_timeout = Duration::from_secs(60);
        let gov = Arc::new(governor_with(config, &ffmpeg, healthy()));

        let running = {
            let gov = Arc::clone(&gov);
            tokio::spawn(async move { gov.submit(b"clip", "mp4").await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while gov.table().pgids().is_empty() {
            assert!(Instant::now() < deadline, "job never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let busy = gov.stats().await;
        assert_eq!(gov.health(&busy), HealthStatus::Busy);

        let start = Instant::now();
        gov.shutdown().await;
        let result = running.await.unwrap();

        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(gov.active_jobs(), 0);
        assert!(files_in(&fx.work).is_empty());

        let err = gov.submit(b"clip", "mp4").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overload);
    }

    #[test]
    fn test_table_admission_respects_ceiling() {
        let table = ActiveJobTable::new();
        let job = || ActiveJob::new(Uuid::new_v4(), "/w/in".into(), "/w/out".into());

        assert!(table.try_admit(2, job()));
        assert!(table.try_admit(2, job()));
        assert!(!table.try_admit(2, job()));
        assert_eq!(table.len(), 2);
        assert!(table.owns_path(Path::new("/w/in")));
        assert!(!table.owns_path(Path::new("/w/other")));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|j| j.state == JobState::Admitted));
        assert!(snapshot.iter().all(|j| j.started_at.elapsed() < Duration::from_secs(60)));
    }

    #[test]
    fn test_output_name_pattern() {
        let id = Uuid::new_v4();
        assert!(is_output_file_name(&output_file_name(id)));
        assert!(!is_output_file_name("out_../../etc/passwd.mp4"));
        assert!(!is_output_file_name(&format!("in_{}.mp4", id)));
        assert!(!is_output_file_name(&format!("out_{}.mov", id)));
        assert!(!is_output_file_name(&format!(
            "out_{}.mp4",
            id.simple()
        )));
        assert!(!is_output_file_name(&format!(
            "out_{}.mp4",
            id.hyphenated().to_string().to_uppercase()
        )));
    }

    #[test]
    fn test_diagnostic_is_truncated() {
        let err = JobError::Execution(ExecutionFailure::NonZeroExit {
            code: 1,
            stderr: format!("{}final error line", "x".repeat(5000)),
        });
        let diag = err.diagnostic();
        assert!(diag.chars().count() <= MAX_DIAGNOSTIC_CHARS + 3);
        assert!(diag.ends_with("final error line"));

        let long = JobError::Validation("é".repeat(1000));
        assert!(long.diagnostic().chars().count() <= MAX_DIAGNOSTIC_CHARS + 3);
    }

    #[test]
    fn test_only_nonzero_exit_is_recoverable() {
        assert!(ExecutionFailure::NonZeroExit {
            code: 1,
            stderr: String::new()
        }
        .is_recoverable());
        assert!(!ExecutionFailure::NoOutput.is_recoverable());
        assert!(!ExecutionFailure::Signaled {
            stderr: String::new()
        }
        .is_recoverable());
    }
}

//! Retention sweeper.
//!
//! Periodically deletes files in the work directory whose modification time
//! is older than the retention window. This is the backstop for anything the
//! per-job cleanup missed. Files still registered to an active job are left
//! alone even when they are older than the window.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::governor::ActiveJobTable;

/// Result of one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub skipped_active: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    dir: PathBuf,
    retention: Duration,
    interval: Duration,
    initial_delay: Duration,
    table: Arc<ActiveJobTable>,
}

impl RetentionSweeper {
    pub fn new(
        dir: PathBuf,
        retention: Duration,
        interval: Duration,
        initial_delay: Duration,
        table: Arc<ActiveJobTable>,
    ) -> Self {
        Self {
            dir,
            retention,
            interval,
            initial_delay,
            table,
        }
    }

    /// Sweep after the initial delay and then every interval until `cancel`.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            dir = %self.dir.display(),
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("retention sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep_once(SystemTime::now());
                    if report.deleted > 0 || report.errors > 0 {
                        info!(
                            deleted = report.deleted,
                            skipped_active = report.skipped_active,
                            errors = report.errors,
                            "retention sweep finished"
                        );
                    } else {
                        debug!("retention sweep: nothing to delete");
                    }
                }
            }
        }
    }

    /// One pass over the directory. Never panics; per-file failures are
    /// logged and counted.
    pub fn sweep_once(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "sweeper could not read directory entry");
                    report.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    warn!(path = %entry.path().display(), error = %e, "no modification time");
                    report.errors += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "could not stat file");
                    report.errors += 1;
                    continue;
                }
            };

            // Future mtimes count as age zero.
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.retention {
                continue;
            }

            if self.table.owns_path(entry.path()) {
                debug!(path = %entry.path().display(), "skipping file owned by active job");
                report.skipped_active += 1;
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), age_secs = age.as_secs(), "deleted stale file");
                    report.deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to delete stale file");
                    report.errors += 1;
                }
            }
        }

        report
    }
}

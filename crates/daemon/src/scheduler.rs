//! Delayed deletion of produced outputs.
//!
//! Every successful job hands its output here. The file is removed after the
//! grace period, or immediately when the scheduler is shut down, so storage is
//! reclaimed even if the download is never requested.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scheduled path -> (generation, timer task).
type TaskMap = HashMap<PathBuf, (u64, JoinHandle<()>)>;

/// Owns one timer task per scheduled file.
#[derive(Debug, Default)]
pub struct DeletionScheduler {
    tasks: Arc<Mutex<TaskMap>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

fn lock(tasks: &Mutex<TaskMap>) -> MutexGuard<'_, TaskMap> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop the entry for `path` only if it still belongs to `generation`.
/// A replaced task finishing late must not remove its successor.
fn deregister(tasks: &Mutex<TaskMap>, path: &Path, generation: u64) {
    let mut map = lock(tasks);
    if map.get(path).is_some_and(|(g, _)| *g == generation) {
        map.remove(path);
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

impl DeletionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete `path` after `delay`. Rescheduling a path replaces its timer.
    pub fn schedule(&self, path: PathBuf, delay: Duration) {
        let cancel = self.cancel.clone();
        let tasks = Arc::clone(&self.tasks);
        let target = path.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Held across spawn so the task cannot deregister before it is registered.
        let mut map = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            remove_quietly(&target);
            deregister(&tasks, &target, generation);
        });
        if let Some((_, previous)) = map.insert(path, (generation, handle)) {
            previous.abort();
        }
    }

    /// Number of deletions still waiting on their timer.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Fire every pending deletion now and wait for all of them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> =
            lock(&self.tasks).drain().map(|(_, (_, h))| h).collect();
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        debug!(count, "flushed scheduled deletions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_removed_after_delay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out_a.mp4");
        std::fs::write(&path, b"x").unwrap();

        let scheduler = DeletionScheduler::new();
        scheduler.schedule(path.clone(), Duration::from_millis(50));
        assert_eq!(scheduler.pending(), 1);
        assert!(path.exists());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!path.exists());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_deletes_immediately() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("out_a.mp4");
        let b = dir.path().join("out_b.mp4");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"y").unwrap();

        let scheduler = DeletionScheduler::new();
        scheduler.schedule(a.clone(), Duration::from_secs(3600));
        scheduler.schedule(b.clone(), Duration::from_secs(3600));
        assert_eq!(scheduler.pending(), 2);

        scheduler.shutdown().await;
        assert!(!a.exists());
        assert!(!b.exists());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_already_deleted_file_is_fine() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.mp4");

        let scheduler = DeletionScheduler::new();
        scheduler.schedule(path, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_timer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out_c.mp4");
        std::fs::write(&path, b"x").unwrap();

        let scheduler = DeletionScheduler::new();
        scheduler.schedule(path.clone(), Duration::from_millis(50));
        scheduler.schedule(path.clone(), Duration::from_secs(3600));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(path.exists());

        scheduler.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_late_finish_of_replaced_task_keeps_successor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out_d.mp4");
        std::fs::write(&path, b"x").unwrap();

        let scheduler = DeletionScheduler::new();
        scheduler.schedule(path.clone(), Duration::from_secs(3600));
        let first = lock(&scheduler.tasks).get(&path).map(|(g, _)| *g).unwrap();
        scheduler.schedule(path.clone(), Duration::from_secs(3600));

        // The replaced task was already past its abort point and deregisters late.
        deregister(&scheduler.tasks, &path, first);
        assert_eq!(scheduler.pending(), 1);

        scheduler.shutdown().await;
        assert!(!path.exists());
        assert_eq!(scheduler.pending(), 0);
    }
}

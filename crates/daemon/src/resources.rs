//! Resource sampling for admission control and health reporting.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, ProcessRefreshKind, ProcessesToUpdate, System};

/// Point-in-time resource readings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSample {
    /// Resident memory of this process in bytes.
    pub memory_used_bytes: u64,
    /// Free space on the filesystem holding the work directory, if known.
    pub disk_free_bytes: Option<u64>,
}

/// Source of resource readings. Implemented by [`SystemResources`] in
/// production and by fixed readings in tests.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self, work_dir: &Path) -> ResourceSample;
}

/// Reads this process's memory and the work directory's free disk via sysinfo.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResources;

impl ResourceProbe for SystemResources {
    fn sample(&self, work_dir: &Path) -> ResourceSample {
        ResourceSample {
            memory_used_bytes: process_memory_bytes().unwrap_or(0),
            disk_free_bytes: disk_free_bytes(work_dir),
        }
    }
}

fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );
    sys.process(pid).map(|p| p.memory())
}

/// Free bytes on the disk whose mount point is the longest prefix of `dir`.
fn disk_free_bytes(dir: &Path) -> Option<u64> {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Fixed readings, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedResources(pub ResourceSample);

impl ResourceProbe for FixedResources {
    fn sample(&self, _work_dir: &Path) -> ResourceSample {
        self.0
    }
}

//! Capability probe for optional transcoding-engine filters.
//!
//! Checks once per process whether the installed ffmpeg registers the
//! `rubberband` time-stretch filter. The answer is cached; concurrent callers
//! that arrive before the first check finishes wait for that result instead of
//! launching their own.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::inspect::ProbeError;

/// Registration name of the pitch-preserving time-stretch filter.
pub const TIME_STRETCH_FILTER: &str = "rubberband";

/// Lazily evaluated, process-lifetime filter capability cache.
#[derive(Debug)]
pub struct CapabilityProbe {
    ffmpeg_path: PathBuf,
    timeout: Duration,
    time_stretch: OnceCell<bool>,
}

impl CapabilityProbe {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
            time_stretch: OnceCell::new(),
        }
    }

    /// Probe with a known answer, skipping the subprocess entirely.
    pub fn with_known(time_stretch: bool) -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            timeout: Duration::from_secs(0),
            time_stretch: OnceCell::new_with(Some(time_stretch)),
        }
    }

    /// Whether the time-stretch filter is available. Never fails; any probe
    /// error is logged and reported as `false`.
    pub async fn has_time_stretch_filter(&self) -> bool {
        *self
            .time_stretch
            .get_or_init(|| async {
                let available = match list_filters(&self.ffmpeg_path, self.timeout).await {
                    Ok(listing) => filter_listing_contains(&listing, TIME_STRETCH_FILTER),
                    Err(e) => {
                        warn!(error = %e, "could not list ffmpeg filters; assuming no time-stretch");
                        false
                    }
                };
                info!(available, filter = TIME_STRETCH_FILTER, "time-stretch capability resolved");
                available
            })
            .await
    }

    /// Cached answer, if the probe has already run.
    pub fn cached(&self) -> Option<bool> {
        self.time_stretch.get().copied()
    }
}

/// Run `ffmpeg -hide_banner -filters` under a timeout and return its stdout.
async fn list_filters(ffmpeg: &Path, timeout: Duration) -> Result<String, ProbeError> {
    let child = Command::new(ffmpeg)
        .args(["-hide_banner", "-filters"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ProbeError::TimedOut(timeout))??;

    if !output.status.success() {
        return Err(ProbeError::ProcessFailed(format!(
            "{} -filters exited with {}",
            ffmpeg.display(),
            output.status
        )));
    }

    debug!(bytes = output.stdout.len(), "ffmpeg filter listing captured");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Scan `ffmpeg -filters` output for a registered filter name.
///
/// Listing rows look like ` ... rubberband        A->A       Apply time-stretching...`:
/// a flags column followed by the filter name. Only the name column is
/// matched so a mention inside another filter's description does not count.
pub fn filter_listing_contains(listing: &str, filter: &str) -> bool {
    listing.lines().any(|line| {
        let mut cols = line.split_whitespace();
        match (cols.next(), cols.next()) {
            (Some(first), Some(second)) => first == filter || second == filter,
            (Some(first), None) => first == filter,
            _ => false,
        }
    })
}

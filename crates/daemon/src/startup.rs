//! Startup checks
//!
//! Preflight checks run before the service accepts uploads:
//! - the work directory exists and is writable
//! - the transcoder binary runs and reports a version

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("work directory not usable: {0}")]
    WorkDir(String),

    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Create the work directory if needed and prove it is writable by writing
/// and removing a probe file.
pub fn check_work_dir_writable(dir: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| StartupError::WorkDir(format!("{}: {}", dir.display(), e)))?;

    let probe = dir.join(format!(".write-probe-{}", std::process::id()));
    std::fs::write(&probe, b"ok")
        .map_err(|e| StartupError::WorkDir(format!("{} is not writable: {}", dir.display(), e)))?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Check that `<ffmpeg> -version` runs successfully and log its version.
///
/// An unparseable version banner (e.g. git builds) is accepted.
pub fn check_ffmpeg_available(ffmpeg: &Path) -> Result<Option<u32>, StartupError> {
    let output = Command::new(ffmpeg).arg("-version").output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
            ffmpeg.display(),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg.display(),
            output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output);
    info!(ffmpeg = %ffmpeg.display(), major_version = ?major, "ffmpeg available");
    Ok(major)
}

/// Run all startup checks in order
///
/// 1. Work directory writable
/// 2. ffmpeg runnable
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_work_dir_writable(&cfg.storage.work_dir)?;
    check_ffmpeg_available(&cfg.engine.ffmpeg_path)?;
    Ok(())
}

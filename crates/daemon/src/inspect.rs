//! Media inspector backed by ffprobe.
//!
//! Probes an uploaded file for duration, dimensions, frame rate, audio
//! presence and audio sample rate. Probing is best-effort: every failure degrades to
//! [`MediaProfile::fallback`] with a warning rather than failing the job.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Error type for probe operations. Never surfaced to callers of the service.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Probe subprocess ran but reported failure.
    #[error("probe process failed: {0}")]
    ProcessFailed(String),

    /// Probe subprocess exceeded its time budget.
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse probe output: {0}")]
    ParseError(String),

    /// No usable video stream in the report.
    #[error("no video stream found")]
    NoVideoStream,

    /// IO error spawning or talking to the subprocess.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the generator needs to know about an input file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaProfile {
    /// Container duration in seconds.
    pub duration_secs: f64,
    /// Width of the first video stream in pixels.
    pub width: u32,
    /// Height of the first video stream in pixels.
    pub height: u32,
    /// Whether any audio stream is present.
    pub has_audio: bool,
    /// Codec of the first video stream.
    pub codec: Option<String>,
    /// Nominal (`r_frame_rate`) frame rate of the first video stream.
    pub frame_rate: Option<f64>,
    /// Sample rate of the first audio stream in Hz.
    pub sample_rate: Option<u32>,
}

impl MediaProfile {
    /// Frame rate assumed when the probe does not report one.
    pub const DEFAULT_FRAME_RATE: f64 = 30.0;

    /// Sample rate assumed when the probe does not report one.
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Profile used whenever probing fails: 30s of 1080p with audio.
    pub fn fallback() -> Self {
        Self {
            duration_secs: 30.0,
            width: 1920,
            height: 1080,
            has_audio: true,
            codec: None,
            frame_rate: None,
            sample_rate: None,
        }
    }

    /// Source frame rate, or [`Self::DEFAULT_FRAME_RATE`] when unknown.
    pub fn source_frame_rate(&self) -> f64 {
        self.frame_rate
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(Self::DEFAULT_FRAME_RATE)
    }

    /// Source audio sample rate, or [`Self::DEFAULT_SAMPLE_RATE`] when unknown.
    pub fn source_sample_rate(&self) -> u32 {
        self.sample_rate
            .filter(|rate| *rate > 0)
            .unwrap_or(Self::DEFAULT_SAMPLE_RATE)
    }
}

impl Default for MediaProfile {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub sample_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Runs ffprobe against uploaded files.
#[derive(Debug, Clone)]
pub struct MediaInspector {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl MediaInspector {
    pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    /// Probe a file, falling back to [`MediaProfile::fallback`] on any failure.
    pub async fn probe(&self, path: &Path) -> MediaProfile {
        match self.try_probe(path).await {
            Ok(profile) => {
                debug!(
                    path = %path.display(),
                    duration = profile.duration_secs,
                    width = profile.width,
                    height = profile.height,
                    has_audio = profile.has_audio,
                    "probed media"
                );
                profile
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "media probe failed; using default profile");
                MediaProfile::fallback()
            }
        }
    }

    /// Probe a file, reporting why it failed.
    ///
    /// Runs `ffprobe -v quiet -print_format json -show_format -show_streams <path>`
    /// under the configured timeout.
    pub async fn try_probe(&self, path: &Path) -> Result<MediaProfile, ProbeError> {
        let child = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::TimedOut(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::ProcessFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Parse an ffprobe frame rate such as `30000/1001` or `25`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Parses ffprobe JSON output into a MediaProfile.
///
/// Duration comes from the container report; dimensions, codec and frame rate
/// from the first video stream; sample rate from the first audio stream. A report without a video stream, or whose
/// video stream has no dimensions, is an error.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaProfile, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;
    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let width = video.width.unwrap_or(0);
    let height = video.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(ProbeError::ParseError(format!(
            "video stream has invalid dimensions {}x{}",
            width, height
        )));
    }

    let duration_secs = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);

    let frame_rate = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate));

    let sample_rate = audio
        .and_then(|a| a.sample_rate.as_deref())
        .and_then(|r| r.trim().parse::<u32>().ok())
        .filter(|r| *r > 0);

    Ok(MediaProfile {
        duration_secs,
        width,
        height,
        has_audio: audio.is_some(),
        codec: video.codec_name.clone(),
        frame_rate,
        sample_rate,
    })
}

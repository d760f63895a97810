//! Full transcoder argument vectors.

use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use super::graph::{audio_filters, video_filters};
use super::params::TransformParameters;
use super::policy::PolicyTier;
use crate::inspect::MediaProfile;

/// Which strategy produced a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Primary,
    Fallback,
}

/// A fully stringified transcoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeCommand {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub pitch_preserved: bool,
    pub tier: PolicyTier,
    pub strategy: Strategy,
}

impl TranscodeCommand {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// The `-vf` graph, if any.
    pub fn video_filters(&self) -> Option<&str> {
        self.flag_value("-vf")
    }

    /// The `-af` graph, if any.
    pub fn audio_filters(&self) -> Option<&str> {
        self.flag_value("-af")
    }

    fn flag_value(&self, flag: &str) -> Option<&str> {
        self.argv
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.argv.get(i + 1))
            .map(String::as_str)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Builds transcoder commands. Pure: never touches the filesystem.
#[derive(Debug, Clone)]
pub struct TransformGenerator {
    ffmpeg_path: PathBuf,
}

impl TransformGenerator {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Build the primary command with fresh randomness.
    pub fn build(
        &self,
        input: &Path,
        output: &Path,
        profile: &MediaProfile,
        time_stretch_available: bool,
    ) -> TranscodeCommand {
        self.build_with_rng(
            input,
            output,
            profile,
            time_stretch_available,
            &mut rand::thread_rng(),
            unix_now(),
        )
    }

    /// Build the primary command from an explicit RNG and timestamp.
    ///
    /// # Requirements
    ///
    /// - Tier is selected from the profile before any sampling.
    /// - Audio is disabled with `-an` when the profile has no audio stream;
    ///   no empty `-af` graph is ever emitted.
    /// - Source metadata and chapters are stripped before the randomized
    ///   replacement tags are written.
    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        input: &Path,
        output: &Path,
        profile: &MediaProfile,
        time_stretch_available: bool,
        rng: &mut R,
        timestamp: u64,
    ) -> TranscodeCommand {
        let tier = PolicyTier::for_profile(profile);
        let params = TransformParameters::sample(tier, rng);

        let vf = video_filters(&params, profile.source_frame_rate(), timestamp).join(",");

        let mut argv: Vec<String> = vec![
            path_arg(&self.ffmpeg_path),
            "-hide_banner".into(),
            "-y".into(),
            "-fflags".into(),
            "+genpts".into(),
            "-thread_queue_size".into(),
            "512".into(),
            "-err_detect".into(),
            "ignore_err".into(),
            "-i".into(),
            path_arg(input),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            params.preset.into(),
            "-profile:v".into(),
            params.profile.into(),
            "-crf".into(),
            params.crf.to_string(),
            "-g".into(),
            params.gop.to_string(),
            "-keyint_min".into(),
            (params.gop / 4).max(1).to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-bf".into(),
            params.b_frames.to_string(),
            "-refs".into(),
            params.ref_frames.to_string(),
            "-vf".into(),
            vf,
        ];

        let pitch_preserved = if profile.has_audio {
            let (af, preserved) =
                audio_filters(&params, profile.source_sample_rate(), time_stretch_available);
            argv.extend([
                String::from("-c:a"),
                "aac".into(),
                "-b:a".into(),
                params.audio_bitrate.into(),
                "-ar".into(),
                params.sample_rate.to_string(),
                "-ac".into(),
                "2".into(),
                "-af".into(),
                af.join(","),
            ]);
            preserved
        } else {
            argv.push("-an".into());
            false
        };

        argv.extend([
            String::from("-f"),
            "mp4".into(),
            "-movflags".into(),
            "+faststart+write_colr".into(),
            "-colorspace".into(),
            params.color_space.into(),
            "-color_primaries".into(),
            params.color_primaries.into(),
            "-color_trc".into(),
            params.color_trc.into(),
            "-pix_fmt".into(),
            params.pix_fmt.into(),
            "-map_metadata".into(),
            "-1".into(),
            "-map_chapters".into(),
            "-1".into(),
            "-fflags".into(),
            "+bitexact".into(),
            "-metadata".into(),
            format!("title=Processed_{}", timestamp),
            "-metadata".into(),
            format!("comment=Hash_{}", params.comment_hash),
            "-metadata".into(),
            format!("description=Modified_{}", params.description_tag),
            "-metadata".into(),
            format!("encoder=Custom_{}", params.encoder_tag),
            "-max_muxing_queue_size".into(),
            "1024".into(),
            path_arg(output),
        ]);

        info!(
            tier = %tier,
            crf = params.crf,
            preset = params.preset,
            profile = params.profile,
            pitch_preserved,
            "built transcode command"
        );

        TranscodeCommand {
            argv,
            pitch_preserved,
            tier,
            strategy: Strategy::Primary,
        }
    }

    /// Minimal-modification command used after a recoverable primary failure.
    pub fn build_fallback(&self, input: &Path, output: &Path, has_audio: bool) -> TranscodeCommand {
        self.build_fallback_with_rng(input, output, has_audio, &mut rand::thread_rng())
    }

    pub fn build_fallback_with_rng<R: Rng + ?Sized>(
        &self,
        input: &Path,
        output: &Path,
        has_audio: bool,
        rng: &mut R,
    ) -> TranscodeCommand {
        let brightness: f64 = (rng.gen_range(-0.01..=0.01f64) * 1000.0).round() / 1000.0;
        let contrast: f64 = (rng.gen_range(0.99..=1.01f64) * 1000.0).round() / 1000.0;

        let mut argv: Vec<String> = vec![
            path_arg(&self.ffmpeg_path),
            "-hide_banner".into(),
            "-y".into(),
            "-i".into(),
            path_arg(input),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "fast".into(),
            "-crf".into(),
            "23".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-vf".into(),
            format!(
                "eq=brightness={}:contrast={},noise=alls=3:allf=t",
                brightness, contrast
            ),
        ];

        if has_audio {
            let tempo: f64 = (rng.gen_range(0.99..=1.01f64) * 1000.0).round() / 1000.0;
            argv.extend([
                String::from("-c:a"),
                "aac".into(),
                "-b:a".into(),
                "128k".into(),
                "-af".into(),
                format!("atempo={}", tempo),
            ]);
        } else {
            argv.push("-an".into());
        }

        argv.extend([
            String::from("-map_metadata"),
            "-1".into(),
            "-movflags".into(),
            "+faststart".into(),
            path_arg(output),
        ]);

        info!(has_audio, "built fallback transcode command");

        TranscodeCommand {
            argv,
            pitch_preserved: false,
            tier: PolicyTier::Conservative,
            strategy: Strategy::Fallback,
        }
    }
}

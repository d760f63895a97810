//! Policy tiers and their sampling ranges.
//!
//! Every randomized transform parameter draws from exactly one table below.
//! Conservative inputs (long or above 1080p) get fewer and smaller
//! modifications, a cheaper encoder setup and a shorter time budget.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::inspect::MediaProfile;

/// Inputs longer than this are handled conservatively.
pub const LONG_VIDEO_SECS: f64 = 180.0;

/// Inputs with more pixels per frame than 1080p are handled conservatively.
pub const MAX_STANDARD_PIXELS: u64 = 1920 * 1080;

/// Coarse bucket selecting parameter ranges and time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    Standard,
    Conservative,
}

impl PolicyTier {
    /// Conservative iff duration exceeds [`LONG_VIDEO_SECS`] or the frame is
    /// larger than 1920x1080.
    pub fn select(duration_secs: f64, width: u32, height: u32) -> Self {
        let pixels = width as u64 * height as u64;
        if duration_secs > LONG_VIDEO_SECS || pixels > MAX_STANDARD_PIXELS {
            PolicyTier::Conservative
        } else {
            PolicyTier::Standard
        }
    }

    pub fn for_profile(profile: &MediaProfile) -> Self {
        Self::select(profile.duration_secs, profile.width, profile.height)
    }

    /// Sampling table for this tier.
    pub fn policy(self) -> &'static TierPolicy {
        match self {
            PolicyTier::Standard => &STANDARD,
            PolicyTier::Conservative => &CONSERVATIVE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyTier::Standard => "standard",
            PolicyTier::Conservative => "conservative",
        }
    }
}

impl std::fmt::Display for PolicyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fixed-frequency equalizer band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub freq_hz: u32,
    /// Gain is drawn from `-max_gain_db..=max_gain_db`.
    pub max_gain_db: f64,
}

/// Sampling ranges and choice sets for one tier.
#[derive(Debug)]
pub struct TierPolicy {
    // encoder
    pub crf: &'static [u32],
    pub gop: &'static [u32],
    pub presets: &'static [&'static str],
    /// H.264 profile paired with a pixel format it can encode.
    pub profile_pix_fmts: &'static [(&'static str, &'static str)],
    pub b_frames: &'static [u32],
    pub ref_frames: &'static [u32],

    // geometry
    pub crop_px: RangeInclusive<u32>,
    /// Pad is the crop plus this many extra pixels per edge.
    pub pad_extra_px: RangeInclusive<u32>,
    pub rotation_deg: RangeInclusive<f64>,

    // color
    pub brightness: RangeInclusive<f64>,
    pub contrast: RangeInclusive<f64>,
    pub saturation: RangeInclusive<f64>,
    pub gamma: RangeInclusive<f64>,
    pub channel_gamma: RangeInclusive<f64>,
    pub hue_deg: RangeInclusive<f64>,
    pub hue_saturation: RangeInclusive<f64>,
    pub curves_midtone: Option<RangeInclusive<f64>>,

    // texture
    pub noise: RangeInclusive<u32>,
    /// Temporal-only noise (`allf=t`) instead of temporal + uniform.
    pub temporal_noise_only: bool,
    pub sharpen: Option<RangeInclusive<f64>>,
    pub blur: Option<RangeInclusive<f64>>,

    // timing
    pub frame_rates: &'static [f64],

    // watermarks
    pub watermark_opacity: RangeInclusive<f64>,

    // audio
    pub tempo: RangeInclusive<f64>,
    pub pitch: RangeInclusive<f64>,
    pub volume: RangeInclusive<f64>,
    pub dc_shift: RangeInclusive<f64>,
    pub eq_bands: &'static [EqBand],
    pub audio_bitrates: &'static [&'static str],
    pub sample_rates: &'static [u32],
    /// Whether the pitch-preserving time-stretch filter may be used.
    pub time_stretch: bool,

    // container
    pub color_spaces: &'static [&'static str],
    pub color_primaries: &'static [&'static str],
    pub color_trcs: &'static [&'static str],
}

const FRAME_RATES: &[f64] = &[23.976, 24.0, 25.0, 29.97, 30.0];
const COLOR_SPACES: &[&str] = &["bt709", "bt470bg", "smpte170m"];
const COLOR_PRIMARIES: &[&str] = &["bt709", "bt470bg", "smpte170m"];
const COLOR_TRCS: &[&str] = &["bt709", "gamma22", "smpte170m"];

pub static STANDARD: TierPolicy = TierPolicy {
    crf: &[18, 19, 20, 21, 22, 23, 24, 25],
    gop: &[12, 24, 48, 60],
    presets: &["fast", "medium", "slow"],
    profile_pix_fmts: &[
        ("baseline", "yuv420p"),
        ("main", "yuv420p"),
        ("high", "yuv420p"),
        ("high422", "yuv422p"),
        ("high444", "yuv444p"),
    ],
    b_frames: &[0, 1, 2, 3],
    ref_frames: &[1, 2, 3, 4],

    crop_px: 2..=6,
    pad_extra_px: 1..=3,
    rotation_deg: -1.5..=1.5,

    brightness: -0.08..=0.08,
    contrast: 0.92..=1.08,
    saturation: 0.85..=1.15,
    gamma: 0.85..=1.15,
    channel_gamma: 0.95..=1.05,
    hue_deg: -8.0..=8.0,
    hue_saturation: 0.9..=1.1,
    curves_midtone: Some(0.45..=0.55),

    noise: 8..=15,
    temporal_noise_only: false,
    sharpen: Some(0.1..=0.3),
    blur: Some(0.1..=0.5),

    frame_rates: FRAME_RATES,

    watermark_opacity: 0.001..=0.005,

    tempo: 0.97..=1.03,
    pitch: 0.995..=1.005,
    volume: 0.9..=1.1,
    dc_shift: -0.01..=0.01,
    eq_bands: &[
        EqBand { freq_hz: 200, max_gain_db: 1.0 },
        EqBand { freq_hz: 1000, max_gain_db: 0.5 },
        EqBand { freq_hz: 5000, max_gain_db: 1.0 },
        EqBand { freq_hz: 10000, max_gain_db: 0.5 },
    ],
    audio_bitrates: &["96k", "128k", "160k", "192k"],
    sample_rates: &[44100, 48000],
    time_stretch: true,

    color_spaces: COLOR_SPACES,
    color_primaries: COLOR_PRIMARIES,
    color_trcs: COLOR_TRCS,
};

pub static CONSERVATIVE: TierPolicy = TierPolicy {
    crf: &[20, 21, 22, 23, 24],
    gop: &[24, 48],
    presets: &["fast"],
    profile_pix_fmts: &[("main", "yuv420p"), ("high", "yuv420p")],
    b_frames: &[0, 1, 2],
    ref_frames: &[1, 2],

    crop_px: 1..=3,
    pad_extra_px: 1..=2,
    rotation_deg: -0.75..=0.75,

    brightness: -0.04..=0.04,
    contrast: 0.96..=1.04,
    saturation: 0.92..=1.08,
    gamma: 0.93..=1.07,
    channel_gamma: 0.98..=1.02,
    hue_deg: -4.0..=4.0,
    hue_saturation: 0.95..=1.05,
    curves_midtone: None,

    noise: 2..=5,
    temporal_noise_only: true,
    sharpen: None,
    blur: None,

    frame_rates: FRAME_RATES,

    watermark_opacity: 0.001..=0.003,

    tempo: 0.985..=1.015,
    pitch: 0.9975..=1.0025,
    volume: 0.95..=1.05,
    dc_shift: -0.005..=0.005,
    eq_bands: &[
        EqBand { freq_hz: 200, max_gain_db: 0.5 },
        EqBand { freq_hz: 1000, max_gain_db: 0.3 },
        EqBand { freq_hz: 5000, max_gain_db: 0.5 },
        EqBand { freq_hz: 10000, max_gain_db: 0.3 },
    ],
    audio_bitrates: &["128k", "160k"],
    sample_rates: &[44100, 48000],
    time_stretch: false,

    color_spaces: COLOR_SPACES,
    color_primaries: COLOR_PRIMARIES,
    color_trcs: COLOR_TRCS,
};

//! Sampled transform parameters.

use rand::seq::SliceRandom;
use rand::Rng;
use std::ops::RangeInclusive;

use super::policy::{PolicyTier, TierPolicy};

/// Number of invisible corner/center marks drawn on every frame.
pub const WATERMARK_COUNT: usize = 5;

const DESCRIPTION_TAGS: &[&str] = &["A", "B", "C", "D"];
const ENCODER_TAGS: &[&str] = &["X", "Y", "Z"];

/// One near-invisible mark: a random RGB tag at a fixed canvas position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watermark {
    /// 24-bit RGB color, distinct across the marks of one job.
    pub color: u32,
    pub opacity: f64,
}

/// Everything randomized for one job. Fully determines the argument vector.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformParameters {
    pub tier: PolicyTier,

    pub crf: u32,
    pub gop: u32,
    pub preset: &'static str,
    pub profile: &'static str,
    pub pix_fmt: &'static str,
    pub b_frames: u32,
    pub ref_frames: u32,

    pub crop_px: u32,
    pub pad_px: u32,
    pub rotation_deg: f64,

    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub gamma: f64,
    pub gamma_r: f64,
    pub gamma_g: f64,
    pub gamma_b: f64,
    pub hue_deg: f64,
    pub hue_saturation: f64,
    pub curves_midtone: Option<f64>,

    pub noise: u32,
    pub sharpen: Option<f64>,
    pub blur: Option<f64>,

    pub target_frame_rate: f64,
    pub watermarks: Vec<Watermark>,

    pub tempo: f64,
    pub pitch: f64,
    pub volume: f64,
    pub dc_shift: f64,
    /// `(center frequency Hz, gain dB)` per equalizer band.
    pub eq_gains: Vec<(u32, f64)>,
    pub audio_bitrate: &'static str,
    pub sample_rate: u32,

    pub color_space: &'static str,
    pub color_primaries: &'static str,
    pub color_trc: &'static str,

    pub comment_hash: u32,
    pub description_tag: &'static str,
    pub encoder_tag: &'static str,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, range: &RangeInclusive<f64>, places: i32) -> f64 {
    round_to(rng.gen_range(range.clone()), places)
}

// Choice tables are static and never empty.
fn pick<T: Copy, R: Rng + ?Sized>(rng: &mut R, choices: &[T]) -> T {
    *choices.choose(rng).unwrap_or(&choices[0])
}

impl TransformParameters {
    /// Draw a fresh parameter set from the tier's table.
    pub fn sample<R: Rng + ?Sized>(tier: PolicyTier, rng: &mut R) -> Self {
        let p: &TierPolicy = tier.policy();

        let (profile, pix_fmt) = pick(rng, p.profile_pix_fmts);
        let crop_px = rng.gen_range(p.crop_px.clone());
        let pad_px = crop_px + rng.gen_range(p.pad_extra_px.clone());

        let mut watermarks: Vec<Watermark> = Vec::with_capacity(WATERMARK_COUNT);
        while watermarks.len() < WATERMARK_COUNT {
            let color = rng.gen_range(0..=0x00FF_FFFFu32);
            if watermarks.iter().any(|w| w.color == color) {
                continue;
            }
            watermarks.push(Watermark {
                color,
                opacity: uniform(rng, &p.watermark_opacity, 3),
            });
        }

        let eq_gains = p
            .eq_bands
            .iter()
            .map(|band| {
                let gain = uniform(rng, &(-band.max_gain_db..=band.max_gain_db), 1);
                (band.freq_hz, gain)
            })
            .collect();

        Self {
            tier,

            crf: pick(rng, p.crf),
            gop: pick(rng, p.gop),
            preset: pick(rng, p.presets),
            profile,
            pix_fmt,
            b_frames: pick(rng, p.b_frames),
            ref_frames: pick(rng, p.ref_frames),

            crop_px,
            pad_px,
            rotation_deg: uniform(rng, &p.rotation_deg, 2),

            brightness: uniform(rng, &p.brightness, 3),
            contrast: uniform(rng, &p.contrast, 3),
            saturation: uniform(rng, &p.saturation, 3),
            gamma: uniform(rng, &p.gamma, 3),
            gamma_r: uniform(rng, &p.channel_gamma, 3),
            gamma_g: uniform(rng, &p.channel_gamma, 3),
            gamma_b: uniform(rng, &p.channel_gamma, 3),
            hue_deg: uniform(rng, &p.hue_deg, 1),
            hue_saturation: uniform(rng, &p.hue_saturation, 2),
            curves_midtone: p.curves_midtone.as_ref().map(|r| uniform(rng, r, 3)),

            noise: rng.gen_range(p.noise.clone()),
            sharpen: p.sharpen.as_ref().map(|r| uniform(rng, r, 2)),
            blur: p.blur.as_ref().map(|r| uniform(rng, r, 2)),

            target_frame_rate: pick(rng, p.frame_rates),
            watermarks,

            tempo: uniform(rng, &p.tempo, 3),
            pitch: uniform(rng, &p.pitch, 4),
            volume: uniform(rng, &p.volume, 3),
            dc_shift: uniform(rng, &p.dc_shift, 3),
            eq_gains,
            audio_bitrate: pick(rng, p.audio_bitrates),
            sample_rate: pick(rng, p.sample_rates),

            color_space: pick(rng, p.color_spaces),
            color_primaries: pick(rng, p.color_primaries),
            color_trc: pick(rng, p.color_trcs),

            comment_hash: rng.gen_range(10_000..=99_999),
            description_tag: pick(rng, DESCRIPTION_TAGS),
            encoder_tag: pick(rng, ENCODER_TAGS),
        }
    }
}

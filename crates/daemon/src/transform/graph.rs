//! Filter-graph assembly.
//!
//! Stage order is fixed. Crop changes the reference frame that pad and rotate
//! act on, so geometry always runs crop -> pad -> rotate, followed by color,
//! texture, watermark marks and finally retiming.

use super::params::TransformParameters;

/// Retiming is skipped when target and source rates are this close.
pub const FRAME_RATE_EPSILON: f64 = 0.1;

/// Resample-based pitch shifts smaller than this are inaudible and skipped.
pub const MIN_AUDIBLE_PITCH_SHIFT: f64 = 0.001;

/// Fixed canvas positions for the per-job marks, one per watermark.
const MARK_POSITIONS: [(&str, &str); 5] = [
    ("0", "0"),
    ("iw-1", "0"),
    ("0", "ih-1"),
    ("iw-1", "ih-1"),
    ("iw/2", "ih/2"),
];

const TIMESTAMP_MARK_POSITION: (&str, &str) = ("iw/3", "ih/3");
const TIMESTAMP_MARK_OPACITY: f64 = 0.002;

fn drawbox(x: &str, y: &str, color: u32, opacity: f64) -> String {
    format!(
        "drawbox=x={}:y={}:w=1:h=1:color=0x{:06X}@{}:t=fill",
        x,
        y,
        color & 0x00FF_FFFF,
        opacity
    )
}

/// Ordered video filter stages.
pub fn video_filters(params: &TransformParameters, source_fps: f64, timestamp: u64) -> Vec<String> {
    let mut filters = Vec::with_capacity(16);

    // geometry
    let c = params.crop_px;
    let p = params.pad_px;
    filters.push(format!("crop=iw-{}:ih-{}:{}:{}", 2 * c, 2 * c, c, c));
    filters.push(format!("pad=iw+{}:ih+{}:{}:{}:color=black", 2 * p, 2 * p, p, p));
    filters.push(format!(
        "rotate={}*PI/180:fillcolor=black:bilinear=0",
        params.rotation_deg
    ));

    // color
    filters.push(format!(
        "eq=brightness={}:contrast={}:saturation={}:gamma={}:gamma_r={}:gamma_g={}:gamma_b={}",
        params.brightness,
        params.contrast,
        params.saturation,
        params.gamma,
        params.gamma_r,
        params.gamma_g,
        params.gamma_b
    ));
    filters.push(format!("hue=h={}:s={}", params.hue_deg, params.hue_saturation));
    if let Some(mid) = params.curves_midtone {
        filters.push(format!("curves=all='0/0 0.5/{} 1/1'", mid));
    }

    // texture
    let noise_flags = if params.tier.policy().temporal_noise_only {
        "t"
    } else {
        "t+u"
    };
    filters.push(format!("noise=alls={}:allf={}", params.noise, noise_flags));
    if let Some(amount) = params.sharpen {
        filters.push(format!("unsharp=5:5:{}:5:5:0.0", amount));
    }
    if let Some(amount) = params.blur {
        filters.push(format!("boxblur={}:1", amount));
    }

    // marks
    for (mark, (x, y)) in params.watermarks.iter().zip(MARK_POSITIONS) {
        filters.push(drawbox(x, y, mark.color, mark.opacity));
    }
    let (tx, ty) = TIMESTAMP_MARK_POSITION;
    filters.push(drawbox(tx, ty, timestamp as u32, TIMESTAMP_MARK_OPACITY));

    // timing
    if (params.target_frame_rate - source_fps).abs() > FRAME_RATE_EPSILON {
        filters.push(format!("fps={}", params.target_frame_rate));
    }

    filters
}

/// Ordered audio filter stages and whether pitch was preserved.
///
/// The time-stretch filter is used only when the engine has it and the tier
/// permits it; otherwise tempo and pitch are applied separately and pitch
/// follows the resample ratio. The resample shift is relative to
/// `source_sample_rate` and returns to it, so the pitch factor is exact; the
/// output rate is chosen separately with `-ar`.
pub fn audio_filters(
    params: &TransformParameters,
    source_sample_rate: u32,
    time_stretch_available: bool,
) -> (Vec<String>, bool) {
    let mut filters = Vec::with_capacity(12);
    let use_time_stretch = time_stretch_available && params.tier.policy().time_stretch;

    if use_time_stretch {
        filters.push(format!(
            "rubberband=tempo={}:pitch={}",
            params.tempo, params.pitch
        ));
    } else {
        filters.push(format!("atempo={}", params.tempo));
        if (params.pitch - 1.0).abs() > MIN_AUDIBLE_PITCH_SHIFT {
            let shifted = (source_sample_rate as f64 * params.pitch).round() as u32;
            filters.push(format!("asetrate={}", shifted));
            filters.push(format!("aresample={}", source_sample_rate));
        }
    }

    for (freq, gain) in &params.eq_gains {
        filters.push(format!("equalizer=f={}:t=q:w=1:g={}", freq, gain));
    }
    filters.push(format!("volume={}", params.volume));
    filters.push(format!("dcshift={}", params.dc_shift));
    filters.push("highpass=f=20".to_string());
    filters.push("lowpass=f=20000".to_string());

    (filters, use_time_stretch)
}

/// Stage names without their arguments, e.g. `crop`, `pad`, `rotate`.
pub fn stage_names(filters: &[String]) -> Vec<&str> {
    filters
        .iter()
        .map(|f| f.split_once('=').map(|(name, _)| name).unwrap_or(f))
        .collect()
}

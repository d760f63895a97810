//! Helpers shared by unit tests: fake transcoder scripts.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Fake ffmpeg: answers `-filters` with a rubberband row, otherwise sleeps
/// `delay` seconds and writes a few bytes to its last argument.
pub fn fake_ffmpeg(dir: &Path, delay: &str) -> PathBuf {
    let body = format!(
        r#"if [ "$1" = "-hide_banner" ] && [ "$2" = "-filters" ]; then
  echo ' ... rubberband        A->A       Apply time-stretching and pitch-shifting.'
  exit 0
fi
for last; do :; done
sleep {delay}
printf 'fake-mp4-payload' > "$last"
"#
    );
    write_script(dir, "ffmpeg.sh", &body)
}

/// Fake ffmpeg that exits non-zero with a message on stderr.
pub fn failing_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg-fail.sh",
        "echo 'Error initializing complex filters.' >&2\nexit 1\n",
    )
}

/// Fake ffprobe reporting one video stream of `width`x`height` lasting
/// `duration` seconds, plus a 44.1 kHz stereo audio stream.
pub fn fake_ffprobe(dir: &Path, width: u32, height: u32, duration: f64) -> PathBuf {
    let body = format!(
        r#"cat <<'JSON'
{{
  "streams": [
    {{"codec_type": "video", "codec_name": "h264", "width": {width}, "height": {height},
      "r_frame_rate": "30/1", "avg_frame_rate": "30/1"}},
    {{"codec_type": "audio", "codec_name": "aac", "channels": 2, "sample_rate": "44100"}}
  ],
  "format": {{"duration": "{duration:.3}"}}
}}
JSON
"#
    );
    write_script(dir, "ffprobe.sh", &body)
}

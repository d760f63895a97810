//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

const MIB: u64 = 1024 * 1024;

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address to bind (default 0.0.0.0:5000)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Externally visible base URL used to build download links.
    /// Relative links are returned when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: None,
        }
    }
}

/// Upload and output file handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding uploaded inputs and produced outputs
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Largest accepted upload in bytes (default 100 MiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Accepted upload extensions, lowercase with leading dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Outputs up to this size are returned inline (default 50 MiB)
    #[serde(default = "default_inline_threshold_bytes")]
    pub inline_threshold_bytes: u64,
    /// Delay before a produced output is deleted (default 600s)
    #[serde(default = "default_output_grace_secs")]
    pub output_grace_secs: u64,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/repostproof")
}

fn default_max_upload_bytes() -> u64 {
    100 * MIB
}

fn default_allowed_extensions() -> Vec<String> {
    [".mp4", ".avi", ".mov", ".mkv", ".webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_inline_threshold_bytes() -> u64 {
    50 * MIB
}

fn default_output_grace_secs() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_extensions: default_allowed_extensions(),
            inline_threshold_bytes: default_inline_threshold_bytes(),
            output_grace_secs: default_output_grace_secs(),
        }
    }
}

/// Admission control ceilings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum concurrent transcodes (0 = derive from core count)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Reject new jobs once process memory exceeds this many bytes (default 2 GiB)
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Reject new jobs once free disk falls below this many bytes (default 1 GiB)
    #[serde(default = "default_min_disk_free_bytes")]
    pub min_disk_free_bytes: u64,
}

fn default_max_memory_bytes() -> u64 {
    2048 * MIB
}

fn default_min_disk_free_bytes() -> u64 {
    1024 * MIB
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            max_memory_bytes: default_max_memory_bytes(),
            min_disk_free_bytes: default_min_disk_free_bytes(),
        }
    }
}

/// Retention sweeper schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Files older than this are deleted by the sweeper (default 2h)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Period between sweeps (default 1h)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Delay before the first sweep (default 5s)
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

fn default_retention_secs() -> u64 {
    2 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_initial_delay_secs() -> u64 {
    5
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

/// Subprocess time budgets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    /// Transcode budget for the standard tier (default 300s)
    #[serde(default = "default_standard_secs")]
    pub standard_secs: u64,
    /// Transcode budget for the conservative tier (default 240s)
    #[serde(default = "default_conservative_secs")]
    pub conservative_secs: u64,
    /// Wait between SIGTERM and SIGKILL when tearing down a process group
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Budget for the metadata probe (default 30s)
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    /// Budget for the filter capability check (default 10s)
    #[serde(default = "default_capability_secs")]
    pub capability_secs: u64,
}

fn default_standard_secs() -> u64 {
    300
}

fn default_conservative_secs() -> u64 {
    240
}

fn default_kill_grace_ms() -> u64 {
    3000
}

fn default_probe_secs() -> u64 {
    30
}

fn default_capability_secs() -> u64 {
    10
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            standard_secs: default_standard_secs(),
            conservative_secs: default_conservative_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            probe_secs: default_probe_secs(),
            capability_secs: default_capability_secs(),
        }
    }
}

/// External transcoding engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Retry a failed transcode once with the minimal fallback command (default true)
    #[serde(default = "default_fallback_on_failure")]
    pub fallback_on_failure: bool,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_fallback_on_failure() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            fallback_on_failure: default_fallback_on_failure(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Parse an environment variable into `target`, keeping the old value when unset or invalid.
fn override_from_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = env::var(name) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

/// Normalize an extension list entry to lowercase with a leading dot.
fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.storage.allowed_extensions = config
            .storage
            .allowed_extensions
            .iter()
            .map(|e| normalize_extension(e))
            .collect();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognized variables:
    /// - REPOST_BIND_ADDR -> server.bind_addr
    /// - REPOST_PUBLIC_BASE_URL -> server.public_base_url
    /// - REPOST_WORK_DIR -> storage.work_dir
    /// - REPOST_MAX_UPLOAD_BYTES -> storage.max_upload_bytes
    /// - REPOST_ALLOWED_EXTENSIONS -> storage.allowed_extensions (comma separated)
    /// - REPOST_INLINE_THRESHOLD_BYTES -> storage.inline_threshold_bytes
    /// - REPOST_OUTPUT_GRACE_SECS -> storage.output_grace_secs
    /// - REPOST_MAX_CONCURRENT_JOBS -> limits.max_concurrent_jobs
    /// - REPOST_MAX_MEMORY_BYTES -> limits.max_memory_bytes
    /// - REPOST_MIN_DISK_FREE_BYTES -> limits.min_disk_free_bytes
    /// - REPOST_RETENTION_SECS -> retention.retention_secs
    /// - REPOST_SWEEP_INTERVAL_SECS -> retention.sweep_interval_secs
    /// - REPOST_INITIAL_DELAY_SECS -> retention.initial_delay_secs
    /// - REPOST_STANDARD_TIMEOUT_SECS -> timeouts.standard_secs
    /// - REPOST_CONSERVATIVE_TIMEOUT_SECS -> timeouts.conservative_secs
    /// - REPOST_KILL_GRACE_MS -> timeouts.kill_grace_ms
    /// - REPOST_PROBE_SECS -> timeouts.probe_secs
    /// - REPOST_CAPABILITY_SECS -> timeouts.capability_secs
    /// - REPOST_FFMPEG_PATH -> engine.ffmpeg_path
    /// - REPOST_FFPROBE_PATH -> engine.ffprobe_path
    /// - REPOST_FALLBACK_ON_FAILURE -> engine.fallback_on_failure
    pub fn apply_env_overrides(&mut self) {
        override_from_env("REPOST_BIND_ADDR", &mut self.server.bind_addr);
        if let Ok(val) = env::var("REPOST_PUBLIC_BASE_URL") {
            let val = val.trim().trim_end_matches('/');
            self.server.public_base_url = if val.is_empty() {
                None
            } else {
                Some(val.to_string())
            };
        }

        override_from_env("REPOST_WORK_DIR", &mut self.storage.work_dir);
        override_from_env("REPOST_MAX_UPLOAD_BYTES", &mut self.storage.max_upload_bytes);
        if let Ok(val) = env::var("REPOST_ALLOWED_EXTENSIONS") {
            let exts: Vec<String> = val
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(normalize_extension)
                .collect();
            if !exts.is_empty() {
                self.storage.allowed_extensions = exts;
            }
        }
        override_from_env(
            "REPOST_INLINE_THRESHOLD_BYTES",
            &mut self.storage.inline_threshold_bytes,
        );
        override_from_env("REPOST_OUTPUT_GRACE_SECS", &mut self.storage.output_grace_secs);

        override_from_env("REPOST_MAX_CONCURRENT_JOBS", &mut self.limits.max_concurrent_jobs);
        override_from_env("REPOST_MAX_MEMORY_BYTES", &mut self.limits.max_memory_bytes);
        override_from_env("REPOST_MIN_DISK_FREE_BYTES", &mut self.limits.min_disk_free_bytes);

        override_from_env("REPOST_RETENTION_SECS", &mut self.retention.retention_secs);
        override_from_env(
            "REPOST_SWEEP_INTERVAL_SECS",
            &mut self.retention.sweep_interval_secs,
        );
        override_from_env(
            "REPOST_INITIAL_DELAY_SECS",
            &mut self.retention.initial_delay_secs,
        );

        override_from_env("REPOST_STANDARD_TIMEOUT_SECS", &mut self.timeouts.standard_secs);
        override_from_env(
            "REPOST_CONSERVATIVE_TIMEOUT_SECS",
            &mut self.timeouts.conservative_secs,
        );
        override_from_env("REPOST_KILL_GRACE_MS", &mut self.timeouts.kill_grace_ms);
        override_from_env("REPOST_PROBE_SECS", &mut self.timeouts.probe_secs);
        override_from_env("REPOST_CAPABILITY_SECS", &mut self.timeouts.capability_secs);

        override_from_env("REPOST_FFMPEG_PATH", &mut self.engine.ffmpeg_path);
        override_from_env("REPOST_FFPROBE_PATH", &mut self.engine.ffprobe_path);
        if let Ok(val) = env::var("REPOST_FALLBACK_ON_FAILURE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.engine.fallback_on_failure = true,
                "false" | "0" | "no" => self.engine.fallback_on_failure = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields defaults plus environment overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "REPOST_BIND_ADDR",
        "REPOST_PUBLIC_BASE_URL",
        "REPOST_WORK_DIR",
        "REPOST_MAX_UPLOAD_BYTES",
        "REPOST_ALLOWED_EXTENSIONS",
        "REPOST_INLINE_THRESHOLD_BYTES",
        "REPOST_OUTPUT_GRACE_SECS",
        "REPOST_MAX_CONCURRENT_JOBS",
        "REPOST_MAX_MEMORY_BYTES",
        "REPOST_MIN_DISK_FREE_BYTES",
        "REPOST_RETENTION_SECS",
        "REPOST_SWEEP_INTERVAL_SECS",
        "REPOST_INITIAL_DELAY_SECS",
        "REPOST_STANDARD_TIMEOUT_SECS",
        "REPOST_CONSERVATIVE_TIMEOUT_SECS",
        "REPOST_KILL_GRACE_MS",
        "REPOST_PROBE_SECS",
        "REPOST_CAPABILITY_SECS",
        "REPOST_FFMPEG_PATH",
        "REPOST_FFPROBE_PATH",
        "REPOST_FALLBACK_ON_FAILURE",
    ];

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for name in ENV_VARS {
            env::remove_var(name);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_jobs in 0u32..64,
            max_upload in 1u64..(1u64 << 40),
            min_disk in 0u64..(1u64 << 40),
            retention in 1u64..100_000,
            standard in 1u64..10_000,
            conservative in 1u64..10_000,
            fallback in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[server]
bind_addr = "127.0.0.1:8080"

[storage]
max_upload_bytes = {}

[limits]
max_concurrent_jobs = {}
min_disk_free_bytes = {}

[retention]
retention_secs = {}

[timeouts]
standard_secs = {}
conservative_secs = {}

[engine]
fallback_on_failure = {}
"#,
                max_upload, max_jobs, min_disk, retention, standard, conservative, fallback
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.server.bind_addr.as_str(), "127.0.0.1:8080");
            prop_assert_eq!(config.storage.max_upload_bytes, max_upload);
            prop_assert_eq!(config.limits.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.limits.min_disk_free_bytes, min_disk);
            prop_assert_eq!(config.retention.retention_secs, retention);
            prop_assert_eq!(config.timeouts.standard_secs, standard);
            prop_assert_eq!(config.timeouts.conservative_secs, conservative);
            prop_assert_eq!(config.engine.fallback_on_failure, fallback);
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[limits]
max_concurrent_jobs = {}
"#,
                initial_jobs
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("REPOST_MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.limits.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_env_overrides_timeouts(
            override_standard in 1u64..10_000,
            override_conservative in 1u64..10_000,
            override_probe in 1u64..600,
            override_capability in 1u64..600,
            override_initial_delay in 0u64..3600,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();

            env::set_var("REPOST_STANDARD_TIMEOUT_SECS", override_standard.to_string());
            env::set_var("REPOST_CONSERVATIVE_TIMEOUT_SECS", override_conservative.to_string());
            env::set_var("REPOST_PROBE_SECS", override_probe.to_string());
            env::set_var("REPOST_CAPABILITY_SECS", override_capability.to_string());
            env::set_var("REPOST_INITIAL_DELAY_SECS", override_initial_delay.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.timeouts.standard_secs, override_standard);
            prop_assert_eq!(config.timeouts.conservative_secs, override_conservative);
            prop_assert_eq!(config.timeouts.probe_secs, override_probe);
            prop_assert_eq!(config.timeouts.capability_secs, override_capability);
            prop_assert_eq!(config.retention.initial_delay_secs, override_initial_delay);
        }

        #[test]
        fn prop_env_overrides_fallback(
            initial in proptest::bool::ANY,
            override_fallback in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[engine]
fallback_on_failure = {}
"#,
                initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("REPOST_FALLBACK_ON_FAILURE", override_fallback.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.engine.fallback_on_failure, override_fallback);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.server.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.server.public_base_url, None);
        assert_eq!(config.storage.work_dir, PathBuf::from("/tmp/repostproof"));
        assert_eq!(config.storage.max_upload_bytes, 100 * MIB);
        assert_eq!(config.storage.inline_threshold_bytes, 50 * MIB);
        assert_eq!(config.storage.allowed_extensions.len(), 5);
        assert_eq!(config.limits.max_concurrent_jobs, 0);
        assert_eq!(config.retention.retention_secs, 7200);
        assert_eq!(config.retention.sweep_interval_secs, 3600);
        assert_eq!(config.timeouts.standard_secs, 300);
        assert!(config.timeouts.conservative_secs < config.timeouts.standard_secs);
        assert!(config.engine.fallback_on_failure);
    }

    #[test]
    fn test_extensions_are_normalized() {
        let toml_str = r#"
[storage]
allowed_extensions = ["MP4", ".Mov"]
"#;
        let config = Config::parse_toml(toml_str).expect("Valid TOML");

        assert_eq!(config.storage.allowed_extensions, vec![".mp4", ".mov"]);
    }

    #[test]
    fn test_env_override_extension_list_and_invalid_numbers() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("REPOST_ALLOWED_EXTENSIONS", "mp4, .WEBM");
        env::set_var("REPOST_MAX_UPLOAD_BYTES", "not-a-number");
        env::set_var("REPOST_PUBLIC_BASE_URL", "https://example.test/");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.storage.allowed_extensions, vec![".mp4", ".webm"]);
        assert_eq!(config.storage.max_upload_bytes, 100 * MIB);
        assert_eq!(
            config.server.public_base_url.as_deref(),
            Some("https://example.test")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/repostproof/config.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }
}

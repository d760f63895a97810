//! Concurrency planning.
//!
//! Derives the job ceiling from configuration and the host's core count.

use crate::config::Config;

/// Upper bound on the derived ceiling.
pub const MAX_DERIVED_JOBS: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of transcodes running at once
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the explicit `limits.max_concurrent_jobs` when non-zero, otherwise
    /// one job per four logical cores, clamped to `1..=8`.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.limits.max_concurrent_jobs > 0 {
            cfg.limits.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

/// One transcode per four cores, at least one and at most [`MAX_DERIVED_JOBS`].
fn derive_max_jobs(cores: u32) -> u32 {
    (cores / 4).clamp(1, MAX_DERIVED_JOBS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

//! Repost-proof transcoding service
//!
//! Accepts uploaded videos, re-encodes them through a randomized but bounded
//! perceptual transform pipeline, and hands the result back inline or via a
//! short-lived download link.

pub mod capability;
pub mod concurrency;
pub mod daemon;
pub mod governor;
pub mod inspect;
pub mod process;
pub mod resources;
pub mod scheduler;
pub mod server;
pub mod startup;
pub mod sweeper;
pub mod transform;

#[cfg(test)]
mod test_support;

pub use repostproof_config as config;
pub use repostproof_config::Config;
pub use capability::CapabilityProbe;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use governor::{
    ErrorKind, ExecutionFailure, Governor, GovernorConfig, HealthStatus, JobError, JobOutcome,
    JobState, Stats,
};
pub use inspect::{MediaInspector, MediaProfile, ProbeError};
pub use resources::{ResourceProbe, ResourceSample, SystemResources};
pub use scheduler::DeletionScheduler;
pub use server::{create_router, AppState, ServerError, ServerSettings};
pub use startup::{run_startup_checks, StartupError};
pub use sweeper::{RetentionSweeper, SweepReport};
pub use transform::{PolicyTier, TranscodeCommand, TransformGenerator};

//! Transform parameter generation.
//!
//! Picks a policy tier from the inspected profile, samples a bounded random
//! parameter set from that tier's table and renders it into a complete
//! transcoder argument vector.

pub mod command;
pub mod graph;
pub mod params;
pub mod policy;

pub use command::{Strategy, TranscodeCommand, TransformGenerator};
pub use params::{TransformParameters, Watermark};
pub use policy::{PolicyTier, TierPolicy};

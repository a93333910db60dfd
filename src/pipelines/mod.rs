//! # Pipelines

pub mod restoration;

pub use restoration::{RestorationConfig, RestorationPipeline};

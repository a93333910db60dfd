//! # Guided diffusion restoration
//!
//! Restores degraded images by sampling from a pretrained diffusion model
//! while steering each reverse step with a gradient computed at runtime, see
//! [Torch](https://github.com/LaurentMazare/tch-rs) for the tensor backend.
//!
//! This library includes:
//! - Linear and cosine noise schedules with ancestral (DDPM) and
//!   deterministic (DDIM) update rules.
//! - A pluggable guidance protocol and a guidance made of weighted loss
//!   terms against an auxiliary restoration model.
//! - A reverse sampler applying guidance within a window of timesteps.
//!
//! The networks themselves are consumed as TorchScript modules.

pub mod conditioning;
pub mod distributed;
pub mod error;
pub mod guidance;
pub mod image;
pub mod models;
pub mod pipelines;
pub mod sampler;
pub mod schedulers;
pub mod utils;

pub use error::{Error, Result};

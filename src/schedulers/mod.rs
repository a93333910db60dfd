//! # Noise schedules and reverse update rules
//!
//! The schedule fixes the forward noising process, the update rules
//! ([`ddpm`] for ancestral sampling, [`ddim`] for deterministic sampling)
//! walk it backwards one chain step at a time.

use tch::{kind, Tensor};

pub mod ddim;
pub mod ddpm;
pub mod schedule;

pub use schedule::{DiffusionSchedule, DiffusionScheduleConfig, Posterior};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// What the denoiser network predicts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// Contains a function `alpha_bar` that takes an argument `t` and transforms it to the cumulative product of `(1-beta)`
/// up to that part of the diffusion process.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar =
        |time: f64| f64::cos((time + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    let mut betas = Vec::with_capacity(num_diffusion_timesteps);
    for i in 0..num_diffusion_timesteps {
        let t1 = i as f64 / num_diffusion_timesteps as f64;
        let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
        betas.push((1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta));
    }

    Tensor::from_slice(&betas)
}

pub(crate) fn linear_betas(beta_start: f64, beta_end: f64, steps: usize) -> Tensor {
    Tensor::linspace(beta_start, beta_end, steps as i64, kind::DOUBLE_CPU)
}

pub(crate) fn scaled_linear_betas(beta_start: f64, beta_end: f64, steps: usize) -> Tensor {
    Tensor::linspace(beta_start.sqrt(), beta_end.sqrt(), steps as i64, kind::DOUBLE_CPU).square()
}

/// The update rule used to go from one chain step to the next.
#[derive(Debug, Clone)]
pub enum UpdateRule {
    Ancestral(ddpm::DDPMScheduler),
    Deterministic(ddim::DDIMScheduler),
}

impl UpdateRule {
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::Deterministic(_))
    }
}

//! # Denoising Diffusion Probabilistic Models
//!
//! Ancestral sampling: every step draws from the posterior
//! `q(x_prev | x_t, x_0)` with `x_0` replaced by the (possibly guided) clean
//! estimate.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::DiffusionSchedule;
use crate::error::{Error, Result};
use tch::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DDPMVarianceType {
    /// The posterior variance.
    #[default]
    FixedSmall,
    /// The forward process variance beta.
    FixedLarge,
    /// The network outputs an interpolation coefficient in [-1, 1] between
    /// the log of the two fixed variances, improved DDPM style.
    LearnedRange,
}

/// Additional configuration for the [`DDPMScheduler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DDPMSchedulerConfig {
    pub variance_type: DDPMVarianceType,
}

#[derive(Debug, Clone)]
pub struct DDPMScheduler {
    schedule: DiffusionSchedule,
    timesteps: Vec<usize>,
    pub config: DDPMSchedulerConfig,
}

impl DDPMScheduler {
    pub fn new(
        schedule: DiffusionSchedule,
        inference_steps: usize,
        config: DDPMSchedulerConfig,
    ) -> Result<Self> {
        let timesteps = schedule.spaced_timesteps(inference_steps)?;
        Ok(Self { schedule, timesteps, config })
    }

    pub fn schedule(&self) -> &DiffusionSchedule {
        &self.schedule
    }

    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    /// Performs a backward step during inference, `prev_timestep` is `None`
    /// for the last step in which case no noise gets added.
    pub fn step(
        &self,
        pred_original_sample: &Tensor,
        variance_values: Option<&Tensor>,
        timestep: usize,
        prev_timestep: Option<usize>,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let posterior = self.schedule.posterior(timestep, prev_timestep);

        // formula 7
        let pred_prev_sample = posterior.mean_coef_start * pred_original_sample
            + posterior.mean_coef_current * sample;
        if prev_timestep.is_none() {
            return Ok(pred_prev_sample);
        }

        let variance_noise = Tensor::randn_like(sample);
        let noise = match self.config.variance_type {
            DDPMVarianceType::FixedSmall => posterior.variance.sqrt() * variance_noise,
            DDPMVarianceType::FixedLarge => posterior.beta.sqrt() * variance_noise,
            DDPMVarianceType::LearnedRange => {
                let values = variance_values.ok_or_else(|| {
                    Error::invalid_output("learned variance requires a model predicting it")
                })?;
                let min_log = posterior.log_variance_clipped;
                let max_log = posterior.beta.ln();
                let frac = (values + 1.) / 2.;
                let log_variance: Tensor = &frac * max_log + (1. - frac) * min_log;
                (log_variance * 0.5).exp() * variance_noise
            }
        };
        Ok(pred_prev_sample + noise)
    }
}

//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) is a simple scheduler
//! similar to Denoising Diffusion Probabilistic Models (DDPM). The DDPM
//! generative process is the reverse of a Markovian process, DDIM generalizes
//! this to non-Markovian guidance.
//!
//! With `eta = 0` the update is deterministic, which makes it possible both
//! to skip timesteps and to invert the chain (encode an image into the noise
//! that regenerates it).
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::DiffusionSchedule;
use crate::error::Result;
use tch::Tensor;

/// The configuration for the DDIM scheduler.
#[derive(Debug, Clone, Copy)]
pub struct DDIMSchedulerConfig {
    /// The amount of noise to be added at each step.
    pub eta: f64,
}

impl Default for DDIMSchedulerConfig {
    fn default() -> Self {
        Self { eta: 0. }
    }
}

/// The DDIM scheduler.
#[derive(Debug, Clone)]
pub struct DDIMScheduler {
    schedule: DiffusionSchedule,
    timesteps: Vec<usize>,
    pub config: DDIMSchedulerConfig,
}

impl DDIMScheduler {
    /// Creates a new DDIM scheduler given the number of steps to be
    /// used for inference, spaced over the steps of the schedule.
    pub fn new(
        schedule: DiffusionSchedule,
        inference_steps: usize,
        config: DDIMSchedulerConfig,
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

    /// Performs a backward step during inference. The noise direction is
    /// recomputed from `pred_original_sample` so that a guided clean estimate
    /// is reflected in both terms of the update.
    pub fn step(
        &self,
        pred_original_sample: &Tensor,
        timestep: usize,
        prev_timestep: Option<usize>,
        sample: &Tensor,
    ) -> Tensor {
        let alpha_prod_t = self.schedule.cumulative_signal_at(timestep);
        let alpha_prod_t_prev = prev_timestep.map_or(1., |t| self.schedule.cumulative_signal_at(t));
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let pred_epsilon = self.schedule.noise_from_start(sample, pred_original_sample, timestep);

        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.config.eta * variance.sqrt();

        let pred_sample_direction =
            (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).sqrt() * pred_epsilon;
        let prev_sample = alpha_prod_t_prev.sqrt() * pred_original_sample + pred_sample_direction;
        if self.config.eta > 0. && prev_timestep.is_some() {
            &prev_sample + Tensor::randn_like(&prev_sample) * std_dev_t
        } else {
            prev_sample
        }
    }

    /// One step of the inverted chain: re-noises a clean estimate to
    /// `next_timestep` along the predicted noise direction.
    pub fn reverse_step(
        &self,
        pred_original_sample: &Tensor,
        pred_epsilon: &Tensor,
        next_timestep: usize,
    ) -> Tensor {
        let alpha_prod_next = self.schedule.cumulative_signal_at(next_timestep);
        alpha_prod_next.sqrt() * pred_original_sample + (1. - alpha_prod_next).sqrt() * pred_epsilon
    }
}

//! The fixed variance schedule of the forward process.
//!
//! Everything here is plain `f64` lookups, the schedule is built once and
//! shared read-only by the sampler, the update rules and the guidance.
use super::{betas_for_alpha_bar, linear_betas, scaled_linear_betas, BetaSchedule};
use crate::error::{Error, Result};
use tch::Tensor;

/// The configuration of the forward noising process.
#[derive(Debug, Clone, Copy)]
pub struct DiffusionScheduleConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model
    pub train_timesteps: usize,
}

impl Default for DiffusionScheduleConfig {
    fn default() -> Self {
        Self::linear(1000)
    }
}

impl DiffusionScheduleConfig {
    /// The linear schedule of the improved DDPM models, the beta range is
    /// rescaled so that any number of training steps covers the same noise
    /// levels as 1000 steps.
    pub fn linear(train_timesteps: usize) -> Self {
        let scale = 1000. / train_timesteps.max(1) as f64;
        Self {
            beta_start: scale * 0.0001,
            beta_end: scale * 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps,
        }
    }

    pub fn cosine(train_timesteps: usize) -> Self {
        Self { beta_schedule: BetaSchedule::SquaredcosCapV2, ..Self::linear(train_timesteps) }
    }
}

/// Coefficients of the posterior `q(x_prev | x_t, x_0)` between two chain
/// steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posterior {
    /// Effective beta between the two steps, `1 - alpha_bar_t / alpha_bar_prev`.
    pub beta: f64,
    pub mean_coef_start: f64,
    pub mean_coef_current: f64,
    pub variance: f64,
    /// Log of the variance, floored so that the terminal step stays finite.
    pub log_variance_clipped: f64,
}

#[derive(Debug, Clone)]
pub struct DiffusionSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    pub config: DiffusionScheduleConfig,
}

impl DiffusionSchedule {
    pub fn new(config: DiffusionScheduleConfig) -> Result<Self> {
        if config.train_timesteps == 0 {
            return Err(Error::config("the schedule needs at least one timestep"));
        }
        let n = config.train_timesteps;
        let betas = match config.beta_schedule {
            BetaSchedule::Linear => linear_betas(config.beta_start, config.beta_end, n),
            BetaSchedule::ScaledLinear => scaled_linear_betas(config.beta_start, config.beta_end, n),
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
        };
        let betas = Vec::<f64>::try_from(betas)?;
        Self::from_betas(betas, config)
    }

    fn from_betas(betas: Vec<f64>, config: DiffusionScheduleConfig) -> Result<Self> {
        if let Some((t, beta)) = betas.iter().enumerate().find(|(_, &b)| !(b > 0. && b < 1.)) {
            return Err(Error::config(format!("beta at timestep {t} is out of (0, 1): {beta}")));
        }
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut acc = 1.0;
        for beta in betas.iter() {
            acc *= 1. - beta;
            alphas_cumprod.push(acc);
        }
        if alphas_cumprod.iter().any(|a| !(*a > 0.)) {
            return Err(Error::config("cumulative signal underflows to zero"));
        }
        Ok(Self { betas, alphas_cumprod, config })
    }

    /// Number of timesteps `T` of the forward process.
    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn variance_at(&self, timestep: usize) -> f64 {
        self.betas[timestep]
    }

    pub fn cumulative_signal_at(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// `alpha_bar` of an optional chain step, `None` stands for the clean image.
    fn cumulative_signal_or_one(&self, timestep: Option<usize>) -> f64 {
        timestep.map_or(1.0, |t| self.alphas_cumprod[t])
    }

    pub fn posterior(&self, timestep: usize, prev_timestep: Option<usize>) -> Posterior {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = self.cumulative_signal_or_one(prev_timestep);
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;
        let current_alpha = alpha_prod_t / alpha_prod_t_prev;
        let beta = 1. - current_alpha;

        let variance = beta * beta_prod_t_prev / beta_prod_t;
        Posterior {
            beta,
            mean_coef_start: beta * alpha_prod_t_prev.sqrt() / beta_prod_t,
            mean_coef_current: beta_prod_t_prev * current_alpha.sqrt() / beta_prod_t,
            variance,
            log_variance_clipped: variance.max(1e-20).ln(),
        }
    }

    /// Evenly spaced subsequence of `inference_steps` timesteps, in the
    /// decreasing order in which the reverse chain visits them. When more than
    /// one step is requested both `T - 1` and `0` are part of the chain.
    pub fn spaced_timesteps(&self, inference_steps: usize) -> Result<Vec<usize>> {
        let n = self.len();
        if inference_steps == 0 || inference_steps > n {
            return Err(Error::config(format!(
                "cannot run {inference_steps} sampling steps with a {n} steps schedule"
            )));
        }
        let stride =
            if inference_steps > 1 { (n - 1) as f64 / (inference_steps - 1) as f64 } else { 1. };
        let timesteps =
            (0..inference_steps).rev().map(|i| (i as f64 * stride).round() as usize).collect();
        Ok(timesteps)
    }

    /// Samples `q(x_t | x_0)`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Tensor {
        let alpha_prod = self.alphas_cumprod[timestep];
        alpha_prod.sqrt() * original + (1. - alpha_prod).sqrt() * noise
    }

    /// Samples `q(x_t | x_prev)`, going one chain step forward.
    pub fn renoise(
        &self,
        sample: &Tensor,
        noise: &Tensor,
        prev_timestep: Option<usize>,
        timestep: usize,
    ) -> Tensor {
        let alpha = self.alphas_cumprod[timestep] / self.cumulative_signal_or_one(prev_timestep);
        alpha.sqrt() * sample + (1. - alpha).sqrt() * noise
    }

    /// `x_0 = (x_t - sqrt(1 - alpha_bar_t) eps) / sqrt(alpha_bar_t)`
    pub fn start_from_noise(&self, sample: &Tensor, noise: &Tensor, timestep: usize) -> Tensor {
        let alpha_prod = self.alphas_cumprod[timestep];
        (sample - (1. - alpha_prod).sqrt() * noise) / alpha_prod.sqrt()
    }

    /// The inverse relation, recovering the noise implied by a clean estimate.
    pub fn noise_from_start(&self, sample: &Tensor, start: &Tensor, timestep: usize) -> Tensor {
        let alpha_prod = self.alphas_cumprod[timestep];
        (sample - alpha_prod.sqrt() * start) / (1. - alpha_prod).sqrt()
    }
}

//! # Guided reverse sampling
//!
//! The sampler walks the chain of timesteps of its update rule from the
//! noisiest one down to zero. At every step the denoiser gives a clean
//! estimate; inside the guidance window the estimate is moved against the
//! guidance gradient before the update rule derives the next sample.
use crate::conditioning::Conditioning;
use crate::error::{Error, Result};
use crate::guidance::GuidanceFunction;
use crate::models::{DenoiserModel, ModelOutput};
use crate::schedulers::{DiffusionSchedule, PredictionType, UpdateRule};
use crate::utils::ensure_finite;
use tch::{Kind, Tensor};

/// What to do when more than one gradient step is taken at a timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    /// Repeat the gradient step on the same clean estimate.
    #[default]
    Reuse,
    /// Between gradient steps, take the reverse step, noise the result back
    /// to the current timestep and query the denoiser again.
    Requery,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub prediction_type: PredictionType,
    /// Clamp the clean estimate to [-1, 1] before using it.
    pub clip_denoised: bool,
    pub repeat_mode: RepeatMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            prediction_type: PredictionType::Epsilon,
            clip_denoised: true,
            repeat_mode: RepeatMode::Reuse,
        }
    }
}

/// Where the chain starts.
#[derive(Debug)]
pub enum InitialState {
    /// Gaussian noise drawn from the global generator.
    Noise,
    /// A given sample at the first timestep of the chain.
    Sample(Tensor),
    /// A clean reference image, deterministically encoded by running the
    /// chain backwards. Requires the deterministic update rule.
    Encode(Tensor),
}

#[derive(Debug)]
pub struct SampleOutput {
    /// The final sample, nominally in [-1, 1] and not clamped.
    pub sample: Tensor,
    /// Number of reverse steps taken.
    pub steps: usize,
    /// The timesteps at which guidance was applied, in chain order.
    pub guided_timesteps: Vec<usize>,
}

pub struct ReverseSampler {
    rule: UpdateRule,
    pub config: SamplerConfig,
}

impl ReverseSampler {
    pub fn new(rule: UpdateRule, config: SamplerConfig) -> Self {
        Self { rule, config }
    }

    pub fn schedule(&self) -> &DiffusionSchedule {
        match &self.rule {
            UpdateRule::Ancestral(s) => s.schedule(),
            UpdateRule::Deterministic(s) => s.schedule(),
        }
    }

    /// The timesteps visited by the chain, in decreasing order.
    pub fn timesteps(&self) -> &[usize] {
        match &self.rule {
            UpdateRule::Ancestral(s) => s.timesteps(),
            UpdateRule::Deterministic(s) => s.timesteps(),
        }
    }

    pub fn rule(&self) -> &UpdateRule {
        &self.rule
    }

    /// Queries the denoiser and derives the clean estimate.
    fn denoise(
        &self,
        model: &dyn DenoiserModel,
        sample: &Tensor,
        timestep: usize,
        conditioning: &Conditioning,
    ) -> Result<(Tensor, ModelOutput)> {
        let size = sample.size();
        let timesteps = Tensor::full([size[0]], timestep as i64, (Kind::Int64, sample.device()));
        let output =
            tch::no_grad(|| model.forward(sample, &timesteps, conditioning.class_labels.as_ref()))?;
        let output = ModelOutput::split(output, size[1])?;
        ensure_finite(&output.prediction, timestep, "denoiser output")?;
        if let Some(variance_values) = output.variance_values.as_ref() {
            ensure_finite(variance_values, timestep, "denoiser variance")?;
        }

        let schedule = self.schedule();
        let prediction = &output.prediction;
        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => schedule.start_from_noise(sample, prediction, timestep),
            PredictionType::Sample => prediction.shallow_clone(),
            PredictionType::VPrediction => {
                let alpha_prod = schedule.cumulative_signal_at(timestep);
                alpha_prod.sqrt() * sample - (1. - alpha_prod).sqrt() * prediction
            }
        };
        let pred_original_sample = if self.config.clip_denoised {
            pred_original_sample.clamp(-1., 1.)
        } else {
            pred_original_sample
        };
        ensure_finite(&pred_original_sample, timestep, "clean estimate")?;
        Ok((pred_original_sample, output))
    }

    fn update(
        &self,
        pred_original_sample: &Tensor,
        output: &ModelOutput,
        timestep: usize,
        prev_timestep: Option<usize>,
        sample: &Tensor,
    ) -> Result<Tensor> {
        match &self.rule {
            UpdateRule::Ancestral(s) => s.step(
                pred_original_sample,
                output.variance_values.as_ref(),
                timestep,
                prev_timestep,
                sample,
            ),
            UpdateRule::Deterministic(s) => {
                Ok(s.step(pred_original_sample, timestep, prev_timestep, sample))
            }
        }
    }

    /// Deterministically maps a clean image to the sample at the first
    /// timestep of the chain that regenerates it.
    pub fn encode(
        &self,
        model: &dyn DenoiserModel,
        image: &Tensor,
        conditioning: &Conditioning,
    ) -> Result<Tensor> {
        let scheduler = match &self.rule {
            UpdateRule::Deterministic(s) => s,
            UpdateRule::Ancestral(_) => {
                return Err(Error::config("encoding an image requires the deterministic rule"))
            }
        };
        let _no_grad = tch::no_grad_guard();
        let timesteps = scheduler.timesteps();
        let first = match timesteps.last() {
            Some(&first) => first,
            None => return Ok(image.shallow_clone()),
        };
        // The first hop leaves the clean image along the noise the denoiser
        // sees in it at the lowest timestep.
        let (pred_original_sample, _) = self.denoise(model, image, first, conditioning)?;
        let pred_epsilon = self.schedule().noise_from_start(image, &pred_original_sample, first);
        let mut sample = scheduler.reverse_step(image, &pred_epsilon, first);
        for pair in timesteps.windows(2).rev() {
            let (next_timestep, timestep) = (pair[0], pair[1]);
            let (pred_original_sample, _) = self.denoise(model, &sample, timestep, conditioning)?;
            let pred_epsilon =
                self.schedule().noise_from_start(&sample, &pred_original_sample, timestep);
            sample = scheduler.reverse_step(&pred_original_sample, &pred_epsilon, next_timestep);
            ensure_finite(&sample, next_timestep, "encoded sample")?;
        }
        Ok(sample)
    }

    /// Runs the full reverse chain.
    ///
    /// The target cached from one guided timestep is passed to the guidance at
    /// the following ones, so an auxiliary predictor is queried at most once
    /// per run unless the guidance decides otherwise.
    pub fn sample(
        &self,
        model: &dyn DenoiserModel,
        guidance: Option<&dyn GuidanceFunction>,
        conditioning: &Conditioning,
        init: InitialState,
    ) -> Result<SampleOutput> {
        let _no_grad = tch::no_grad_guard();
        let degraded = &conditioning.degraded;
        let mut sample = match init {
            InitialState::Noise => {
                Tensor::randn(degraded.size().as_slice(), (degraded.kind(), degraded.device()))
            }
            InitialState::Sample(sample) => sample,
            InitialState::Encode(image) => self.encode(model, &image, conditioning)?,
        };
        if sample.size() != degraded.size() {
            return Err(Error::config(format!(
                "initial sample of size {:?} does not match the input of size {:?}",
                sample.size(),
                degraded.size()
            )));
        }

        let params = conditioning.guidance;
        let schedule = self.schedule();
        let timesteps = self.timesteps();
        let mut cached_target = conditioning.target.as_ref().map(|t| t.detach());
        let mut guided_timesteps = vec![];
        for (index, &timestep) in timesteps.iter().enumerate() {
            let prev_timestep = timesteps.get(index + 1).copied();
            ensure_finite(&sample, timestep, "sample")?;
            let (mut pred_original_sample, mut output) =
                self.denoise(model, &sample, timestep, conditioning)?;

            let guidance = guidance.filter(|_| params.is_active(timestep));
            if let Some(guidance) = guidance {
                guided_timesteps.push(timestep);
                for repetition in 0..params.repetitions {
                    if repetition > 0 && self.config.repeat_mode == RepeatMode::Requery {
                        let prev_sample = self.update(
                            &pred_original_sample,
                            &output,
                            timestep,
                            prev_timestep,
                            &sample,
                        )?;
                        let noise = Tensor::randn_like(&sample);
                        sample = schedule.renoise(&prev_sample, &noise, prev_timestep, timestep);
                        ensure_finite(&sample, timestep, "sample")?;
                        (pred_original_sample, output) =
                            self.denoise(model, &sample, timestep, conditioning)?;
                    }
                    let result = guidance.compute(
                        &sample,
                        timestep,
                        conditioning,
                        &pred_original_sample,
                        cached_target.as_ref(),
                    )?;
                    ensure_finite(&result.gradient, timestep, "guidance gradient")?;
                    if let Some(target) = result.target {
                        cached_target = Some(target);
                    }
                    pred_original_sample = pred_original_sample - params.scale * result.gradient;
                    ensure_finite(&pred_original_sample, timestep, "guided clean estimate")?;
                }
            }

            sample =
                self.update(&pred_original_sample, &output, timestep, prev_timestep, &sample)?;
            ensure_finite(&sample, timestep, "sample")?;
            tracing::debug!(
                step = index + 1,
                total = timesteps.len(),
                timestep,
                guided = guidance.is_some(),
                "reverse step"
            );
        }

        Ok(SampleOutput { sample, steps: timesteps.len(), guided_timesteps })
    }
}

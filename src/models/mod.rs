//! # Models
//!
//! The networks driving the reverse chain are consumed through two traits:
//! [`DenoiserModel`] predicts the noise (and optionally the variance) of a
//! noisy sample, [`AuxiliaryPredictor`] produces an independent clean
//! estimate used as a guidance target. Their architectures are not part of
//! this crate, [`torchscript`] wraps exported TorchScript modules.

use crate::error::{Error, Result};
use tch::Tensor;

pub mod torchscript;
pub mod weights;

pub trait DenoiserModel {
    /// `timesteps` is an int64 tensor with one entry per batch element.
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        class_labels: Option<&Tensor>,
    ) -> Result<Tensor>;
}

impl<F> DenoiserModel for F
where
    F: Fn(&Tensor, &Tensor, Option<&Tensor>) -> Result<Tensor>,
{
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        class_labels: Option<&Tensor>,
    ) -> Result<Tensor> {
        self(xs, timesteps, class_labels)
    }
}

pub trait AuxiliaryPredictor {
    /// Returns a clean image estimate for `degraded`. The current noisy
    /// sample and its timestep are passed along for predictors that use
    /// them, most ignore them.
    fn restore(&self, degraded: &Tensor, sample: &Tensor, timesteps: &Tensor) -> Result<Tensor>;
}

impl<F> AuxiliaryPredictor for F
where
    F: Fn(&Tensor, &Tensor, &Tensor) -> Result<Tensor>,
{
    fn restore(&self, degraded: &Tensor, sample: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self(degraded, sample, timesteps)
    }
}

/// A denoiser output split into its prediction and, for models trained with
/// a learned variance, the interpolation values.
#[derive(Debug)]
pub struct ModelOutput {
    pub prediction: Tensor,
    pub variance_values: Option<Tensor>,
}

impl ModelOutput {
    pub fn split(output: Tensor, sample_channels: i64) -> Result<Self> {
        let channels = output.size().get(1).copied().unwrap_or(0);
        if channels == sample_channels {
            Ok(Self { prediction: output, variance_values: None })
        } else if channels == 2 * sample_channels {
            let mut chunks = output.split(sample_channels, 1);
            let variance_values = chunks.pop();
            let prediction = chunks.remove(0);
            Ok(Self { prediction, variance_values })
        } else {
            Err(Error::invalid_output(format!(
                "denoiser returned {channels} channels for a {sample_channels} channels sample"
            )))
        }
    }
}

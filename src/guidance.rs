//! # Guidance
//!
//! A guidance function scores the clean estimate of the current sample and
//! returns the gradient of that score with respect to the estimate. The
//! sampler moves the estimate against this gradient before taking its
//! reverse step, steering the chain without touching the denoiser.
//!
//! Gradients never reach the networks: the estimate is detached and turned
//! into a fresh leaf inside a [`GradContext`], which is the only place where
//! gradient tracking is enabled.
use crate::conditioning::Conditioning;
use crate::error::{Error, Result};
use crate::models::AuxiliaryPredictor;
use tch::{Kind, Tensor};

/// The gradient produced at one timestep, and the target it was computed
/// against so that later timesteps can reuse it.
#[derive(Debug)]
pub struct GuidanceResult {
    pub gradient: Tensor,
    pub target: Option<Tensor>,
}

pub trait GuidanceFunction {
    /// Returns `d loss / d pred_original_sample`. `cached_target` is the
    /// target obtained earlier in the same run, if any.
    fn compute(
        &self,
        sample: &Tensor,
        timestep: usize,
        conditioning: &Conditioning,
        pred_original_sample: &Tensor,
        cached_target: Option<&Tensor>,
    ) -> Result<GuidanceResult>;
}

/// Scoped differentiable evaluation of a scalar loss.
///
/// The context owns a detached copy of the input that requires gradients.
/// Evaluating it consumes the context, so the leaf and the graph built on it
/// are released as soon as the gradient is known.
pub struct GradContext {
    leaf: Tensor,
}

impl GradContext {
    pub fn new(xs: &Tensor) -> Self {
        Self { leaf: xs.detach().set_requires_grad(true) }
    }

    /// Runs `loss_fn` with gradient tracking enabled and returns the gradient
    /// of its result with respect to the leaf. A loss function returning
    /// `None` has no term depending on the leaf, the gradient is then zero.
    pub fn gradient<F>(self, loss_fn: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Option<Tensor>>,
    {
        let Self { leaf } = self;
        tch::with_grad(|| {
            let loss = match loss_fn(&leaf)? {
                Some(loss) => loss,
                None => return Ok(leaf.zeros_like()),
            };
            let mut grads = Tensor::f_run_backward(&[&loss], &[&leaf], false, false)?;
            match grads.pop() {
                Some(grad) => Ok(grad.detach()),
                None => Err(Error::invalid_output("no gradient returned for the guidance loss")),
            }
        })
    }
}

/// Weights of the loss terms, a zero weight disables the term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    /// Squared error between the estimate and the target.
    pub smooth_semantics: f64,
    /// Squared error between the channel means of the estimate and of the
    /// degraded input.
    pub lightness: f64,
    /// Squared error between the per channel mean and std of the estimate and
    /// of the target.
    pub color: f64,
}

impl LossWeights {
    pub fn disabled() -> Self {
        Self { smooth_semantics: 0., lightness: 0., color: 0. }
    }

    pub fn needs_target(&self) -> bool {
        self.smooth_semantics != 0. || self.color != 0.
    }

    pub fn is_disabled(&self) -> bool {
        self.smooth_semantics == 0. && self.lightness == 0. && self.color == 0.
    }
}

fn grayscale(xs: &Tensor) -> Tensor {
    xs.mean_dim(Some([1i64].as_slice()), true, xs.kind())
}

fn channel_stats(xs: &Tensor) -> (Tensor, Tensor) {
    let dims = [2i64, 3].as_slice();
    let mean = xs.mean_dim(Some(dims), true, xs.kind());
    let var = (xs - &mean).square().mean_dim(Some(dims), true, xs.kind());
    (mean, (var + 1e-5).sqrt())
}

fn sum_squared(xs: Tensor) -> Tensor {
    xs.square().sum(xs.kind())
}

/// Guidance built from weighted, independently enabled loss terms. The target
/// comes from the conditioning or from the auxiliary predictor.
pub struct PartialGuidance<'a> {
    restorer: Option<&'a dyn AuxiliaryPredictor>,
    weights: LossWeights,
}

impl<'a> PartialGuidance<'a> {
    pub fn new(restorer: Option<&'a dyn AuxiliaryPredictor>, weights: LossWeights) -> Self {
        Self { restorer, weights }
    }

    fn target(
        &self,
        sample: &Tensor,
        timestep: usize,
        conditioning: &Conditioning,
        cached_target: Option<&Tensor>,
    ) -> Result<Option<Tensor>> {
        if !self.weights.needs_target() {
            return Ok(None);
        }
        if let Some(target) = cached_target.or(conditioning.target.as_ref()) {
            return Ok(Some(target.detach()));
        }
        let restorer = self.restorer.ok_or_else(|| {
            Error::config("guidance needs a target but neither a target nor a restorer is set")
        })?;
        let timesteps =
            Tensor::full([sample.size()[0]], timestep as i64, (Kind::Int64, sample.device()));
        let target = tch::no_grad(|| restorer.restore(&conditioning.degraded, sample, &timesteps))?;
        Ok(Some(target.clamp(-1., 1.).detach()))
    }
}

impl GuidanceFunction for PartialGuidance<'_> {
    fn compute(
        &self,
        sample: &Tensor,
        timestep: usize,
        conditioning: &Conditioning,
        pred_original_sample: &Tensor,
        cached_target: Option<&Tensor>,
    ) -> Result<GuidanceResult> {
        let context = GradContext::new(pred_original_sample);
        let target = self.target(sample, timestep, conditioning, cached_target)?;
        let weights = self.weights;
        let gradient = context.gradient(|xs| {
            let mut total: Option<Tensor> = None;
            let mut add = |term: Tensor| {
                total = Some(match total.take() {
                    Some(acc) => acc + term,
                    None => term,
                })
            };
            if let Some(target) = target.as_ref() {
                if weights.smooth_semantics != 0. {
                    add(sum_squared(target - xs) * weights.smooth_semantics);
                }
                if weights.color != 0. {
                    let (target_mean, target_std) = channel_stats(target);
                    let (mean, std) = channel_stats(xs);
                    add((sum_squared(target_mean - mean) + sum_squared(target_std - std))
                        * weights.color);
                }
            }
            if weights.lightness != 0. {
                let degraded = conditioning.degraded.to_kind(xs.kind());
                add(sum_squared(grayscale(&degraded) - grayscale(xs)) * weights.lightness);
            }
            if let Some(loss) = total.as_ref() {
                tracing::trace!(timestep, loss = loss.double_value(&[]), "guidance loss");
            }
            Ok(total)
        })?;
        let gradient = match conditioning.task.mask() {
            Some(mask) => {
                let known = mask.to_device(gradient.device()).gt(0.);
                gradient.masked_fill(&known, 0.)
            }
            None => gradient,
        };
        Ok(GuidanceResult { gradient, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::{GuidanceParams, GuidanceWindow, Task, TaskKind};
    use std::cell::Cell;
    use tch::kind;

    fn params() -> GuidanceParams {
        GuidanceParams::new(0.1, 1, GuidanceWindow::from_fractions(1.0, 0.0, 10).unwrap()).unwrap()
    }

    fn conditioning(task: Task) -> Conditioning {
        Conditioning::new(Tensor::zeros([1, 3, 4, 4], kind::DOUBLE_CPU), task, params()).unwrap()
    }

    #[test]
    fn gradient_of_squared_error() {
        let xs = Tensor::from_slice(&[1.0f64, 2.0, 3.0]);
        let target = Tensor::from_slice(&[0.0f64, 2.0, 5.0]);
        let grad = GradContext::new(&xs)
            .gradient(|xs| Ok(Some(sum_squared(&target - xs))))
            .unwrap();
        let expected = Tensor::from_slice(&[2.0f64, 0.0, -4.0]);
        assert!(grad.allclose(&expected, 1e-12, 1e-12, false));
        assert!(!grad.requires_grad());
        assert!(!xs.requires_grad());
    }

    #[test]
    fn no_terms_is_a_no_op() {
        let guidance = PartialGuidance::new(None, LossWeights::disabled());
        let cond = conditioning(Task::Restoration);
        let xs = Tensor::ones([1, 3, 4, 4], kind::DOUBLE_CPU);
        let result = guidance.compute(&xs, 5, &cond, &xs, None).unwrap();
        assert_eq!(result.gradient.size(), [1, 3, 4, 4]);
        assert_eq!(result.gradient.abs().sum(Kind::Double).double_value(&[]), 0.);
        assert!(result.target.is_none());
    }

    #[test]
    fn restorer_target_is_clamped_and_returned() {
        let calls = Cell::new(0);
        let restorer = |degraded: &Tensor, _: &Tensor, t: &Tensor| -> Result<Tensor> {
            calls.set(calls.get() + 1);
            assert_eq!(t.int64_value(&[0]), 5);
            Ok(degraded.ones_like() * 3.)
        };
        let weights = LossWeights { smooth_semantics: 1.0, ..LossWeights::disabled() };
        let restorer: &dyn AuxiliaryPredictor = &restorer;
        let guidance = PartialGuidance::new(Some(restorer), weights);
        let cond = conditioning(Task::Restoration);
        let xs = Tensor::zeros([1, 3, 4, 4], kind::DOUBLE_CPU);
        let result = guidance.compute(&xs, 5, &cond, &xs, None).unwrap();
        assert_eq!(calls.get(), 1);
        let target = result.target.unwrap();
        assert_eq!(target.max().double_value(&[]), 1.);
        // d/dx sum (1 - x)^2 = -2 (1 - x)
        assert!(result.gradient.allclose(&(xs.ones_like() * -2.), 1e-12, 1e-12, false));

        // A cached target skips the restorer.
        let result = guidance.compute(&xs, 4, &cond, &xs, Some(&target)).unwrap();
        assert_eq!(calls.get(), 1);
        assert!(result.target.is_some());
    }

    #[test]
    fn missing_target_source_is_an_error() {
        let weights = LossWeights { smooth_semantics: 1.0, ..LossWeights::disabled() };
        let guidance = PartialGuidance::new(None, weights);
        let cond = conditioning(Task::Restoration);
        let xs = Tensor::zeros([1, 3, 4, 4], kind::DOUBLE_CPU);
        assert!(guidance.compute(&xs, 5, &cond, &xs, None).is_err());
    }

    #[test]
    fn masked_pixels_get_no_gradient() {
        let mask = Tensor::zeros([1, 1, 4, 4], kind::DOUBLE_CPU);
        let _ = mask.narrow(2, 0, 2).fill_(1.);
        let task = Task::new(TaskKind::Inpainting, Some(mask.shallow_clone())).unwrap();
        let cond = conditioning(task)
            .with_target(Tensor::ones([1, 3, 4, 4], kind::DOUBLE_CPU))
            .unwrap();
        let guidance = PartialGuidance::new(None, TaskKind::OldPhotoRestoration.default_weights());
        let xs = Tensor::randn([1, 3, 4, 4], kind::DOUBLE_CPU);
        let result = guidance.compute(&xs, 5, &cond, &xs, None).unwrap();
        let known = result.gradient.narrow(2, 0, 2);
        let unknown = result.gradient.narrow(2, 2, 2);
        assert_eq!(known.abs().sum(Kind::Double).double_value(&[]), 0.);
        assert!(unknown.abs().sum(Kind::Double).double_value(&[]) > 0.);
    }

    #[test]
    fn lightness_ignores_color_shifts() {
        let weights = LossWeights { lightness: 1.0, ..LossWeights::disabled() };
        let guidance = PartialGuidance::new(None, weights);
        let cond = conditioning(Task::Colorization);
        // Channels averaging to zero have the same lightness as the gray input.
        let xs = Tensor::from_slice(&[0.5f64, -0.5, 0.0]).view([1, 3, 1, 1]).repeat([1, 1, 4, 4]);
        let result = guidance.compute(&xs, 5, &cond, &xs, None).unwrap();
        assert!(result.gradient.abs().max().double_value(&[]) < 1e-12);
    }
}

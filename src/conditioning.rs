//! Per-image sampling context: the degraded input, the task with its typed
//! payload and the guidance parameters.
//!
//! Everything is validated when the context is built, the sampler only reads
//! it.
use crate::error::{Error, Result};
use crate::guidance::LossWeights;
use tch::Tensor;

/// The kind of restoration, without payload. Used to select a task from the
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Restoration,
    Colorization,
    Inpainting,
    OldPhotoRestoration,
}

impl TaskKind {
    pub fn requires_mask(&self) -> bool {
        matches!(self, Self::Inpainting | Self::OldPhotoRestoration)
    }

    /// Loss weights used when none are configured explicitly.
    pub fn default_weights(&self) -> LossWeights {
        match self {
            Self::Restoration | Self::Inpainting => {
                LossWeights { smooth_semantics: 1.0, ..LossWeights::disabled() }
            }
            Self::Colorization => {
                LossWeights { lightness: 1.0, color: 0.05, ..LossWeights::disabled() }
            }
            Self::OldPhotoRestoration => {
                LossWeights { smooth_semantics: 1.0, lightness: 1.0, color: 0.5 }
            }
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Restoration => "restoration",
            Self::Colorization => "colorization",
            Self::Inpainting => "inpainting",
            Self::OldPhotoRestoration => "old_photo_restoration",
        };
        f.write_str(name)
    }
}

/// A task and the data only that task needs.
///
/// Masks follow the image layout `(B or 1, 1, H, W)`; pixels where the mask
/// is positive are known and are never changed by the guidance gradient.
#[derive(Debug)]
pub enum Task {
    Restoration,
    Colorization,
    Inpainting { mask: Tensor },
    OldPhotoRestoration { mask: Tensor },
}

impl Task {
    /// Builds a task from its kind, checking that a mask is given exactly
    /// when the task uses one.
    pub fn new(kind: TaskKind, mask: Option<Tensor>) -> Result<Self> {
        match (kind, mask) {
            (TaskKind::Restoration, None) => Ok(Self::Restoration),
            (TaskKind::Colorization, None) => Ok(Self::Colorization),
            (TaskKind::Inpainting, Some(mask)) => Ok(Self::Inpainting { mask }),
            (TaskKind::OldPhotoRestoration, Some(mask)) => Ok(Self::OldPhotoRestoration { mask }),
            (kind, Some(_)) => Err(Error::config(format!("task {kind} does not take a mask"))),
            (kind, None) => Err(Error::config(format!("task {kind} requires a mask"))),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Restoration => TaskKind::Restoration,
            Self::Colorization => TaskKind::Colorization,
            Self::Inpainting { .. } => TaskKind::Inpainting,
            Self::OldPhotoRestoration { .. } => TaskKind::OldPhotoRestoration,
        }
    }

    pub fn mask(&self) -> Option<&Tensor> {
        match self {
            Self::Restoration | Self::Colorization => None,
            Self::Inpainting { mask } | Self::OldPhotoRestoration { mask } => Some(mask),
        }
    }
}

/// The inclusive range of timesteps at which guidance is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidanceWindow {
    pub start: usize,
    pub end: usize,
}

impl GuidanceWindow {
    /// Converts fractional bounds into timesteps of a `train_timesteps` long
    /// schedule. Bounds are floored and clamped to the last timestep, so that
    /// `s_start = s_end = 1` only guides `T - 1` and `s_start = s_end = 0`
    /// only guides `0`.
    pub fn from_fractions(s_start: f64, s_end: f64, train_timesteps: usize) -> Result<Self> {
        let in_range = |s: f64| (0. ..=1.).contains(&s);
        if !in_range(s_start) || !in_range(s_end) {
            return Err(Error::config(format!(
                "guidance window bounds must lie in [0, 1], got {s_start} and {s_end}"
            )));
        }
        if s_start < s_end {
            return Err(Error::config(format!(
                "guidance window start {s_start} is below its end {s_end}"
            )));
        }
        if train_timesteps == 0 {
            return Err(Error::config("guidance window over an empty schedule"));
        }
        let last = train_timesteps - 1;
        let to_timestep = |s: f64| ((s * train_timesteps as f64).floor() as usize).min(last);
        Ok(Self { start: to_timestep(s_start), end: to_timestep(s_end) })
    }

    pub fn contains(&self, timestep: usize) -> bool {
        self.end <= timestep && timestep <= self.start
    }
}

/// How strongly and when guidance acts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceParams {
    pub scale: f64,
    /// Gradient steps per guided timestep, at least one.
    pub repetitions: usize,
    pub window: GuidanceWindow,
}

impl GuidanceParams {
    pub fn new(scale: f64, repetitions: usize, window: GuidanceWindow) -> Result<Self> {
        if !scale.is_finite() || scale < 0. {
            return Err(Error::config(format!("invalid guidance scale {scale}")));
        }
        if repetitions == 0 {
            return Err(Error::config("guidance needs at least one repetition"));
        }
        Ok(Self { scale, repetitions, window })
    }

    pub fn is_active(&self, timestep: usize) -> bool {
        self.scale > 0. && self.window.contains(timestep)
    }
}

/// The read-only context of a single sampling run.
#[derive(Debug)]
pub struct Conditioning {
    /// The degraded input, `(B, C, H, W)` in [-1, 1].
    pub degraded: Tensor,
    /// A target supplied up front, reused for the whole run.
    pub target: Option<Tensor>,
    pub class_labels: Option<Tensor>,
    pub task: Task,
    pub guidance: GuidanceParams,
}

impl Conditioning {
    pub fn new(degraded: Tensor, task: Task, guidance: GuidanceParams) -> Result<Self> {
        let size = degraded.size();
        if size.len() != 4 {
            return Err(Error::config(format!("expected a (B, C, H, W) image, got {size:?}")));
        }
        if let Some(mask) = task.mask() {
            let mask_size = mask.size();
            let compatible = mask_size.len() == 4
                && (mask_size[0] == 1 || mask_size[0] == size[0])
                && (mask_size[1] == 1 || mask_size[1] == size[1])
                && mask_size[2..] == size[2..];
            if !compatible {
                return Err(Error::config(format!(
                    "mask of size {mask_size:?} does not match image of size {size:?}"
                )));
            }
        }
        Ok(Self { degraded, target: None, class_labels: None, task, guidance })
    }

    pub fn with_target(mut self, target: Tensor) -> Result<Self> {
        if target.size() != self.degraded.size() {
            return Err(Error::config(format!(
                "target of size {:?} does not match image of size {:?}",
                target.size(),
                self.degraded.size()
            )));
        }
        self.target = Some(target);
        Ok(self)
    }

    pub fn with_class_labels(mut self, class_labels: Tensor) -> Self {
        self.class_labels = Some(class_labels);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind;

    #[test]
    fn window_bounds() {
        let window = GuidanceWindow::from_fractions(1.0, 1.0, 1000).unwrap();
        assert_eq!(window, GuidanceWindow { start: 999, end: 999 });
        assert_eq!((0..1000).filter(|&t| window.contains(t)).count(), 1);

        let window = GuidanceWindow::from_fractions(0.0, 0.0, 1000).unwrap();
        assert_eq!((0..1000).filter(|&t| window.contains(t)).collect::<Vec<_>>(), [0]);

        let window = GuidanceWindow::from_fractions(1.0, 0.7, 1000).unwrap();
        assert_eq!(window, GuidanceWindow { start: 999, end: 700 });
        assert_eq!((0..1000).filter(|&t| window.contains(t)).count(), 300);
    }

    #[test]
    fn malformed_windows() {
        assert!(GuidanceWindow::from_fractions(0.5, 0.7, 1000).is_err());
        assert!(GuidanceWindow::from_fractions(1.5, 0.7, 1000).is_err());
        assert!(GuidanceWindow::from_fractions(1.0, -0.1, 1000).is_err());
        assert!(GuidanceWindow::from_fractions(f64::NAN, 0.0, 1000).is_err());
    }

    #[test]
    fn guidance_params() {
        let window = GuidanceWindow::from_fractions(1.0, 0.5, 10).unwrap();
        assert!(GuidanceParams::new(0.1, 0, window).is_err());
        assert!(GuidanceParams::new(-1., 1, window).is_err());
        let params = GuidanceParams::new(0., 1, window).unwrap();
        assert!(!params.is_active(9));
        let params = GuidanceParams::new(0.1, 1, window).unwrap();
        assert!(params.is_active(9) && params.is_active(5) && !params.is_active(4));
    }

    #[test]
    fn task_payloads() {
        let mask = || Tensor::zeros([1, 1, 8, 8], kind::FLOAT_CPU);
        assert!(Task::new(TaskKind::Restoration, None).is_ok());
        assert!(Task::new(TaskKind::Restoration, Some(mask())).is_err());
        assert!(Task::new(TaskKind::Inpainting, None).is_err());
        let task = Task::new(TaskKind::OldPhotoRestoration, Some(mask())).unwrap();
        assert_eq!(task.kind(), TaskKind::OldPhotoRestoration);
        assert!(task.mask().is_some());
    }

    #[test]
    fn conditioning_shapes() {
        let window = GuidanceWindow::from_fractions(1.0, 0.7, 10).unwrap();
        let params = GuidanceParams::new(0.1, 1, window).unwrap();
        let image = || Tensor::zeros([1, 3, 8, 8], kind::FLOAT_CPU);

        let task = Task::new(TaskKind::Inpainting, Some(Tensor::zeros([1, 1, 4, 4], kind::FLOAT_CPU)))
            .unwrap();
        assert!(Conditioning::new(image(), task, params).is_err());

        let task = Task::new(TaskKind::Inpainting, Some(Tensor::zeros([1, 1, 8, 8], kind::FLOAT_CPU)))
            .unwrap();
        let cond = Conditioning::new(image(), task, params).unwrap();
        assert!(cond.with_target(Tensor::zeros([1, 3, 4, 4], kind::FLOAT_CPU)).is_err());
    }
}

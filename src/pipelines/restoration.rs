use crate::conditioning::{Conditioning, GuidanceParams, GuidanceWindow, Task, TaskKind};
use crate::distributed::{Coordinator, ResultAggregator};
use crate::error::{Error, Result};
use crate::guidance::{GuidanceFunction, LossWeights};
use crate::image::{list_images, load_image, load_mask};
use crate::models::DenoiserModel;
use crate::sampler::{InitialState, RepeatMode, ReverseSampler, SamplerConfig};
use crate::schedulers::ddim::{DDIMScheduler, DDIMSchedulerConfig};
use crate::schedulers::ddpm::{DDPMScheduler, DDPMSchedulerConfig, DDPMVarianceType};
use crate::schedulers::{
    BetaSchedule, DiffusionSchedule, DiffusionScheduleConfig, PredictionType, UpdateRule,
};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// Number of classes of class conditional denoisers.
pub const NUM_CLASSES: i64 = 1000;

#[derive(Clone, Debug)]
pub struct RestorationConfig {
    pub seed: i64,
    pub task: TaskKind,
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    /// Masks, one per input with the same file name, for the mask tasks.
    pub mask_dir: Option<PathBuf>,
    /// Targets, one per input with the same file name, used instead of the
    /// auxiliary predictor.
    pub ref_dir: Option<PathBuf>,
    /// Overrides the task's default loss weights.
    pub loss_weights: Option<LossWeights>,
    pub guidance_scale: f64,
    /// Gradient steps at each guided timestep.
    pub repetitions: usize,
    pub repeat_mode: RepeatMode,
    /// Guidance is applied from `s_start * T` down to `s_end * T`.
    pub s_start: f64,
    pub s_end: f64,
    pub clip_denoised: bool,
    pub num_samples: usize,
    pub batch_size: i64,
    pub use_ddim: bool,
    pub eta: f64,
    pub image_size: i64,
    pub diffusion_steps: usize,
    pub noise_schedule: BetaSchedule,
    /// Number of sampling steps, all the diffusion steps when not set.
    pub timestep_respacing: Option<usize>,
    pub learn_sigma: bool,
    /// Draw a random class label per batch element for the denoiser.
    pub class_cond: bool,
    pub prediction_type: PredictionType,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            seed: 1234,
            task: TaskKind::Restoration,
            in_dir: "testdata".into(),
            out_dir: "results".into(),
            mask_dir: None,
            ref_dir: None,
            loss_weights: None,
            guidance_scale: 0.1,
            repetitions: 1,
            repeat_mode: RepeatMode::Reuse,
            s_start: 1.0,
            s_end: 0.7,
            clip_denoised: true,
            num_samples: 1,
            batch_size: 1,
            use_ddim: false,
            eta: 0.,
            image_size: 512,
            diffusion_steps: 1000,
            noise_schedule: BetaSchedule::Linear,
            timestep_respacing: None,
            learn_sigma: true,
            class_cond: false,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

impl RestorationConfig {
    pub fn loss_weights(&self) -> LossWeights {
        self.loss_weights.unwrap_or_else(|| self.task.default_weights())
    }

    /// Results go to `{out_dir}/s{guidance_scale}-seed{seed}`.
    pub fn output_dir(&self) -> PathBuf {
        self.out_dir.join(format!("s{}-seed{}", self.guidance_scale, self.seed))
    }

    pub fn build_schedule(&self) -> Result<DiffusionSchedule> {
        let config = match self.noise_schedule {
            BetaSchedule::Linear => DiffusionScheduleConfig::linear(self.diffusion_steps),
            BetaSchedule::SquaredcosCapV2 => DiffusionScheduleConfig::cosine(self.diffusion_steps),
            BetaSchedule::ScaledLinear => DiffusionScheduleConfig {
                beta_start: 0.00085,
                beta_end: 0.012,
                beta_schedule: BetaSchedule::ScaledLinear,
                train_timesteps: self.diffusion_steps,
            },
        };
        DiffusionSchedule::new(config)
    }

    pub fn guidance_params(&self) -> Result<GuidanceParams> {
        let window = GuidanceWindow::from_fractions(self.s_start, self.s_end, self.diffusion_steps)?;
        GuidanceParams::new(self.guidance_scale, self.repetitions, window)
    }

    pub fn build_sampler(&self) -> Result<ReverseSampler> {
        let schedule = self.build_schedule()?;
        let steps = self.timestep_respacing.unwrap_or(self.diffusion_steps);
        let rule = if self.use_ddim {
            let config = DDIMSchedulerConfig { eta: self.eta };
            UpdateRule::Deterministic(DDIMScheduler::new(schedule, steps, config)?)
        } else {
            let variance_type = if self.learn_sigma {
                DDPMVarianceType::LearnedRange
            } else {
                DDPMVarianceType::FixedLarge
            };
            let config = DDPMSchedulerConfig { variance_type };
            UpdateRule::Ancestral(DDPMScheduler::new(schedule, steps, config)?)
        };
        let config = SamplerConfig {
            prediction_type: self.prediction_type,
            clip_denoised: self.clip_denoised,
            repeat_mode: self.repeat_mode,
        };
        Ok(ReverseSampler::new(rule, config))
    }

    /// Checks the options that do not depend on the models.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 1 || self.num_samples < 1 || self.image_size < 1 {
            return Err(Error::config("batch size, sample count and image size must be positive"));
        }
        if self.task.requires_mask() && self.mask_dir.is_none() {
            return Err(Error::config(format!("task {} requires a mask directory", self.task)));
        }
        self.guidance_params()?;
        Ok(())
    }
}

/// Restores every image of the input directory, in file name order.
pub struct RestorationPipeline<'a> {
    pub config: RestorationConfig,
    sampler: ReverseSampler,
    denoiser: &'a dyn DenoiserModel,
    guidance: Option<&'a dyn GuidanceFunction>,
    coordinator: &'a dyn Coordinator,
    device: Device,
}

impl<'a> RestorationPipeline<'a> {
    pub fn new(
        config: RestorationConfig,
        denoiser: &'a dyn DenoiserModel,
        guidance: Option<&'a dyn GuidanceFunction>,
        coordinator: &'a dyn Coordinator,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let sampler = config.build_sampler()?;
        Ok(Self { config, sampler, denoiser, guidance, coordinator, device })
    }

    pub fn sampler(&self) -> &ReverseSampler {
        &self.sampler
    }

    fn conditioning(&self, path: &Path) -> Result<Conditioning> {
        let config = &self.config;
        let size = config.image_size;
        let batch = |xs: Tensor| xs.repeat([config.batch_size, 1, 1, 1]).to_device(self.device);
        let degraded = batch(load_image(path, size)?);
        let filename = path.file_name().unwrap_or_default();
        let mask = match (config.task.requires_mask(), &config.mask_dir) {
            (true, Some(dir)) => Some(load_mask(dir.join(filename), size)?.to_device(self.device)),
            _ => None,
        };
        let task = Task::new(config.task, mask)?;
        let conditioning = Conditioning::new(degraded, task, config.guidance_params()?)?;
        match &config.ref_dir {
            Some(dir) => conditioning.with_target(batch(load_image(dir.join(filename), size)?)),
            None => Ok(conditioning),
        }
    }

    /// Runs the whole directory and returns the written files.
    pub fn run(&self) -> Result<Vec<PathBuf>> {
        let config = &self.config;
        let mut inputs = vec![];
        for path in list_images(&config.in_dir)? {
            match path.file_name().and_then(|f| f.to_str()) {
                Some(filename) => inputs.push((filename.to_string(), path)),
                None => {
                    return Err(Error::config(format!(
                        "input file name {:?} is not valid unicode",
                        path.to_string_lossy()
                    )))
                }
            }
        }
        let out_dir = config.output_dir();
        std::fs::create_dir_all(&out_dir)?;
        tracing::info!(
            inputs = inputs.len(),
            task = %config.task,
            steps = self.sampler.timesteps().len(),
            deterministic = self.sampler.rule().is_deterministic(),
            rank = self.coordinator.rank(),
            world_size = self.coordinator.world_size(),
            "sampling to {:?}",
            out_dir
        );

        let mut aggregator = ResultAggregator::new(self.coordinator, &out_dir);
        let mut written = vec![];
        for (filename, path) in inputs.iter() {
            let filename = filename.as_str();
            let mut conditioning = self.conditioning(path)?;
            for idx in 0..config.num_samples {
                tch::manual_seed(config.seed + idx as i64);
                if config.class_cond {
                    let labels =
                        Tensor::randint(NUM_CLASSES, [config.batch_size], (Kind::Int64, self.device));
                    conditioning.class_labels = Some(labels);
                }
                let output = self.sampler.sample(
                    self.denoiser,
                    self.guidance,
                    &conditioning,
                    InitialState::Noise,
                )?;
                tracing::debug!(
                    filename,
                    steps = output.steps,
                    guided = output.guided_timesteps.len(),
                    "sampled"
                );
                written.extend(aggregator.persist(&output.sample, filename)?);
            }
        }
        aggregator.finish()?;
        tracing::info!("sampling complete");
        Ok(written)
    }
}

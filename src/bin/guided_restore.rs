// Restores a directory of degraded face images with a pretrained diffusion
// model, guiding every reverse step towards the output of an auxiliary
// restoration network.
//
// Both networks are loaded as TorchScript modules. From python:
//
//   import torch
//   model = create_model(...)  # the 512x512 FFHQ denoiser
//   model.load_state_dict(torch.load("models/FFHQ512.pth"))
//   torch.jit.script(model).save("models/FFHQ512.pt")
//
// and the same for the restorer, saved as models/restorer/RRDB.pt. The
// restorer is called as `restorer(sample, degraded, timesteps)`.
//
// Parameters can also be given separately with --model-weights and
// --restorer-weights, in .ot or .safetensors format. A `module.` prefix left
// by data parallel training is stripped.
use anyhow::Context;
use clap::Parser;
use guided_diffusion::{
    conditioning::TaskKind,
    distributed::SingleProcess,
    guidance::{GuidanceFunction, LossWeights, PartialGuidance},
    models::{
        torchscript::{TorchScriptDenoiser, TorchScriptRestorer},
        AuxiliaryPredictor,
    },
    pipelines::{RestorationConfig, RestorationPipeline},
    sampler::RepeatMode,
    schedulers::BetaSchedule,
    utils::DeviceSetup,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The restoration task.
    #[arg(long, value_enum, default_value = "restoration")]
    task: Task,

    /// The directory holding the degraded images.
    #[arg(long, default_value = "testdata")]
    in_dir: String,

    /// Results are written to `{out_dir}/s{guidance_scale}-seed{seed}`.
    #[arg(long, default_value = "results")]
    out_dir: String,

    /// Masks for inpainting and old photo restoration, with the same file names as
    /// the inputs. Bright pixels are known and kept.
    #[arg(long)]
    mask_dir: Option<String>,

    /// Reference images used as guidance targets instead of the restorer output.
    #[arg(long)]
    ref_dir: Option<String>,

    /// The scripted denoiser.
    #[arg(long, value_name = "FILE", default_value = "models/FFHQ512.pt")]
    model_path: String,

    /// Parameters for the denoiser, in .ot or .safetensors format.
    #[arg(long, value_name = "FILE")]
    model_weights: Option<String>,

    /// The scripted restorer.
    #[arg(long, value_name = "FILE", default_value = "models/restorer/RRDB.pt")]
    restorer_path: String,

    /// Parameters for the restorer, in .ot or .safetensors format.
    #[arg(long, value_name = "FILE")]
    restorer_weights: Option<String>,

    /// When set, use the CPU for the listed models, can be 'all', 'denoiser' or 'restorer'.
    #[arg(long)]
    cpu: Vec<String>,

    /// The random seed, sample `idx` of every image uses `seed + idx`.
    #[arg(long, default_value_t = 1234)]
    seed: i64,

    #[arg(long, default_value_t = 0.1)]
    guidance_scale: f64,

    /// The number of gradient steps at each guided timestep.
    #[arg(long, default_value_t = 1)]
    repetitions: usize,

    /// Query the denoiser again between gradient steps.
    #[arg(long)]
    requery: bool,

    /// Guidance starts at `s_start * T` and stops at `s_end * T`.
    #[arg(long, default_value_t = 1.0)]
    s_start: f64,

    #[arg(long, default_value_t = 0.7)]
    s_end: f64,

    /// Overrides the smooth semantics weight of the task.
    #[arg(long)]
    ss_weight: Option<f64>,

    /// Overrides the lightness weight of the task.
    #[arg(long)]
    lightness_weight: Option<f64>,

    /// Overrides the color statistics weight of the task.
    #[arg(long)]
    color_weight: Option<f64>,

    /// The number of samples for every input image.
    #[arg(long, default_value_t = 1)]
    num_samples: usize,

    #[arg(long, default_value_t = 1)]
    batch_size: i64,

    #[arg(long, default_value_t = 512)]
    image_size: i64,

    #[arg(long, default_value_t = 1000)]
    diffusion_steps: usize,

    #[arg(long, value_enum, default_value = "linear")]
    noise_schedule: NoiseSchedule,

    /// The number of sampling steps, defaults to all the diffusion steps.
    #[arg(long)]
    timestep_respacing: Option<usize>,

    /// Use the deterministic update rule.
    #[arg(long)]
    use_ddim: bool,

    #[arg(long, default_value_t = 0.)]
    eta: f64,

    /// Do not clamp the clean estimates to [-1, 1].
    #[arg(long)]
    no_clip_denoised: bool,

    /// Set when the denoiser does not predict its variance.
    #[arg(long)]
    fixed_sigma: bool,

    /// Set for class conditional denoisers, the class labels are then random.
    #[arg(long)]
    class_cond: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Task {
    Restoration,
    Colorization,
    Inpainting,
    OldPhoto,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum NoiseSchedule {
    Linear,
    Cosine,
}

impl Args {
    fn loss_weights(&self, task: TaskKind) -> Option<LossWeights> {
        if self.ss_weight.is_none() && self.lightness_weight.is_none() && self.color_weight.is_none()
        {
            return None;
        }
        let defaults = task.default_weights();
        Some(LossWeights {
            smooth_semantics: self.ss_weight.unwrap_or(defaults.smooth_semantics),
            lightness: self.lightness_weight.unwrap_or(defaults.lightness),
            color: self.color_weight.unwrap_or(defaults.color),
        })
    }

    fn config(&self) -> RestorationConfig {
        let task = match self.task {
            Task::Restoration => TaskKind::Restoration,
            Task::Colorization => TaskKind::Colorization,
            Task::Inpainting => TaskKind::Inpainting,
            Task::OldPhoto => TaskKind::OldPhotoRestoration,
        };
        let noise_schedule = match self.noise_schedule {
            NoiseSchedule::Linear => BetaSchedule::Linear,
            NoiseSchedule::Cosine => BetaSchedule::SquaredcosCapV2,
        };
        let repeat_mode = if self.requery { RepeatMode::Requery } else { RepeatMode::Reuse };
        RestorationConfig {
            seed: self.seed,
            task,
            in_dir: self.in_dir.clone().into(),
            out_dir: self.out_dir.clone().into(),
            mask_dir: self.mask_dir.clone().map(Into::into),
            ref_dir: self.ref_dir.clone().map(Into::into),
            loss_weights: self.loss_weights(task),
            guidance_scale: self.guidance_scale,
            repetitions: self.repetitions,
            repeat_mode,
            s_start: self.s_start,
            s_end: self.s_end,
            clip_denoised: !self.no_clip_denoised,
            num_samples: self.num_samples,
            batch_size: self.batch_size,
            use_ddim: self.use_ddim,
            eta: self.eta,
            image_size: self.image_size,
            diffusion_steps: self.diffusion_steps,
            noise_schedule,
            timestep_respacing: self.timestep_respacing,
            learn_sigma: !self.fixed_sigma,
            class_cond: self.class_cond,
            ..Default::default()
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = args.config();
    config.validate()?;
    let Args { model_path, model_weights, restorer_path, restorer_weights, cpu, class_cond, .. } =
        args;

    tch::maybe_init_cuda();
    tracing::info!(
        cuda = tch::Cuda::is_available(),
        cudnn = tch::Cuda::cudnn_is_available(),
        "devices"
    );
    let device_setup = DeviceSetup::new(cpu);
    let denoiser_device = device_setup.get("denoiser");

    tracing::info!("loading the denoiser from {model_path}");
    let denoiser =
        TorchScriptDenoiser::load(model_path.clone(), model_weights, denoiser_device, class_cond)
            .with_context(|| format!("cannot load the denoiser {model_path}"))?;

    let weights = config.loss_weights();
    let restorer = if weights.needs_target() && config.ref_dir.is_none() {
        tracing::info!("loading the restorer from {restorer_path}");
        let restorer = TorchScriptRestorer::load(
            restorer_path.clone(),
            restorer_weights,
            device_setup.get("restorer"),
        )
        .with_context(|| format!("cannot load the restorer {restorer_path}"))?;
        Some(restorer)
    } else {
        None
    };
    let restorer = restorer.as_ref().map(|r| r as &dyn AuxiliaryPredictor);
    let guidance = PartialGuidance::new(restorer, weights);
    let guidance = if weights.is_disabled() {
        tracing::warn!("every loss term is disabled, sampling without guidance");
        None
    } else {
        Some(&guidance as &dyn GuidanceFunction)
    };

    let pipeline =
        RestorationPipeline::new(config, &denoiser, guidance, &SingleProcess, denoiser_device)?;
    let written = pipeline.run()?;
    tracing::info!("wrote {} images", written.len());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    run(args)
}

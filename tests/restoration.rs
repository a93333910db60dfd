use guided_diffusion::{
    conditioning::{Conditioning, TaskKind},
    distributed::SingleProcess,
    guidance::{GuidanceFunction, GuidanceResult, PartialGuidance},
    models::AuxiliaryPredictor,
    pipelines::{RestorationConfig, RestorationPipeline},
    Error, Result,
};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

const SIZE: i64 = 8;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("guided-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_images(dir: &Path, names: &[&str], fill: i64) {
    for name in names {
        let image = Tensor::full([3, SIZE, SIZE], fill, (Kind::Uint8, Device::Cpu));
        tch::vision::image::save(&image, dir.join(name)).unwrap();
    }
}

fn config(root: &Path) -> RestorationConfig {
    RestorationConfig {
        in_dir: root.join("inputs"),
        out_dir: root.join("results"),
        image_size: SIZE,
        diffusion_steps: 100,
        learn_sigma: false,
        ..Default::default()
    }
}

#[test]
fn restores_every_input() {
    let root = temp_dir("pipeline");
    std::fs::create_dir_all(root.join("inputs")).unwrap();
    write_images(&root.join("inputs"), &["b.png", "a.png"], 100);

    let model_calls = Cell::new(0);
    let denoiser = |xs: &Tensor, _: &Tensor, _: Option<&Tensor>| -> Result<Tensor> {
        model_calls.set(model_calls.get() + 1);
        Ok(xs.zeros_like())
    };
    let restorer_calls = Cell::new(0);
    let restorer = |degraded: &Tensor, _: &Tensor, _: &Tensor| -> Result<Tensor> {
        restorer_calls.set(restorer_calls.get() + 1);
        Ok(degraded.shallow_clone())
    };
    let restorer: &dyn AuxiliaryPredictor = &restorer;
    let config = config(&root);
    let guidance = PartialGuidance::new(Some(restorer), config.loss_weights());
    let guidance: &dyn GuidanceFunction = &guidance;

    let pipeline =
        RestorationPipeline::new(config, &denoiser, Some(guidance), &SingleProcess, Device::Cpu)
            .unwrap();
    assert_eq!(pipeline.sampler().timesteps().len(), 100);
    let written = pipeline.run().unwrap();

    let out_dir = root.join("results").join("s0.1-seed1234");
    assert_eq!(written, [out_dir.join("a.png"), out_dir.join("b.png")]);
    assert_eq!(model_calls.get(), 200);
    assert_eq!(restorer_calls.get(), 2);
    for path in written.iter() {
        let image = tch::vision::image::load(path).unwrap();
        assert_eq!(image.size(), [3, SIZE, SIZE]);
        assert_eq!(image.kind(), Kind::Uint8);
    }
    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn several_samples_get_indexed_names() {
    let root = temp_dir("samples");
    std::fs::create_dir_all(root.join("inputs")).unwrap();
    write_images(&root.join("inputs"), &["face.png"], 200);

    let denoiser = |xs: &Tensor, _: &Tensor, _: Option<&Tensor>| -> Result<Tensor> {
        Ok(xs.zeros_like())
    };
    let config = RestorationConfig {
        num_samples: 2,
        timestep_respacing: Some(10),
        use_ddim: true,
        ..config(&root)
    };
    let pipeline =
        RestorationPipeline::new(config, &denoiser, None, &SingleProcess, Device::Cpu).unwrap();
    let written = pipeline.run().unwrap();
    let names: Vec<_> =
        written.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect();
    assert_eq!(names, ["face.png", "face.2.png"]);
    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn samples_and_batches_get_distinct_names() {
    let root = temp_dir("batches");
    std::fs::create_dir_all(root.join("inputs")).unwrap();
    write_images(&root.join("inputs"), &["face.png"], 50);

    let denoiser = |xs: &Tensor, _: &Tensor, _: Option<&Tensor>| -> Result<Tensor> {
        Ok(xs.zeros_like())
    };
    let config = RestorationConfig {
        num_samples: 2,
        batch_size: 2,
        timestep_respacing: Some(5),
        use_ddim: true,
        ..config(&root)
    };
    let pipeline =
        RestorationPipeline::new(config, &denoiser, None, &SingleProcess, Device::Cpu).unwrap();
    let written = pipeline.run().unwrap();
    let names: Vec<_> =
        written.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect();
    assert_eq!(names, ["face.png", "face.2.png", "face.3.png", "face.4.png"]);
    assert!(written.iter().all(|p| p.is_file()));
    std::fs::remove_dir_all(&root).unwrap();
}

#[cfg(unix)]
#[test]
fn non_unicode_input_names_are_rejected() {
    use std::os::unix::ffi::OsStrExt;
    let root = temp_dir("unicode");
    let inputs = root.join("inputs");
    std::fs::create_dir_all(&inputs).unwrap();
    write_images(&inputs, &["a.png"], 10);
    std::fs::write(inputs.join(std::ffi::OsStr::from_bytes(b"\xff.png")), b"").unwrap();

    let calls = Cell::new(0);
    let denoiser = |xs: &Tensor, _: &Tensor, _: Option<&Tensor>| -> Result<Tensor> {
        calls.set(calls.get() + 1);
        Ok(xs.zeros_like())
    };
    let pipeline =
        RestorationPipeline::new(config(&root), &denoiser, None, &SingleProcess, Device::Cpu)
            .unwrap();
    assert!(matches!(pipeline.run(), Err(Error::Configuration(_))));
    assert_eq!(calls.get(), 0);
    std::fs::remove_dir_all(&root).unwrap();
}

/// Counts its calls and leaves the estimate unchanged.
#[derive(Default)]
struct CountingGuidance {
    calls: Cell<usize>,
}

impl GuidanceFunction for CountingGuidance {
    fn compute(
        &self,
        _: &Tensor,
        _: usize,
        _: &Conditioning,
        pred_original_sample: &Tensor,
        _: Option<&Tensor>,
    ) -> Result<GuidanceResult> {
        self.calls.set(self.calls.get() + 1);
        Ok(GuidanceResult { gradient: pred_original_sample.zeros_like(), target: None })
    }
}

#[test]
fn full_schedule_is_guided_on_its_first_three_tenths() {
    let root = temp_dir("full");
    std::fs::create_dir_all(root.join("inputs")).unwrap();
    write_images(&root.join("inputs"), &["x.png", "y.png"], 180);

    let denoiser = |xs: &Tensor, _: &Tensor, _: Option<&Tensor>| -> Result<Tensor> {
        Ok(xs * 0.1)
    };
    let run = |out: &str, guidance: &CountingGuidance| {
        let config = RestorationConfig {
            diffusion_steps: 1000,
            use_ddim: true,
            out_dir: root.join(out),
            ..config(&root)
        };
        let pipeline = RestorationPipeline::new(
            config,
            &denoiser,
            Some(guidance as &dyn GuidanceFunction),
            &SingleProcess,
            Device::Cpu,
        )
        .unwrap();
        assert_eq!(pipeline.sampler().timesteps().len(), 1000);
        pipeline.run().unwrap()
    };

    let guidance = CountingGuidance::default();
    let first = run("first", &guidance);
    assert_eq!(guidance.calls.get(), 2 * 300);
    let second = run("second", &CountingGuidance::default());

    let names = |written: &[PathBuf]| -> Vec<String> {
        written.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect()
    };
    assert_eq!(names(&first), ["x.png", "y.png"]);
    assert_eq!(names(&second), ["x.png", "y.png"]);
    for (a, b) in first.iter().zip(second.iter()) {
        let image = tch::vision::image::load(a).unwrap();
        assert_eq!(image.size(), [3, SIZE, SIZE]);
        assert_eq!(image.kind(), Kind::Uint8);
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }
    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn masked_tasks_need_masks() {
    let root = temp_dir("masks");
    let config = RestorationConfig { task: TaskKind::Inpainting, ..config(&root) };
    assert!(config.validate().is_err());
    let config = RestorationConfig { mask_dir: Some(root.join("masks")), ..config };
    assert!(config.validate().is_ok());
    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn output_directory_and_weights() {
    let config = RestorationConfig::default();
    assert_eq!(config.output_dir(), Path::new("results").join("s0.1-seed1234"));
    assert_eq!(config.loss_weights(), TaskKind::Restoration.default_weights());
    let config = RestorationConfig { s_start: 0.5, s_end: 0.7, ..config };
    assert!(config.validate().is_err());
}

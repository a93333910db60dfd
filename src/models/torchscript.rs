//! Models exported with TorchScript.
//!
//! The denoiser is called as `module(x, t)` or `module(x, t, y)` for class
//! conditional models, the restorer as `module(x, y_t, t)`. Parameters can be
//! replaced from a separate state file, in which case the stored names are
//! matched against the module's own parameter names.
use super::{weights, AuxiliaryPredictor, DenoiserModel};
use crate::error::Result;
use crate::utils::ensure_file;
use std::path::Path;
use tch::{CModule, Device, Tensor};

fn load_module(path: &Path, device: Device) -> Result<CModule> {
    ensure_file(path)?;
    let mut module = CModule::load_on_device(path, device)?;
    module.set_eval();
    Ok(module)
}

fn load_state(
    module: &CModule,
    path: &Path,
    device: Device,
    strict: bool,
) -> Result<weights::LoadReport> {
    let stored = weights::read_named_tensors(path, device)?;
    let stored = weights::strip_prefix(stored, weights::DATA_PARALLEL_PREFIX);
    let report = weights::copy_named(&module.named_parameters()?, stored, strict)?;
    tracing::debug!(
        loaded = report.loaded,
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "loaded {:?}",
        path
    );
    Ok(report)
}

pub struct TorchScriptDenoiser {
    module: CModule,
    class_cond: bool,
}

impl TorchScriptDenoiser {
    /// Loads a scripted denoiser. When `state` is given every parameter of
    /// the module has to be found there.
    pub fn load<P: AsRef<Path>>(
        path: P,
        state: Option<P>,
        device: Device,
        class_cond: bool,
    ) -> Result<Self> {
        let module = load_module(path.as_ref(), device)?;
        if let Some(state) = state {
            load_state(&module, state.as_ref(), device, true)?;
        }
        Ok(Self { module, class_cond })
    }
}

impl DenoiserModel for TorchScriptDenoiser {
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        class_labels: Option<&Tensor>,
    ) -> Result<Tensor> {
        let ys = match (self.class_cond, class_labels) {
            (true, Some(labels)) => self.module.forward_ts(&[xs, timesteps, labels])?,
            _ => self.module.forward_ts(&[xs, timesteps])?,
        };
        Ok(ys)
    }
}

pub struct TorchScriptRestorer {
    module: CModule,
}

impl TorchScriptRestorer {
    /// Loads a scripted restorer. Parameters from `state` are copied when the
    /// names match, the others are skipped.
    pub fn load<P: AsRef<Path>>(path: P, state: Option<P>, device: Device) -> Result<Self> {
        let module = load_module(path.as_ref(), device)?;
        if let Some(state) = state {
            load_state(&module, state.as_ref(), device, false)?;
        }
        Ok(Self { module })
    }
}

impl AuxiliaryPredictor for TorchScriptRestorer {
    fn restore(&self, degraded: &Tensor, sample: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        Ok(self.module.forward_ts(&[sample, degraded, timesteps])?)
    }
}

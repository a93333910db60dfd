// A simple wrapper around File::open adding details about the
// problematic file.
use crate::error::{Error, Result};
use std::path::Path;
use tch::{Device, Kind, Tensor};

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Checks that a file exists before handing it to libtorch, whose own error
/// messages do not mention the path.
pub(crate) fn ensure_file<P: AsRef<Path>>(path: P) -> Result<()> {
    file_open(path.as_ref()).map(|_| ()).map_err(|e| Error::config(format!("{e:#}")))
}

/// Returns an error naming the timestep if `xs` holds a NaN or an infinity.
pub(crate) fn ensure_finite(xs: &Tensor, timestep: usize, what: &'static str) -> Result<()> {
    let finite = xs.f_isfinite()?.f_all()?.f_to_kind(Kind::Int64)?.f_int64_value(&[])?;
    if finite == 1 {
        Ok(())
    } else {
        Err(Error::NumericalInstability { timestep, what })
    }
}

pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    /// The device for a named component, e.g. `denoiser` or `restorer`.
    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_check() {
        let xs = Tensor::from_slice(&[0.5f32, -1.0, 2.0]);
        assert!(ensure_finite(&xs, 3, "sample").is_ok());
        let xs = Tensor::from_slice(&[0.5f32, f32::NAN, 2.0]);
        match ensure_finite(&xs, 7, "sample") {
            Err(Error::NumericalInstability { timestep, what }) => {
                assert_eq!(timestep, 7);
                assert_eq!(what, "sample");
            }
            other => panic!("unexpected {other:?}"),
        }
        let xs = Tensor::from_slice(&[f64::INFINITY]);
        assert!(ensure_finite(&xs, 0, "gradient").is_err());
    }

    #[test]
    fn cpu_override() {
        let setup = DeviceSetup::new(vec!["restorer".to_string()]);
        assert_eq!(setup.get("restorer"), Device::Cpu);
        let setup = DeviceSetup::new(vec!["all".to_string()]);
        assert_eq!(setup.get("denoiser"), Device::Cpu);
    }
}

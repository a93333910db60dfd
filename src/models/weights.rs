//! Loading of stored parameters into an already built module.
//!
//! Checkpoints saved from a data-parallel training wrapper carry a `module.`
//! prefix on every name, it has to go before the names can be matched
//! against a single process model.
use crate::error::{Error, Result};
use crate::utils::ensure_file;
use std::collections::HashMap;
use std::path::Path;
use tch::{Device, Tensor};

/// The prefix added by distributed data-parallel wrappers.
pub const DATA_PARALLEL_PREFIX: &str = "module.";

/// Reads named tensors from a `.safetensors` file or from the tch `.ot`
/// format (any other extension).
pub fn read_named_tensors<P: AsRef<Path>>(path: P, device: Device) -> Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    ensure_file(path)?;
    let named = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?
            .into_iter()
            .map(|(name, tensor)| (name, tensor.to_device(device)))
            .collect(),
        _ => Tensor::load_multi_with_device(path, device)?,
    };
    Ok(named)
}

/// Removes `prefix` from the names carrying it, other names are untouched.
pub fn strip_prefix(named: Vec<(String, Tensor)>, prefix: &str) -> Vec<(String, Tensor)> {
    named
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix(prefix) {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (name, tensor),
        })
        .collect()
}

/// What happened when copying stored tensors into a module.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Copies `stored` into the `targets` parameters, matching by name.
///
/// In strict mode missing and unexpected names are errors, otherwise they are
/// reported and skipped. A shape mismatch is always an error.
pub fn copy_named(
    targets: &[(String, Tensor)],
    stored: Vec<(String, Tensor)>,
    strict: bool,
) -> Result<LoadReport> {
    let mut stored: HashMap<String, Tensor> = stored.into_iter().collect();
    let mut report = LoadReport::default();
    for (name, target) in targets.iter() {
        let src = match stored.remove(name) {
            Some(src) => src,
            None => {
                report.missing.push(name.clone());
                continue;
            }
        };
        if src.size() != target.size() {
            return Err(Error::ModelLoad(format!(
                "shape mismatch for {name}: stored {:?}, expected {:?}",
                src.size(),
                target.size()
            )));
        }
        let mut target = target.shallow_clone();
        tch::no_grad(|| target.f_copy_(&src))?;
        report.loaded += 1;
    }
    report.unexpected = stored.into_keys().collect();
    report.unexpected.sort();
    if strict && !(report.missing.is_empty() && report.unexpected.is_empty()) {
        return Err(Error::ModelLoad(format!(
            "missing parameters {:?}, unexpected parameters {:?}",
            report.missing, report.unexpected
        )));
    }
    Ok(report)
}

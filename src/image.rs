//! Conversions between image files and the `[-1, 1]` working range of the
//! sampler.
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};

/// Lists the files of `dir` sorted by file name. The processing order of a
/// run follows this order.
pub fn list_images<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::config(format!("cannot read input directory {:?}: {e}", dir.to_string_lossy()))
    })?;
    let mut files = vec![];
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            files.push(path)
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Maps a `(C, H, W)` uint8 image to a `(1, C, H, W)` float tensor in [-1, 1].
pub fn encode(image: &Tensor) -> Tensor {
    (image.to_kind(Kind::Float) / 127.5 - 1.).unsqueeze(0)
}

/// Maps samples in [-1, 1] back to uint8 pixels, clamping out of range
/// values.
pub fn decode(sample: &Tensor) -> Tensor {
    ((sample + 1.) * 127.5).clamp(0., 255.).to_kind(Kind::Uint8)
}

/// Loads an RGB image resized to `size x size`, in the working range.
pub fn load_image<P: AsRef<Path>>(path: P, size: i64) -> Result<Tensor> {
    let image = tch::vision::image::load(path)?;
    let image = tch::vision::image::resize(&image, size, size)?;
    Ok(encode(&image))
}

/// Loads a mask as a `(1, 1, size, size)` float tensor, 1 where the pixel
/// is bright and 0 elsewhere.
pub fn load_mask<P: AsRef<Path>>(path: P, size: i64) -> Result<Tensor> {
    let mask = tch::vision::image::load(path)?;
    let mask = tch::vision::image::resize(&mask, size, size)?;
    let mask = mask.to_kind(Kind::Float).mean_dim(Some([0i64].as_slice()), true, Kind::Float);
    Ok(mask.ge(127.5).to_kind(Kind::Float).unsqueeze(0))
}

/// Saves a `(C, H, W)` uint8 image.
pub fn save_image<P: AsRef<Path>>(image: &Tensor, path: P) -> Result<()> {
    tch::vision::image::save(image, path)?;
    Ok(())
}

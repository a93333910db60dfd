//! Coordination between processes sampling disjoint shards, and the
//! aggregation of their results into image files.
//!
//! Process groups are not set up here: a [`Coordinator`] is handed in by the
//! caller. [`SingleProcess`] covers the common single process case.
use crate::error::Result;
use crate::image::{decode, save_image};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::Tensor;

pub trait Coordinator {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Blocks until every process reached the barrier.
    fn barrier(&self) -> Result<()>;
    /// Returns the tensors of all processes, ordered by rank.
    fn all_gather(&self, xs: &Tensor) -> Result<Vec<Tensor>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Coordinator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![xs.shallow_clone()])
    }
}

/// `name.ext` for the first image, `name.{idx + 1}.ext` for the others.
pub fn indexed_filename(filename: &str, idx: usize) -> String {
    if idx == 0 {
        return filename.to_string();
    }
    match filename.rsplit_once('.') {
        None => format!("{}.{}.png", filename, idx + 1),
        Some((filename_no_extension, extension)) => {
            format!("{}.{}.{}", filename_no_extension, idx + 1, extension)
        }
    }
}

pub struct ResultAggregator<'a> {
    coordinator: &'a dyn Coordinator,
    out_dir: PathBuf,
    created: usize,
    /// Images written so far for each input file name.
    per_filename: HashMap<String, usize>,
}

impl<'a> ResultAggregator<'a> {
    pub fn new<P: AsRef<Path>>(coordinator: &'a dyn Coordinator, out_dir: P) -> Self {
        Self {
            coordinator,
            out_dir: out_dir.as_ref().to_path_buf(),
            created: 0,
            per_filename: HashMap::new(),
        }
    }

    /// Number of images gathered so far, over all processes.
    pub fn created(&self) -> usize {
        self.created
    }

    /// Converts a batch of samples to uint8 and concatenates the batches of
    /// all processes in rank order.
    pub fn gather(&mut self, samples: &Tensor) -> Result<Tensor> {
        let images = decode(samples).to_device(tch::Device::Cpu).contiguous();
        let gathered = self.coordinator.all_gather(&images)?;
        let gathered = Tensor::cat(gathered.as_slice(), 0);
        self.created += gathered.size()[0] as usize;
        Ok(gathered)
    }

    /// Gathers `samples` and writes them under `filename`. Only the first
    /// process writes. The first image of a file name keeps it, the following
    /// ones, from this call or later calls with the same name, get an index.
    pub fn persist(&mut self, samples: &Tensor, filename: &str) -> Result<Vec<PathBuf>> {
        let gathered = self.gather(samples)?;
        tracing::info!("created {} samples", self.created);
        let count = gathered.size()[0];
        let first = self.per_filename.entry(filename.to_string()).or_default();
        let start = *first;
        *first += count as usize;
        if self.coordinator.rank() != 0 {
            return Ok(vec![]);
        }
        let mut written = vec![];
        for idx in 0..count {
            let path = self.out_dir.join(indexed_filename(filename, start + idx as usize));
            save_image(&gathered.get(idx), &path)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Waits for the other processes to be done.
    pub fn finish(&self) -> Result<()> {
        self.coordinator.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind;

    /// Pretends to be `world_size` processes that all produced a shifted
    /// copy of the local tensor.
    struct FakeGroup {
        world_size: usize,
    }

    impl Coordinator for FakeGroup {
        fn rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            self.world_size
        }

        fn barrier(&self) -> Result<()> {
            Ok(())
        }

        fn all_gather(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
            Ok((0..self.world_size).map(|rank| xs + rank as i64).collect())
        }
    }

    #[test]
    fn filenames() {
        assert_eq!(indexed_filename("face.png", 0), "face.png");
        assert_eq!(indexed_filename("face.png", 1), "face.2.png");
        assert_eq!(indexed_filename("face", 2), "face.3.png");
    }

    #[test]
    fn gather_is_rank_ordered() {
        let group = FakeGroup { world_size: 3 };
        let mut aggregator = ResultAggregator::new(&group, std::env::temp_dir());
        let samples = Tensor::full([1, 3, 2, 2], -1., kind::FLOAT_CPU);
        let gathered = aggregator.gather(&samples).unwrap();
        assert_eq!(gathered.size(), [3, 3, 2, 2]);
        assert_eq!(gathered.kind(), tch::Kind::Uint8);
        let firsts: Vec<i64> = (0..3).map(|i| gathered.int64_value(&[i, 0, 0, 0])).collect();
        assert_eq!(firsts, [0, 1, 2]);
        assert_eq!(aggregator.created(), 3);
    }

    #[test]
    fn single_process_persist() {
        let dir = std::env::temp_dir().join(format!("guided-persist-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut aggregator = ResultAggregator::new(&SingleProcess, &dir);
        let samples = Tensor::zeros([2, 3, 4, 4], kind::FLOAT_CPU);
        let written = aggregator.persist(&samples, "out.png").unwrap();
        assert_eq!(written, [dir.join("out.png"), dir.join("out.2.png")]);
        assert!(written.iter().all(|p| p.is_file()));
        let written = aggregator.persist(&samples, "out.png").unwrap();
        assert_eq!(written, [dir.join("out.3.png"), dir.join("out.4.png")]);
        let written = aggregator.persist(&samples.narrow(0, 0, 1), "other.png").unwrap();
        assert_eq!(written, [dir.join("other.png")]);
        aggregator.finish().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

use super::{normalize, ImageSet};
use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array4};
use std::{fs::File, io::Read, path::{Path, PathBuf}};

const CHANNELS: usize = 3;
const SIZE: usize = 32;
const RECORD: usize = 1 + CHANNELS * SIZE * SIZE;

/// Builders.
pub mod builder {
    use super::*;

    /// Builds [`Cifar10`] from the local binary batches.
    pub struct Cifar10Builder {
        path: PathBuf,
    }

    impl Cifar10Builder {
        pub(super) fn new() -> Self {
            Self {
                path: PathBuf::from("."),
            }
        }
        /// The directory holding `data_batch_{1..5}.bin` and `test_batch.bin`.
        pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
            self.path = path.into();
            self
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        ///
        /// All six batch files must exist under the path with whole 3073-byte records.
        pub fn build(self) -> Result<Cifar10> {
            let mut images = Vec::new();
            let mut labels = Vec::new();
            for batch in 1..=5 {
                read_batch(
                    &self.path.join(format!("data_batch_{batch}.bin")),
                    &mut images,
                    &mut labels,
                )?;
            }
            let train = into_set(images, labels)?;
            let mut images = Vec::new();
            let mut labels = Vec::new();
            read_batch(&self.path.join("test_batch.bin"), &mut images, &mut labels)?;
            let test = into_set(images, labels)?;
            Ok(Cifar10 { train, test })
        }
    }
}
use builder::Cifar10Builder;

/// The CIFAR-10 dataset, loaded from the local binary batches.
///
/// Images are always `(count, 3, 32, 32)`.
pub struct Cifar10 {
    train: ImageSet,
    test: ImageSet,
}

impl Cifar10 {
    /// Returns a [`Cifar10Builder`].
    pub fn builder() -> Cifar10Builder {
        Cifar10Builder::new()
    }
    /// The training split.
    pub fn train(&self) -> &ImageSet {
        &self.train
    }
    /// The held-out split.
    pub fn test(&self) -> &ImageSet {
        &self.test
    }
    /// Converts into `(train, test)`.
    pub fn into_splits(self) -> (ImageSet, ImageSet) {
        (self.train, self.test)
    }
}

fn read_batch(path: &Path, images: &mut Vec<f32>, labels: &mut Vec<u8>) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("loading cifar10 batch from {path:?} failed!"))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    ensure!(
        !data.is_empty() && data.len() % RECORD == 0,
        "cifar10 batch {path:?} is not a whole number of {RECORD}-byte records!"
    );
    for record in data.chunks_exact(RECORD) {
        labels.push(record[0]);
        images.extend(record[1..].iter().map(|pixel| normalize(*pixel)));
    }
    Ok(())
}

fn into_set(images: Vec<f32>, labels: Vec<u8>) -> Result<ImageSet> {
    let count = labels.len();
    let images = Array4::from_shape_vec([count, CHANNELS, SIZE, SIZE], images)?;
    ImageSet::new(images, Array1::from_vec(labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_batch(path: &Path, count: usize) -> Result<()> {
        let mut file = File::create(path)?;
        for n in 0..count {
            let mut record = vec![0u8; RECORD];
            record[0] = n as u8;
            record[1] = 255;
            file.write_all(&record)?;
        }
        Ok(())
    }

    #[test]
    fn builds_all_batches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for batch in 1..=5 {
            write_batch(&dir.path().join(format!("data_batch_{batch}.bin")), 2)?;
        }
        write_batch(&dir.path().join("test_batch.bin"), 3)?;
        let cifar = Cifar10::builder().path(dir.path()).build()?;
        assert_eq!(cifar.train().dim(), ndarray::Ix4(10, 3, 32, 32));
        assert_eq!(cifar.test().len(), 3);
        // First red pixel was 255, everything else 0.
        let images = cifar.train().images();
        assert_eq!(images[(0, 0, 0, 0)], 1.);
        assert_eq!(images[(0, 1, 0, 0)], -1.);
        Ok(())
    }

    #[test]
    fn truncated_batch_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data_batch_1.bin");
        File::create(&path)?.write_all(&[0u8; RECORD - 1])?;
        for batch in 2..=5 {
            write_batch(&dir.path().join(format!("data_batch_{batch}.bin")), 1)?;
        }
        write_batch(&dir.path().join("test_batch.bin"), 1)?;
        assert!(Cifar10::builder().path(dir.path()).build().is_err());
        Ok(())
    }

    #[test]
    fn missing_path_fails() {
        assert!(Cifar10::builder().path("/does/not/exist").build().is_err());
    }
}

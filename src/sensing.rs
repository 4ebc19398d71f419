//! Fixed random sensing matrices for compressive sampling.

use anyhow::{ensure, Context, Result};
use ndarray::{Array3, ArrayView4};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

/// A fixed per-channel projection matrix.
///
/// Holds `(channels, m, n)` i.i.d. standard normal entries with `n = image_size²` and
/// `m = n / cr` (integer division). Generated once per compression ratio and cached on disk;
/// a cached matrix is returned unchanged so that runs sharing a cache directory sense with
/// identical matrices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensingMatrix {
    matrix: Array3<f32>,
    cr: usize,
}

impl SensingMatrix {
    /// Generates a matrix for `channels` x `image_size` x `image_size` images compressed by
    /// `cr`.
    ///
    /// **Errors**
    ///
    /// `cr` must be at least 1 and no greater than `image_size²`.
    pub fn generate<R: Rng>(
        channels: usize,
        image_size: usize,
        cr: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let n = image_size * image_size;
        ensure!(cr >= 1, "compression ratio must be at least 1, found {cr}!");
        let m = n / cr;
        ensure!(
            m >= 1,
            "compression ratio {cr} leaves no measurements for {image_size}x{image_size} images!"
        );
        let data = StandardNormal
            .sample_iter(rng)
            .take(channels * m * n)
            .collect::<Vec<f32>>();
        let matrix = Array3::from_shape_vec([channels, m, n], data)?;
        Ok(Self { matrix, cr })
    }
    /// The cache path for `cr` under `dir`.
    pub fn cache_path(dir: &Path, cr: usize) -> PathBuf {
        dir.join(format!("sensing_matrix_cr{cr}.bin"))
    }
    /// Loads the cached matrix for `cr` under `dir`, generating and persisting it on a cache
    /// miss.
    ///
    /// A cache hit wins unchanged; `rng` is only drawn from on a miss.
    pub fn load_or_generate<R: Rng>(
        dir: &Path,
        channels: usize,
        image_size: usize,
        cr: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let path = Self::cache_path(dir, cr);
        if path.exists() {
            Self::load(&path)
        } else {
            let matrix = Self::generate(channels, image_size, cr, rng)?;
            matrix.save(&path)?;
            Ok(matrix)
        }
    }
    /// Loads a matrix from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("loading sensing matrix from {path:?} failed!"))?;
        let matrix = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("deserializing sensing matrix from {path:?} failed!"))?;
        Ok(matrix)
    }
    /// Saves the matrix to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("saving sensing matrix to {path:?} failed!"))?;
        bincode::serialize_into(BufWriter::new(file), self)
            .with_context(|| format!("serializing sensing matrix to {path:?} failed!"))?;
        Ok(())
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.matrix.shape()[0]
    }
    /// The number of measurements per channel.
    pub fn measurements(&self) -> usize {
        self.matrix.shape()[1]
    }
    /// The flattened image size per channel.
    pub fn inputs(&self) -> usize {
        self.matrix.shape()[2]
    }
    /// The compression ratio.
    pub fn cr(&self) -> usize {
        self.cr
    }
    /// Projects an image batch to `(batch, channels, m)` measurements.
    ///
    /// **Errors**
    ///
    /// The batch must have [`channels()`](Self::channels) channels and `h * w` must equal
    /// [`inputs()`](Self::inputs).
    pub fn project(&self, images: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let (batch_size, channels, h, w) = images.dim();
        ensure!(
            channels == self.channels() && h * w == self.inputs(),
            "sensing matrix {:?} cannot project images of shape {:?}!",
            self.matrix.shape(),
            images.shape()
        );
        let m = self.measurements();
        let mut output = Array3::zeros([batch_size, channels, m]);
        for (image, mut output) in images.outer_iter().zip(output.outer_iter_mut()) {
            for ((image, matrix), mut output) in image
                .outer_iter()
                .zip(self.matrix.outer_iter())
                .zip(output.outer_iter_mut())
            {
                let flat = image.to_shape(h * w)?;
                output.assign(&matrix.dot(&flat.view()));
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn generate_shapes() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let matrix = SensingMatrix::generate(3, 32, 10, &mut rng)?;
        assert_eq!(matrix.channels(), 3);
        assert_eq!(matrix.measurements(), 102);
        assert_eq!(matrix.inputs(), 1024);
        Ok(())
    }

    #[test]
    fn generate_seeded_reproducible() -> Result<()> {
        let a = SensingMatrix::generate(1, 8, 4, &mut SmallRng::seed_from_u64(42))?;
        let b = SensingMatrix::generate(1, 8, 4, &mut SmallRng::seed_from_u64(42))?;
        assert_eq!(a.matrix, b.matrix);
        Ok(())
    }

    #[test]
    fn cache_round_trip_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first =
            SensingMatrix::load_or_generate(dir.path(), 1, 8, 4, &mut SmallRng::seed_from_u64(0))?;
        // A second load with a different seed must return the cached matrix unchanged.
        let second =
            SensingMatrix::load_or_generate(dir.path(), 1, 8, 4, &mut SmallRng::seed_from_u64(99))?;
        assert_eq!(first.matrix, second.matrix);
        assert_eq!(second.cr(), 4);
        Ok(())
    }

    #[test]
    fn project_shape_and_linearity() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let matrix = SensingMatrix::generate(2, 4, 2, &mut rng)?;
        let images = Array4::from_shape_fn([5, 2, 4, 4], |(b, c, i, j)| {
            (b as f32) * 0.1 + (c as f32) * 0.01 + (i * 4 + j) as f32 * 0.001
        });
        let y = matrix.project(&images.view())?;
        assert_eq!(y.dim(), (5, 2, 8));
        let doubled = matrix.project(&(2. * &images).view())?;
        for (y, doubled) in y.iter().zip(doubled.iter()) {
            approx::assert_relative_eq!(2. * y, doubled, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn cr_too_large_fails() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(SensingMatrix::generate(1, 4, 17, &mut rng).is_err());
    }
}

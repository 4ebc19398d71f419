use super::{normalize, ImageSet};
use anyhow::{ensure, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use ndarray::{s, Array1, Array4};
use std::{fs::File, io::Read, path::{Path, PathBuf}};

const ROWS: usize = 28;
const COLS: usize = 28;

/// Builders.
pub mod builder {
    use super::*;

    /// Builds [`Mnist`] from local idx-gz files.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use lapnet::dataset::mnist::Mnist;
    /// # fn main() -> Result<()> {
    /// let mnist = Mnist::builder()
    ///     .path("data/mnist")
    ///     .image_size(32)
    ///     .channels(3)
    ///     .build()?;
    /// # Ok(())
    /// # }
    ///```
    pub struct MnistBuilder {
        path: PathBuf,
        image_size: usize,
        channels: usize,
    }

    impl MnistBuilder {
        pub(super) fn new() -> Self {
            Self {
                path: PathBuf::from("."),
                image_size: ROWS,
                channels: 1,
            }
        }
        /// The directory holding `train-images-idx3-ubyte.gz` and friends.
        pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
            self.path = path.into();
            self
        }
        /// Centers the 28x28 digits into `image_size` x `image_size` canvases.
        pub fn image_size(mut self, image_size: usize) -> Self {
            self.image_size = image_size;
            self
        }
        /// Replicates the grayscale channel to `channels`.
        pub fn channels(mut self, channels: usize) -> Self {
            self.channels = channels;
            self
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        ///
        /// The files must exist under the path with valid idx magics, and `image_size` must be
        /// at least 28.
        pub fn build(self) -> Result<Mnist> {
            ensure!(
                self.image_size >= ROWS,
                "image size {} cannot hold {ROWS}x{COLS} digits!",
                self.image_size
            );
            ensure!(self.channels >= 1, "channels must be at least 1!");
            let train = load_split(&self.path, "train", self.image_size, self.channels)?;
            let test = load_split(&self.path, "t10k", self.image_size, self.channels)?;
            Ok(Mnist { train, test })
        }
    }
}
use builder::MnistBuilder;

/// The MNIST handwritten digit dataset, loaded from local files.
#[derive(Debug)]
pub struct Mnist {
    train: ImageSet,
    test: ImageSet,
}

impl Mnist {
    /// Returns a [`MnistBuilder`].
    pub fn builder() -> MnistBuilder {
        MnistBuilder::new()
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

fn load_split(dir: &Path, prefix: &str, image_size: usize, channels: usize) -> Result<ImageSet> {
    let images = read_images(
        &dir.join(format!("{prefix}-images-idx3-ubyte.gz")),
        image_size,
        channels,
    )?;
    let labels = read_labels(&dir.join(format!("{prefix}-labels-idx1-ubyte.gz")))?;
    ImageSet::new(images, labels)
}

fn read_images(path: &Path, image_size: usize, channels: usize) -> Result<Array4<f32>> {
    let file =
        File::open(path).with_context(|| format!("loading mnist images from {path:?} failed!"))?;
    let mut decoder = GzDecoder::new(file);
    let magic = decoder.read_i32::<BigEndian>()?;
    ensure!(magic == 2_051, "invalid mnist image magic {magic} in {path:?}!");
    let count = decoder.read_i32::<BigEndian>()? as usize;
    let rows = decoder.read_i32::<BigEndian>()? as usize;
    let cols = decoder.read_i32::<BigEndian>()? as usize;
    ensure!(
        rows == ROWS && cols == COLS,
        "expected {ROWS}x{COLS} mnist images, found {rows}x{cols} in {path:?}!"
    );
    let mut data = vec![0u8; count * rows * cols];
    decoder.read_exact(&mut data)?;
    let digits = Array4::from_shape_vec([count, 1, rows, cols], data)?;
    // Background pad at -1, digit centered, grayscale replicated across channels.
    let offset = (image_size - rows) / 2;
    let mut images = Array4::from_elem([count, channels, image_size, image_size], -1.0f32);
    for channel in 0..channels {
        let mut window = images.slice_mut(s![
            ..,
            channel,
            offset..offset + rows,
            offset..offset + cols
        ]);
        window.zip_mut_with(&digits.slice(s![.., 0, .., ..]), |out, pixel| {
            *out = normalize(*pixel)
        });
    }
    Ok(images)
}

fn read_labels(path: &Path) -> Result<Array1<u8>> {
    let file =
        File::open(path).with_context(|| format!("loading mnist labels from {path:?} failed!"))?;
    let mut decoder = GzDecoder::new(file);
    let magic = decoder.read_i32::<BigEndian>()?;
    ensure!(magic == 2_049, "invalid mnist label magic {magic} in {path:?}!");
    let count = decoder.read_i32::<BigEndian>()? as usize;
    let mut labels = vec![0u8; count];
    decoder.read_exact(&mut labels)?;
    Ok(Array1::from_vec(labels))
}

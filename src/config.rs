//! Run configuration.

use crate::{
    dataset::DatasetKind,
    init::InitKind,
    models::mutual_info::{Measure, MiMode},
};
use anyhow::{bail, ensure, Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr};

/// How the encoder projects images to measurements.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProjMethod {
    /// Learned per-channel linear projection with a decoded proxy.
    Linear,
    /// Strided convolution features.
    Conv,
}

impl FromStr for ProjMethod {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "conv" => Ok(Self::Conv),
            _ => bail!("projection method {input:?} is not implemented!"),
        }
    }
}

/// Configuration of a training run.
///
/// Passed by reference into component constructors; there is no global options object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The dataset to train on.
    pub dataset: DatasetKind,
    /// The directory holding the dataset files.
    pub data_path: PathBuf,
    /// The root of the output tree.
    pub output_dir: PathBuf,
    /// The model name used in the output tree.
    pub model: String,
    /// Training batch size.
    pub batch_size: usize,
    /// Validation batch size.
    pub test_batch_size: usize,
    /// Square image size.
    pub image_size: usize,
    /// Image channels.
    pub channels: usize,
    /// Number of epochs.
    pub epochs: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Adam first-moment decay.
    pub beta1: f32,
    /// Weight of the reconstruction loss in the combined objective.
    pub w_loss: f32,
    /// Compression ratio.
    pub cr: usize,
    /// Statistic network feature width.
    pub local_feat: usize,
    /// Mutual information f-divergence.
    pub measure: Measure,
    /// Mutual information estimator mode.
    pub mi_mode: MiMode,
    /// Weight initialization scheme.
    pub init: InitKind,
    /// Encoder projection method.
    pub proj_method: ProjMethod,
    /// Feature channels of the convolutional encoder.
    pub encoder_channels: usize,
    /// Kernel size of the convolutional encoder, which also serves as its stride.
    pub encoder_kernel: usize,
    /// Seed for all random initialization and shuffling.
    pub seed: u64,
    /// Batches between log lines.
    pub log_interval: usize,
    /// Prefetch depth of the batch loader, 0 for synchronous loading.
    pub prefetch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Cifar10,
            data_path: PathBuf::from("data"),
            output_dir: PathBuf::from("results"),
            model: "lapnet0".to_string(),
            batch_size: 32,
            test_batch_size: 32,
            image_size: 32,
            channels: 3,
            epochs: 100,
            learning_rate: 2e-4,
            beta1: 0.5,
            w_loss: 0.01,
            cr: 10,
            local_feat: 512,
            measure: Measure::Jsd,
            mi_mode: MiMode::Fd,
            init: InitKind::Normal,
            proj_method: ProjMethod::Linear,
            encoder_channels: 4,
            encoder_kernel: 8,
            seed: 1,
            log_interval: 100,
            prefetch: 2,
        }
    }
}

impl Config {
    /// Validates cross-field constraints.
    ///
    /// **Errors**
    ///
    /// CIFAR-10 fixes the image size at 32 and the channels at 3; MNIST requires an image
    /// size of at least 28. The compression ratio must leave at least one measurement.
    pub fn validate(&self) -> Result<()> {
        match self.dataset {
            DatasetKind::Cifar10 => {
                ensure!(
                    self.image_size == 32 && self.channels == 3,
                    "cifar10 requires image size 32 and 3 channels, found {} and {}!",
                    self.image_size,
                    self.channels
                );
            }
            DatasetKind::Mnist => {
                ensure!(
                    self.image_size >= 28,
                    "mnist requires an image size of at least 28, found {}!",
                    self.image_size
                );
            }
        }
        let n = self.image_size * self.image_size;
        ensure!(
            self.cr >= 1 && n / self.cr >= 1,
            "compression ratio {} leaves no measurements for {}x{} images!",
            self.cr,
            self.image_size,
            self.image_size
        );
        ensure!(self.batch_size >= 2, "batch size must be at least 2!");
        ensure!(self.epochs >= 1, "epochs must be at least 1!");
        Ok(())
    }
    /// The run directory `{output_dir}/{dataset}/cr{cr}/{model}`.
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir
            .join(self.dataset.name())
            .join(format!("cr{}", self.cr))
            .join(&self.model)
    }
    /// The checkpoint directory.
    pub fn model_dir(&self) -> PathBuf {
        self.run_dir().join("model")
    }
    /// The sample image directory.
    pub fn image_dir(&self) -> PathBuf {
        self.run_dir().join("image")
    }
    /// Measurements per channel, `image_size² / cr`.
    pub fn measurements(&self) -> usize {
        self.image_size * self.image_size / self.cr
    }
}

//! Training orchestration.

use crate::{
    config::{Config, ProjMethod},
    dataset::{cifar10::Cifar10, mnist::Mnist, DatasetKind, ImageSet, Loader},
    init::Initializer,
    learn::{
        criterion::{mean_squared_error, Criterion, MseLoss},
        neural_network::{
            autograd::Variable,
            layer::{Forward, Layer},
            optimizer::Adam,
        },
        Summary,
    },
    models::{encoder::Encoder, irevnet::IRevNet, mutual_info::MutualInfoLoss, reconnet::ReconNet},
    sensing::SensingMatrix,
    vis::save_image_grid,
};
use anyhow::{Context, Result};
use ndarray::ArcArray;
use rand::{rngs::SmallRng, SeedableRng};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    time::Instant,
};

const IREVNET_BLOCKS: [usize; 3] = [4, 4, 4];
const IREVNET_WIDTHS: [usize; 3] = [16, 16, 16];

/// Wires the networks, losses, optimizers, and loaders into the epoch/batch loop.
///
/// Per batch: the encoder produces the measurement (and, in linear mode, a decoded proxy that
/// is passed through the invertible network, a structural placeholder whose output is unused);
/// the reconstruction network is driven by the measurement; the mutual information loss and
/// the weighted reconstruction loss are combined into one scalar and backpropagated once, and
/// both optimizer steps follow. Per epoch: checkpoint, sample grids, and a validation pass in
/// evaluation mode.
pub struct Trainer {
    config: Config,
    encoder: Encoder,
    irevnet: IRevNet,
    reconnet: ReconNet,
    mi_loss: MutualInfoLoss,
    optimizer: Adam,
    train_loader: Loader,
    val_loader: Loader,
    sensing: SensingMatrix,
}

impl Trainer {
    /// Creates a trainer, loading the dataset from `config.data_path`.
    ///
    /// **Errors**
    ///
    /// Fails fast on an invalid configuration, a missing dataset, or an unwritable output
    /// tree.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (train_set, test_set) = match config.dataset {
            DatasetKind::Mnist => Mnist::builder()
                .path(&config.data_path)
                .image_size(config.image_size)
                .channels(config.channels)
                .build()?
                .into_splits(),
            DatasetKind::Cifar10 => Cifar10::builder()
                .path(&config.data_path)
                .build()?
                .into_splits(),
        };
        Self::from_sets(config, train_set, test_set)
    }
    /// Creates a trainer from already loaded splits.
    pub fn from_sets(config: Config, train_set: ImageSet, test_set: ImageSet) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.model_dir())?;
        std::fs::create_dir_all(config.image_dir())?;
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let sensing = SensingMatrix::load_or_generate(
            &config.run_dir(),
            config.channels,
            config.image_size,
            config.cr,
            &mut rng,
        )?;
        let mut encoder = match config.proj_method {
            ProjMethod::Linear => Encoder::linear(config.image_size, config.cr, &mut rng)?,
            ProjMethod::Conv => Encoder::conv(
                config.channels,
                config.encoder_channels,
                config.encoder_kernel,
                config.encoder_kernel,
                &mut rng,
            )?,
        };
        let mut irevnet = IRevNet::new(config.channels, &IREVNET_BLOCKS, &IREVNET_WIDTHS, &mut rng)?;
        let measurement_len = match config.proj_method {
            ProjMethod::Linear => config.channels * config.measurements(),
            ProjMethod::Conv => {
                let feature_size = config.image_size / config.encoder_kernel;
                config.encoder_channels * feature_size * feature_size
            }
        };
        let mut reconnet = ReconNet::new(
            config.channels,
            config.image_size,
            measurement_len,
            &mut rng,
        )?;
        let image_len = config.channels * config.image_size * config.image_size;
        let mi_loss = MutualInfoLoss::new(
            image_len,
            measurement_len,
            config.local_feat,
            config.measure,
            config.mi_mode,
            &mut rng,
        );
        let initializer = Initializer::new(config.init);
        encoder.init(&initializer, &mut rng)?;
        irevnet.init(&initializer, &mut rng)?;
        reconnet.init(&initializer, &mut rng)?;
        let optimizer = Adam::default().with_betas((config.beta1, 0.999));
        let train_loader = Loader::new(train_set, config.batch_size)
            .with_shuffle(SmallRng::from_rng(&mut rng)?)
            .with_prefetch(config.prefetch);
        let val_loader = Loader::new(test_set, config.test_batch_size);
        Ok(Self {
            config,
            encoder,
            irevnet,
            reconnet,
            mi_loss,
            optimizer,
            train_loader,
            val_loader,
            sensing,
        })
    }
    /// The fixed sensing matrix of the run.
    pub fn sensing(&self) -> &SensingMatrix {
        &self.sensing
    }
    /// Runs the configured number of epochs.
    pub fn run(&mut self) -> Result<()> {
        for epoch in 0..self.config.epochs {
            let summary = self.run_epoch(epoch)?;
            println!("{summary}");
        }
        Ok(())
    }
    /// Runs one epoch of training, checkpointing, and validation.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<Summary> {
        let start = Instant::now();
        let mut summary = Summary::new(epoch);
        self.train_epoch(epoch, &mut summary)?;
        self.save_checkpoint(epoch)?;
        self.validate(epoch, &mut summary)?;
        summary.elapsed = start.elapsed();
        Ok(summary)
    }
    fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.irevnet.set_training(training);
        self.reconnet.set_training(training);
        self.mi_loss.set_training(training);
    }
    fn train_epoch(&mut self, epoch: usize, summary: &mut Summary) -> Result<()> {
        self.set_training(true);
        let batches = self.train_loader.batch_count();
        let epochs = self.config.epochs;
        let learning_rate = self.config.learning_rate;
        for (index, (images, _labels)) in self.train_loader.batches().enumerate() {
            // The unpaired expectation of the MI bound needs at least 2 samples.
            if images.shape()[0] < 2 {
                continue;
            }
            let images = images.into_shared();
            let (measurement, proxy) = self.encoder.forward(Variable::from(images.clone()))?;
            if let Some(proxy) = proxy {
                // Forward-only placeholder, the output does not feed the losses.
                let _features = self.irevnet.forward(proxy)?;
            }
            let reconstruction = self.reconnet.forward(measurement.clone())?;
            let mi = self
                .mi_loss
                .forward(Variable::from(images.clone()), measurement)?;
            let mse = MseLoss.eval(reconstruction, images)?;
            let (mse_item, mi_item) = (mse.item(), mi.item());
            // One backward over the combined objective accumulates the gradients of both
            // losses before either optimizer steps.
            let loss = mi.add(&mse.scale(self.config.w_loss))?;
            loss.backward()?;
            self.encoder.update(learning_rate, &self.optimizer)?;
            self.mi_loss.update(learning_rate, &self.optimizer)?;
            self.reconnet.update(learning_rate, &self.optimizer)?;
            summary.train_mse.update(mse_item);
            summary.train_mi.update(mi_item);
            if index % self.config.log_interval == 0 {
                println!(
                    "[{epoch}/{epochs}][{index}/{batches}] errG_mse: {mse_item:.6} err_mi: {mi_item:.6}"
                );
            }
        }
        Ok(())
    }
    fn validate(&mut self, epoch: usize, summary: &mut Summary) -> Result<()> {
        self.set_training(false);
        let batches = self.val_loader.batch_count();
        for (index, (images, _labels)) in self.val_loader.batches().enumerate() {
            let images = images.into_shared();
            let (measurement, _proxy) = self.encoder.forward(Variable::from(images.clone()))?;
            let reconstruction = self.reconnet.forward(measurement)?;
            let mse = mean_squared_error(&reconstruction.value().view(), &images.view());
            summary.val_mse.update(mse);
            if index % 20 == 0 {
                println!("[{epoch}] validation [{index}/{batches}] mse: {mse:.6}");
            }
            if index == 0 {
                self.save_sample_grids(epoch, &images, reconstruction.value())?;
            }
        }
        Ok(())
    }
    fn save_sample_grids(
        &self,
        epoch: usize,
        real: &ArcArray<f32, ndarray::Ix4>,
        fake: &ArcArray<f32, ndarray::Ix4>,
    ) -> Result<()> {
        let image_dir = self.config.image_dir();
        save_image_grid(
            &real.view(),
            &image_dir.join(format!("epoch_{epoch:03}_real.png")),
        )?;
        save_image_grid(
            &fake.view(),
            &image_dir.join(format!("epoch_{epoch:03}_fake.png")),
        )?;
        Ok(())
    }
    /// The checkpoint path for `epoch`.
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.config
            .model_dir()
            .join(format!("{}_gen_epoch_{epoch}.bin", self.config.model))
    }
    fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let path = self.checkpoint_path(epoch);
        let file = File::create(&path)
            .with_context(|| format!("saving checkpoint to {path:?} failed!"))?;
        bincode::serialize_into(BufWriter::new(file), &self.reconnet)
            .with_context(|| format!("serializing checkpoint to {path:?} failed!"))?;
        Ok(())
    }
}

/// Loads a reconstruction network checkpoint.
pub fn load_checkpoint(path: &Path) -> Result<ReconNet> {
    let file =
        File::open(path).with_context(|| format!("loading checkpoint from {path:?} failed!"))?;
    let reconnet = bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("deserializing checkpoint from {path:?} failed!"))?;
    Ok(reconnet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array4};

    fn toy_config(dir: &Path) -> Config {
        Config {
            dataset: DatasetKind::Mnist,
            output_dir: dir.join("results"),
            batch_size: 4,
            test_batch_size: 4,
            image_size: 28,
            channels: 1,
            epochs: 1,
            cr: 16,
            local_feat: 16,
            log_interval: 1,
            prefetch: 0,
            ..Config::default()
        }
    }

    fn toy_set(count: usize, channels: usize, size: usize) -> ImageSet {
        let images = Array4::from_shape_fn([count, channels, size, size], |(n, _, i, j)| {
            (((n + i) as f32 * 0.37 + j as f32 * 0.11).sin()) * 0.5
        });
        let labels = Array1::zeros(count);
        ImageSet::new(images, labels).unwrap()
    }

    #[test]
    fn epoch_produces_checkpoint_and_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = toy_config(dir.path());
        let mut trainer =
            Trainer::from_sets(config, toy_set(8, 1, 28), toy_set(4, 1, 28))?;
        let summary = trainer.run_epoch(0)?;
        assert!(summary.train_mse.count() > 0);
        assert!(summary.val_mse.count() > 0);
        assert!(trainer.checkpoint_path(0).exists());
        assert!(trainer
            .config
            .image_dir()
            .join("epoch_000_real.png")
            .exists());
        assert!(trainer
            .config
            .image_dir()
            .join("epoch_000_fake.png")
            .exists());
        let reconnet = load_checkpoint(&trainer.checkpoint_path(0))?;
        drop(reconnet);
        Ok(())
    }

    #[test]
    fn seeded_construction_is_reproducible() -> Result<()> {
        let dir_a = tempfile::tempdir()?;
        let dir_b = tempfile::tempdir()?;
        let mut a = Trainer::from_sets(
            toy_config(dir_a.path()),
            toy_set(4, 1, 28),
            toy_set(4, 1, 28),
        )?;
        let mut b = Trainer::from_sets(
            toy_config(dir_b.path()),
            toy_set(4, 1, 28),
            toy_set(4, 1, 28),
        )?;
        let wa = a.encoder.parameters_mut()[0].value().to_owned();
        let wb = b.encoder.parameters_mut()[0].value().to_owned();
        assert_eq!(wa, wb);
        Ok(())
    }

    #[test]
    fn sensing_matrix_is_cached_per_run_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = toy_config(dir.path());
        let first = Trainer::from_sets(config.clone(), toy_set(4, 1, 28), toy_set(4, 1, 28))?;
        let second = Trainer::from_sets(config, toy_set(4, 1, 28), toy_set(4, 1, 28))?;
        assert_eq!(
            first.sensing().measurements(),
            second.sensing().measurements()
        );
        assert!(SensingMatrix::cache_path(&first.config.run_dir(), first.config.cr).exists());
        Ok(())
    }
}

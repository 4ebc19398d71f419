use anyhow::Result;
use clap::Parser;
use lapnet::{config::Config, train::Trainer};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "train", about = "Trains a compressive sensing reconstruction pipeline.")]
struct Options {
    /// Dataset: mnist | cifar10.
    #[arg(long, default_value = "cifar10")]
    dataset: String,
    /// Directory holding the dataset files.
    #[arg(long, default_value = "data")]
    dataroot: PathBuf,
    /// Root of the output tree.
    #[arg(long, default_value = "results")]
    outf: PathBuf,
    /// Model name used in the output tree and checkpoint names.
    #[arg(long, default_value = "lapnet0")]
    model: String,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 32)]
    test_batch_size: usize,
    #[arg(long, default_value_t = 32)]
    image_size: usize,
    /// Image channels.
    #[arg(long, default_value_t = 3)]
    nc: usize,
    #[arg(long, default_value_t = 100)]
    epochs: usize,
    #[arg(long, default_value_t = 2e-4)]
    lr: f32,
    /// Adam first-moment decay.
    #[arg(long, default_value_t = 0.5)]
    beta1: f32,
    /// Weight of the reconstruction loss.
    #[arg(long, default_value_t = 0.01)]
    w_loss: f32,
    /// Compression ratio.
    #[arg(long, default_value_t = 10)]
    cr: usize,
    /// Statistic network feature width.
    #[arg(long, default_value_t = 512)]
    local_feat: usize,
    /// Mutual information f-divergence: jsd | gan | kl.
    #[arg(long, default_value = "jsd")]
    measure: String,
    /// Mutual information estimator: fd | nce.
    #[arg(long, default_value = "fd")]
    mi_mode: String,
    /// Weight initialization: normal | kaiming.
    #[arg(long, default_value = "normal")]
    init: String,
    /// Encoder projection: linear | conv.
    #[arg(long, default_value = "linear")]
    proj: String,
    /// Feature channels of the convolutional encoder.
    #[arg(long, default_value_t = 4)]
    encoder_channels: usize,
    /// Kernel size of the convolutional encoder, which also serves as its stride.
    #[arg(long, default_value_t = 8)]
    encoder_kernel: usize,
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Batches between log lines.
    #[arg(long, default_value_t = 100)]
    log_interval: usize,
    /// Prefetch depth of the batch loader, 0 for synchronous loading.
    #[arg(long, default_value_t = 2)]
    prefetch: usize,
}

fn main() -> Result<()> {
    let options = Options::parse();
    let config = Config {
        dataset: options.dataset.parse()?,
        data_path: options.dataroot,
        output_dir: options.outf,
        model: options.model,
        batch_size: options.batch_size,
        test_batch_size: options.test_batch_size,
        image_size: options.image_size,
        channels: options.nc,
        epochs: options.epochs,
        learning_rate: options.lr,
        beta1: options.beta1,
        w_loss: options.w_loss,
        cr: options.cr,
        local_feat: options.local_feat,
        measure: options.measure.parse()?,
        mi_mode: options.mi_mode.parse()?,
        init: options.init.parse()?,
        proj_method: options.proj.parse()?,
        encoder_channels: options.encoder_channels,
        encoder_kernel: options.encoder_kernel,
        seed: options.seed,
        log_interval: options.log_interval.max(1),
        prefetch: options.prefetch,
    };
    Trainer::new(config)?.run()
}

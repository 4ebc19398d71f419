//! Compressive sensing image reconstruction with mutual-information regularized encoding.
//!
//! A learned [`Encoder`](models::encoder::Encoder) compresses image batches into
//! measurements, a [`ReconNet`](models::reconnet::ReconNet) reconstructs the images, and a
//! [`MutualInfoLoss`](models::mutual_info::MutualInfoLoss) bound keeps the measurements
//! informative. The [`Trainer`](train::Trainer) wires them into an epoch/batch loop with
//! Adam, checkpoints, and sample image grids.
//!
//! # Example
//!```no_run
//! use lapnet::{config::Config, train::Trainer};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     Trainer::new(config)?.run()
//! }
//!```

/// Run configuration.
pub mod config;
/// Datasets.
pub mod dataset;
/// Weight initialization.
pub mod init;
/// Machine learning.
pub mod learn;
/// Networks.
pub mod models;
/// Sensing matrices.
pub mod sensing;
/// Training.
pub mod train;
/// Image grids.
pub mod vis;

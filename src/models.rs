//! Networks of the compressive sensing pipeline.
//!
//! - [`Encoder`](encoder::Encoder): learned sensing, image to measurement.
//! - [`ReconNet`](reconnet::ReconNet): measurement to reconstructed image.
//! - [`IRevNet`](irevnet::IRevNet): invertible feature extractor.
//! - [`MutualInfoLoss`](mutual_info::MutualInfoLoss): mutual information bound between image
//!   and measurement.

/// Learned encoder.
pub mod encoder;
/// Invertible network.
pub mod irevnet;
/// Mutual information estimators.
pub mod mutual_info;
/// Reconstruction network.
pub mod reconnet;

//! Neural networks.
//!
//! Networks are composed of [`Layer`](layer::Layer)s which implement
//! [`Forward`](layer::Forward), operating on [`Variable`](autograd::Variable)s. Calling
//! [`.backward()`](autograd::Variable0::backward) on a scalar loss computes the gradients of
//! the [`Parameter`](autograd::Parameter)s, which are then applied by an
//! [`Optimizer`](optimizer::Optimizer).
//!
//! # Example
//!```no_run
//! # use anyhow::Result;
//! # use ndarray::Array4;
//! use lapnet::learn::neural_network::{
//!     autograd::Variable,
//!     layer::{Forward, Layer},
//!     optimizer::Adam,
//! };
//! use lapnet::models::reconnet::ReconNet;
//!
//! # fn main() -> Result<()> {
//! # let mut net: ReconNet = todo!();
//! # let measurement = todo!();
//! net.set_training(true);
//! let reconstruction = net.forward(measurement)?;
//! # let loss: lapnet::learn::neural_network::autograd::Variable0 = todo!();
//! loss.backward()?;
//! let optimizer = Adam::default();
//! net.update(0.0002, &optimizer)?;
//! # Ok(())
//! # }
//!```

/// Variables and Parameters with autograd.
pub mod autograd;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;

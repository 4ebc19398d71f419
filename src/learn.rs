//! Machine learning.

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Criteria.
pub mod criterion;
/// Neural networks.
pub mod neural_network;

/// Running statistics of a scalar metric.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    total: f32,
}

impl Stats {
    /// Adds a sample.
    pub fn update(&mut self, sample: f32) {
        self.count += 1;
        self.total += sample;
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The arithmetic mean over the samples, 0 if empty.
    pub fn mean(&self) -> f32 {
        if self.count > 0 {
            self.total / self.count as f32
        } else {
            0.
        }
    }
}

/// Summary of an epoch.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    /// The epoch, starting at 0.
    pub epoch: usize,
    /// Reconstruction loss over the training batches.
    pub train_mse: Stats,
    /// Mutual information loss over the training batches.
    pub train_mi: Stats,
    /// Reconstruction loss over the validation batches.
    pub val_mse: Stats,
    /// Time spent in the epoch.
    pub elapsed: Duration,
}

impl Summary {
    /// Creates a summary for `epoch`.
    pub fn new(epoch: usize) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "epoch {} train_mse: {:.6} train_mi: {:.6} val_mse: {:.6} elapsed: {:.2?}",
            self.epoch,
            self.train_mse.mean(),
            self.train_mi.mean(),
            self.val_mse.mean(),
            self.elapsed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn stats_mean_is_arithmetic_mean() {
        let mut stats = Stats::default();
        for mse in [0.1, 0.2, 0.3, 0.4] {
            stats.update(mse);
        }
        assert_eq!(stats.count(), 4);
        assert_relative_eq!(stats.mean(), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn empty_stats_mean_is_zero() {
        assert_eq!(Stats::default().mean(), 0.);
    }
}

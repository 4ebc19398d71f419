use crate::learn::neural_network::{
    autograd::{softplus, ParameterD, Variable, Variable0, Variable2, Variable3, Variable4},
    layer::{Forward, Layer, Linear},
};
use anyhow::{bail, ensure, Error, Result};
use ndarray::{Array2, Ix0};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The f-divergence of the mutual information bound.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Measure {
    /// Jensen-Shannon divergence.
    Jsd,
    /// GAN divergence.
    Gan,
    /// Kullback-Leibler divergence.
    Kl,
}

impl FromStr for Measure {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "jsd" => Ok(Self::Jsd),
            "gan" => Ok(Self::Gan),
            "kl" => Ok(Self::Kl),
            _ => bail!("measure {input:?} is not implemented!"),
        }
    }
}

/// The estimator mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MiMode {
    /// f-divergence bound: positive expectation on paired samples, negative on unpaired.
    Fd,
    /// InfoNCE contrastive bound.
    Nce,
}

impl FromStr for MiMode {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "fd" => Ok(Self::Fd),
            "nce" => Ok(Self::Nce),
            _ => bail!("mutual information mode {input:?} is not implemented!"),
        }
    }
}

/// Mutual information loss between an image batch and its measurement.
///
/// Two small statistic networks embed the flattened image and the flattened measurement into
/// a shared feature space; the pairwise dot products form a `(batch, batch)` score matrix
/// whose diagonal holds the paired (joint) samples and whose off-diagonal holds the unpaired
/// (product-of-marginals) samples. The selected estimator turns the scores into a lower bound
/// on mutual information; the returned loss is the negated bound, so minimizing the loss
/// maximizes the bound.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutualInfoLoss {
    image_net: StatisticNet,
    embed_net: StatisticNet,
    measure: Measure,
    mode: MiMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StatisticNet {
    fc1: Linear,
    fc2: Linear,
}

impl StatisticNet {
    fn new<R: Rng>(inputs: usize, local_feat: usize, rng: &mut R) -> Self {
        Self {
            fc1: Linear::from_inputs_outputs(inputs, local_feat, rng).with_bias(true),
            fc2: Linear::from_inputs_outputs(local_feat, local_feat, rng).with_bias(true),
        }
    }
}

impl Layer for StatisticNet {
    fn parameters_len(&self) -> usize {
        self.fc1.parameters_len() + self.fc2.parameters_len()
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        self.fc1.collect_parameters_mut(parameters);
        self.fc2.collect_parameters_mut(parameters);
    }
}

impl Forward<Variable2> for StatisticNet {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Variable2> {
        self.fc2.forward(self.fc1.forward(input)?.relu())
    }
}

impl MutualInfoLoss {
    /// Creates a new [`MutualInfoLoss`].
    ///
    /// `image_inputs` is the flattened image length `c * h * w`, `embed_inputs` the flattened
    /// measurement length `c * m`, and `local_feat` the statistic feature width.
    pub fn new<R: Rng>(
        image_inputs: usize,
        embed_inputs: usize,
        local_feat: usize,
        measure: Measure,
        mode: MiMode,
        rng: &mut R,
    ) -> Self {
        Self {
            image_net: StatisticNet::new(image_inputs, local_feat, rng),
            embed_net: StatisticNet::new(embed_inputs, local_feat, rng),
            measure,
            mode,
        }
    }
    /// Evaluates the loss for an image batch and its measurement.
    ///
    /// **Errors**
    ///
    /// The batch sizes must match and the batch must hold at least 2 samples (the unpaired
    /// expectation needs off-diagonal scores).
    pub fn forward(&self, image: Variable4, embedding: Variable3) -> Result<Variable0> {
        ensure!(
            image.shape()[0] == embedding.shape()[0],
            "image batch {} does not match embedding batch {}!",
            image.shape()[0],
            embedding.shape()[0]
        );
        ensure!(
            image.shape()[0] >= 2,
            "mutual information estimation requires a batch of at least 2 samples!"
        );
        let image_feat = self.image_net.forward(image.flatten()?)?;
        let embed_feat = self.embed_net.forward(embedding.flatten()?)?;
        let scores = image_feat.dot(&embed_feat.t())?;
        let bound = match self.mode {
            MiMode::Fd => fd_bound(scores, self.measure),
            MiMode::Nce => nce_bound(scores),
        };
        // Minimizing the negated bound maximizes mutual information.
        Ok(bound.scale(-1.))
    }
}

impl Layer for MutualInfoLoss {
    fn parameters_len(&self) -> usize {
        self.image_net.parameters_len() + self.embed_net.parameters_len()
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        self.image_net.collect_parameters_mut(parameters);
        self.embed_net.collect_parameters_mut(parameters);
    }
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

fn positive(measure: Measure, u: f32) -> f32 {
    match measure {
        Measure::Jsd => std::f32::consts::LN_2 - softplus(-u),
        Measure::Gan => -softplus(-u),
        Measure::Kl => u,
    }
}

fn positive_grad(measure: Measure, u: f32) -> f32 {
    match measure {
        Measure::Jsd | Measure::Gan => sigmoid(-u),
        Measure::Kl => 1.,
    }
}

fn negative(measure: Measure, u: f32) -> f32 {
    match measure {
        Measure::Jsd => softplus(u) - std::f32::consts::LN_2,
        Measure::Gan => softplus(u),
        Measure::Kl => (u - 1.).exp(),
    }
}

fn negative_grad(measure: Measure, u: f32) -> f32 {
    match measure {
        Measure::Jsd | Measure::Gan => sigmoid(u),
        Measure::Kl => (u - 1.).exp(),
    }
}

/// f-divergence bound: mean of `positive` over the diagonal minus mean of `negative` over the
/// off-diagonal.
fn fd_bound(scores: Variable2, measure: Measure) -> Variable0 {
    let (b, _) = scores.dim();
    let u = scores.value().clone();
    let positive_mean = (0..b).map(|i| positive(measure, u[(i, i)])).sum::<f32>() / b as f32;
    let negative_count = (b * (b - 1)) as f32;
    let mut negative_sum = 0.;
    for i in 0..b {
        for j in 0..b {
            if i != j {
                negative_sum += negative(measure, u[(i, j)]);
            }
        }
    }
    let value = positive_mean - negative_sum / negative_count;
    let mut builder = Variable0::builder();
    if let Some(node) = scores.node() {
        builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix0>| {
            let dy = output_grad[()];
            let mut grad = Array2::zeros(u.raw_dim());
            for i in 0..b {
                for j in 0..b {
                    grad[(i, j)] = if i == j {
                        dy * positive_grad(measure, u[(i, j)]) / b as f32
                    } else {
                        -dy * negative_grad(measure, u[(i, j)]) / negative_count
                    };
                }
            }
            Ok(grad.into_shared())
        });
    }
    builder.build(ndarray::arr0(value).into_shared())
}

/// InfoNCE bound: mean over rows of `u_ii - logsumexp_j u_ij`.
fn nce_bound(scores: Variable2) -> Variable0 {
    let (b, _) = scores.dim();
    let u = scores.value().clone();
    let mut value = 0.;
    for i in 0..b {
        let row = u.row(i);
        let max = row.iter().copied().fold(f32::MIN, f32::max);
        let lse = max + row.iter().map(|u| (u - max).exp()).sum::<f32>().ln();
        value += u[(i, i)] - lse;
    }
    let value = value / b as f32;
    let mut builder = Variable0::builder();
    if let Some(node) = scores.node() {
        builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix0>| {
            let dy = output_grad[()];
            let mut grad = Array2::zeros(u.raw_dim());
            for i in 0..b {
                let row = u.row(i);
                let max = row.iter().copied().fold(f32::MIN, f32::max);
                let denom = row.iter().map(|u| (u - max).exp()).sum::<f32>();
                for j in 0..b {
                    let softmax = (u[(i, j)] - max).exp() / denom;
                    let delta = if i == j { 1. } else { 0. };
                    grad[(i, j)] = dy * (delta - softmax) / b as f32;
                }
            }
            Ok(grad.into_shared())
        });
    }
    builder.build(ndarray::arr0(value).into_shared())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2, Array3, Array4};
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn measure_from_str() {
        assert_eq!(Measure::from_str("JSD").unwrap(), Measure::Jsd);
        assert_eq!(Measure::from_str("gan").unwrap(), Measure::Gan);
        assert_eq!(Measure::from_str("KL").unwrap(), Measure::Kl);
        assert!(Measure::from_str("wasserstein").is_err());
    }

    #[test]
    fn mode_from_str() {
        assert_eq!(MiMode::from_str("fd").unwrap(), MiMode::Fd);
        assert_eq!(MiMode::from_str("NCE").unwrap(), MiMode::Nce);
        assert!(MiMode::from_str("dv").is_err());
    }

    #[test]
    fn jsd_bound_zero_at_zero_scores() {
        let scores = Variable::from(Array2::<f32>::zeros([4, 4]));
        let bound = fd_bound(scores, Measure::Jsd);
        assert_relative_eq!(bound.item(), 0., epsilon = 1e-6);
    }

    #[test]
    fn jsd_bound_positive_for_separated_scores() {
        // Confident diagonal, anti-confident off-diagonal.
        let scores = Variable::from(arr2(&[[5.0f32, -5.], [-5., 5.]]));
        let bound = fd_bound(scores, Measure::Jsd);
        assert!(bound.item() > 1.);
    }

    #[test]
    fn nce_bound_at_zero_scores_is_negative_log_batch() {
        let scores = Variable::from(Array2::<f32>::zeros([8, 8]));
        let bound = nce_bound(scores);
        assert_relative_eq!(bound.item(), -(8.0f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn fd_gradients_match_finite_differences() -> Result<()> {
        let base = arr2(&[[0.5f32, -0.25, 0.1], [0.3, 0.7, -0.2], [0., 0.4, -0.6]]);
        let mut scores = Parameter::from(base.clone());
        scores.set_training(true);
        let bound = fd_bound(scores.to_variable(), Measure::Jsd);
        bound.backward()?;
        let analytic = scores.grad().unwrap();
        let eps = 1e-3;
        for index in [(0, 0), (1, 1), (0, 1), (2, 0)] {
            let mut up = base.clone();
            up[index] += eps;
            let mut down = base.clone();
            down[index] -= eps;
            let numeric = (fd_bound(Variable::from(up), Measure::Jsd).item()
                - fd_bound(Variable::from(down), Measure::Jsd).item())
                / (2. * eps);
            assert_relative_eq!(analytic[index], numeric, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn nce_gradients_match_finite_differences() -> Result<()> {
        let base = arr2(&[[1.0f32, 0.2], [-0.3, 0.8]]);
        let mut scores = Parameter::from(base.clone());
        scores.set_training(true);
        nce_bound(scores.to_variable()).backward()?;
        let analytic = scores.grad().unwrap();
        let eps = 1e-3;
        for index in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let mut up = base.clone();
            up[index] += eps;
            let mut down = base.clone();
            down[index] -= eps;
            let numeric =
                (nce_bound(Variable::from(up)).item() - nce_bound(Variable::from(down)).item())
                    / (2. * eps);
            assert_relative_eq!(analytic[index], numeric, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn loss_is_finite_and_backward_reaches_nets() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut loss_fn = MutualInfoLoss::new(4 * 4, 4, 8, Measure::Jsd, MiMode::Fd, &mut rng);
        for parameter in loss_fn.parameters_mut() {
            parameter.set_training(true);
        }
        let image = Variable::from(Array4::from_shape_fn([4, 1, 4, 4], |(b, _, i, j)| {
            (b as f32 + i as f32 - j as f32) * 0.1
        }));
        let embedding = Variable::from(Array3::from_shape_fn([4, 1, 4], |(b, _, k)| {
            (b as f32 - k as f32) * 0.1
        }));
        let loss = loss_fn.forward(image, embedding)?;
        assert!(loss.item().is_finite());
        loss.backward()?;
        assert!(loss_fn.parameters_mut().iter().all(|p| p.grad().is_some()));
        Ok(())
    }

    #[test]
    fn single_sample_batch_fails() {
        let mut rng = SmallRng::seed_from_u64(0);
        let loss_fn = MutualInfoLoss::new(4, 2, 8, Measure::Jsd, MiMode::Fd, &mut rng);
        let image = Variable::from(Array4::<f32>::zeros([1, 1, 2, 2]));
        let embedding = Variable::from(Array3::<f32>::zeros([1, 1, 2]));
        assert!(loss_fn.forward(image, embedding).is_err());
    }
}

//! Weight initialization.
//!
//! Networks are constructed with their layers' default initialization and then reinitialized
//! by an [`Initializer`]. Layer kinds are a closed set of tags resolved at construction time.

use crate::learn::neural_network::autograd::ParameterD;
use anyhow::{bail, Error, Result};
use ndarray::Zip;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Initialization scheme.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InitKind {
    /// N(0, 0.02) weights, batch norm N(1, 0.02), biases 0.
    Normal,
    /// Fan-in scaled normal weights, batch norm weight 1, biases 0.
    Kaiming,
}

impl FromStr for InitKind {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input {
            "normal" => Ok(Self::Normal),
            "kaiming" => Ok(Self::Kaiming),
            _ => bail!("initialization method {input:?} is not implemented!"),
        }
    }
}

/// The kind of layer a parameter belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LayerKind {
    /// Convolution weight.
    Conv,
    /// Dense weight.
    Linear,
    /// Batch normalization scale.
    BatchNorm,
}

/// Reinitializes parameters according to an [`InitKind`].
#[derive(Clone, Copy, Debug)]
pub struct Initializer {
    kind: InitKind,
}

impl Initializer {
    /// Creates an initializer for `kind`.
    pub fn new(kind: InitKind) -> Self {
        Self { kind }
    }
    /// Reinitializes a weight parameter of `layer` kind.
    pub fn init_weight<R: Rng>(
        &self,
        layer: LayerKind,
        weight: &mut ParameterD,
        rng: &mut R,
    ) -> Result<()> {
        let distribution = match (self.kind, layer) {
            (InitKind::Normal, LayerKind::Conv | LayerKind::Linear) => normal(0., 0.02)?,
            (InitKind::Normal, LayerKind::BatchNorm) => normal(1., 0.02)?,
            (InitKind::Kaiming, LayerKind::Conv | LayerKind::Linear) => {
                let fan_in = fan_in(weight.shape());
                normal(0., (2. / fan_in as f32).sqrt())?
            }
            (InitKind::Kaiming, LayerKind::BatchNorm) => {
                weight.value_view_mut().fill(1.);
                return Ok(());
            }
        };
        Zip::from(weight.value_view_mut()).for_each(|w| *w = distribution.sample(rng));
        Ok(())
    }
    /// Reinitializes a bias parameter with 0's.
    pub fn init_bias(&self, bias: &mut ParameterD) {
        bias.value_view_mut().fill(0.);
    }
}

fn normal(mean: f32, std_dev: f32) -> Result<Normal<f32>> {
    Normal::new(mean, std_dev).map_err(Error::msg)
}

fn fan_in(shape: &[usize]) -> usize {
    // (outputs, inputs, ...) weight layout; the receptive field multiplies in.
    shape.iter().skip(1).product::<usize>().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array4};
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn from_str_known_kinds() {
        assert_eq!(InitKind::from_str("normal").unwrap(), InitKind::Normal);
        assert_eq!(InitKind::from_str("kaiming").unwrap(), InitKind::Kaiming);
    }

    #[test]
    fn from_str_unknown_fails() {
        let err = InitKind::from_str("xavier").unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[test]
    fn normal_init_statistics() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut weight = Parameter::from(Array4::<f32>::zeros([64, 3, 7, 7])).into_dyn();
        Initializer::new(InitKind::Normal).init_weight(LayerKind::Conv, &mut weight, &mut rng)?;
        let n = weight.value().len() as f32;
        let mean = weight.value().iter().copied().sum::<f32>() / n;
        let std_dev = (weight.value().iter().map(|w| (w - mean).powi(2)).sum::<f32>() / n).sqrt();
        assert_relative_eq!(mean, 0., epsilon = 1e-3);
        assert_relative_eq!(std_dev, 0.02, epsilon = 5e-3);
        Ok(())
    }

    #[test]
    fn batch_norm_normal_init_centers_on_one() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut weight = Parameter::from(Array1::<f32>::zeros(256)).into_dyn();
        Initializer::new(InitKind::Normal).init_weight(
            LayerKind::BatchNorm,
            &mut weight,
            &mut rng,
        )?;
        let mean = weight.value().iter().copied().sum::<f32>() / 256.;
        assert_relative_eq!(mean, 1., epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn bias_init_zeroes() {
        let mut bias = Parameter::from(Array1::from_elem(4, 7.0f32)).into_dyn();
        Initializer::new(InitKind::Normal).init_bias(&mut bias);
        assert!(bias.value().iter().all(|b| *b == 0.));
    }

    #[test]
    fn seeded_init_reproducible() -> Result<()> {
        let initializer = Initializer::new(InitKind::Kaiming);
        let mut a = Parameter::from(Array4::<f32>::zeros([4, 2, 3, 3])).into_dyn();
        let mut b = Parameter::from(Array4::<f32>::zeros([4, 2, 3, 3])).into_dyn();
        initializer.init_weight(LayerKind::Conv, &mut a, &mut SmallRng::seed_from_u64(5))?;
        initializer.init_weight(LayerKind::Conv, &mut b, &mut SmallRng::seed_from_u64(5))?;
        assert_eq!(a.value(), b.value());
        Ok(())
    }
}

use crate::{
    init::{Initializer, LayerKind},
    learn::neural_network::{
        autograd::{ParameterD, Variable3, Variable4},
        layer::{BatchNorm2, Conv2, Forward, Layer, Linear},
    },
};
use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

const BASE: usize = 64;

/// Reconstruction network, measurement to image.
///
/// A bias-free [`Linear`] expands the flattened measurement `(b, c*m)` to `(b, c*h*w)`, which
/// is reshaped into an image and refined by five stages of `Conv → BN → ReLU` with kernels
/// 11x11, 1x1, 7x7, 11x11, 1x1, then a sixth bare `Conv 7x7` with `tanh`. All convolutions
/// are bias-free and padded to preserve the spatial size, and the final activation bounds the
/// output in `[-1, 1]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconNet {
    expand: Linear,
    stages: Vec<ConvStage>,
    output: Conv2,
    channels: usize,
    image_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ConvStage {
    conv: Conv2,
    norm: BatchNorm2,
}

impl ConvStage {
    fn new<R: Rng>(
        inputs: usize,
        outputs: usize,
        kernel: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            conv: Conv2::from_inputs_outputs_kernel(inputs, outputs, kernel, rng)
                .with_padding(padding),
            norm: BatchNorm2::from_channels(outputs),
        }
    }
    fn init<R: Rng>(&mut self, initializer: &Initializer, rng: &mut R) -> Result<()> {
        initializer.init_weight(LayerKind::Conv, self.conv.weight_mut(), rng)?;
        initializer.init_weight(LayerKind::BatchNorm, self.norm.weight_mut(), rng)?;
        initializer.init_bias(self.norm.bias_mut());
        Ok(())
    }
}

impl Layer for ConvStage {
    fn parameters_len(&self) -> usize {
        self.conv.parameters_len() + self.norm.parameters_len()
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        self.conv.collect_parameters_mut(parameters);
        self.norm.collect_parameters_mut(parameters);
    }
    fn set_training(&mut self, training: bool) {
        self.norm.set_training(training);
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
    }
}

impl Forward<Variable4> for ConvStage {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        Ok(input.forward(&self.conv)?.forward(&self.norm)?.relu())
    }
}

impl ReconNet {
    /// Creates a new [`ReconNet`] for `channels` x `image_size` x `image_size` images and a
    /// flattened measurement of `measurement_len` values.
    pub fn new<R: Rng>(
        channels: usize,
        image_size: usize,
        measurement_len: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let n = image_size * image_size;
        anyhow::ensure!(
            measurement_len >= 1,
            "ReconNet requires at least 1 measurement!"
        );
        let expand = Linear::from_inputs_outputs(measurement_len, channels * n, rng);
        let mut stages = Vec::with_capacity(5);
        stages.push(ConvStage::new(channels, BASE, 11, 5, rng));
        stages.push(ConvStage::new(BASE, BASE / 2, 1, 0, rng));
        stages.push(ConvStage::new(BASE / 2, channels, 7, 3, rng));
        stages.push(ConvStage::new(channels, BASE, 11, 5, rng));
        stages.push(ConvStage::new(BASE, BASE / 2, 1, 0, rng));
        let output = Conv2::from_inputs_outputs_kernel(BASE / 2, channels, 7, rng).with_padding(3);
        Ok(Self {
            expand,
            stages,
            output,
            channels,
            image_size,
        })
    }
    /// Reinitializes the weights.
    pub fn init<R: Rng>(&mut self, initializer: &Initializer, rng: &mut R) -> Result<()> {
        initializer.init_weight(LayerKind::Linear, self.expand.weight_mut(), rng)?;
        for stage in self.stages.iter_mut() {
            stage.init(initializer, rng)?;
        }
        initializer.init_weight(LayerKind::Conv, self.output.weight_mut(), rng)?;
        Ok(())
    }
}

impl Layer for ReconNet {
    fn parameters_len(&self) -> usize {
        self.expand.parameters_len()
            + self
                .stages
                .iter()
                .map(ConvStage::parameters_len)
                .sum::<usize>()
            + self.output.parameters_len()
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        self.expand.collect_parameters_mut(parameters);
        for stage in self.stages.iter_mut() {
            stage.collect_parameters_mut(parameters);
        }
        self.output.collect_parameters_mut(parameters);
    }
    fn set_training(&mut self, training: bool) {
        self.expand.set_training(training);
        for stage in self.stages.iter_mut() {
            stage.set_training(training);
        }
        self.output.set_training(training);
    }
}

impl Forward<Variable3> for ReconNet {
    type Output = Variable4;
    fn forward(&self, input: Variable3) -> Result<Variable4> {
        let (batch_size, channels, measurements) = input.dim();
        anyhow::ensure!(
            channels * measurements == self.expand.inputs(),
            "ReconNet expected a flattened measurement of {} values, found {}!",
            self.expand.inputs(),
            channels * measurements
        );
        let flat = input.into_shape([batch_size, channels * measurements])?;
        let expanded = self.expand.forward(flat)?;
        let mut x = expanded.into_shape([
            batch_size,
            self.channels,
            self.image_size,
            self.image_size,
        ])?;
        for stage in self.stages.iter() {
            x = x.forward(stage)?;
        }
        Ok(x.forward(&self.output)?.tanh())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Variable;
    use ndarray::Array3;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn output_shape_and_bounds() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let net = ReconNet::new(1, 8, 6, &mut rng)?;
        // Large measurements still map into [-1, 1].
        let input = Variable::from(Array3::from_elem([2, 1, 6], 100.0f32));
        let output = net.forward(input)?;
        assert_eq!(output.shape(), [2, 1, 8, 8]);
        assert!(output.value().iter().all(|x| (-1. ..=1.).contains(x)));
        Ok(())
    }

    #[test]
    fn stage_channel_arithmetic() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut net = ReconNet::new(3, 8, 6, &mut rng).unwrap();
        // 1 expand weight + 5 stages x (conv + bn weight + bn bias) + output conv.
        assert_eq!(net.parameters_mut().len(), 1 + 5 * 3 + 1);
    }

    #[test]
    fn init_reinitializes_weights() -> Result<()> {
        use crate::init::{InitKind, Initializer};
        let mut rng = SmallRng::seed_from_u64(0);
        let mut net = ReconNet::new(1, 4, 4, &mut rng)?;
        let before = net.parameters_mut()[0].value().to_owned();
        net.init(
            &Initializer::new(InitKind::Normal),
            &mut SmallRng::seed_from_u64(1),
        )?;
        let after = net.parameters_mut()[0].value().to_owned();
        assert_ne!(before, after);
        Ok(())
    }
}

use crate::{
    init::{Initializer, LayerKind},
    learn::neural_network::{
        autograd::{ParameterD, Variable, Variable4},
        layer::{concat_channels, split_channels, BatchNorm2, Conv2, Forward, Layer},
    },
};
use anyhow::{bail, Result};
use ndarray::{Array4, ArrayView4, Ix4};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Invertible feature extractor.
///
/// An invertible space-to-depth stem quadruples the channels while halving the spatial size,
/// the channels are split into two halves, and stages of additive coupling blocks
/// `(x1, x2) → (x2, x1 + F(x2))` mix them. Every step has an exact inverse, so
/// [`inverse`](Self::inverse) reconstructs the input of [`forward`](Forward::forward) exactly
/// (running statistics must not move between the two calls, so invert in evaluation mode).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IRevNet {
    blocks: Vec<CouplingBlock>,
    stride: usize,
    channels: usize,
}

impl IRevNet {
    /// Creates a new [`IRevNet`] for `channels` input channels with per-stage block counts
    /// and bottleneck widths.
    ///
    /// **Errors**
    ///
    /// `n_blocks` and `n_channels` must have equal lengths.
    pub fn new<R: Rng>(
        channels: usize,
        n_blocks: &[usize],
        n_channels: &[usize],
        rng: &mut R,
    ) -> Result<Self> {
        if n_blocks.len() != n_channels.len() {
            bail!(
                "expected one bottleneck width per stage, found {} widths for {} stages!",
                n_channels.len(),
                n_blocks.len()
            );
        }
        let stride = 2;
        // The stem maps channels -> channels * stride², split evenly between the halves.
        let half = channels * stride * stride / 2;
        let mut blocks = Vec::new();
        for (blocks_in_stage, width) in n_blocks.iter().zip(n_channels.iter()) {
            for _ in 0..*blocks_in_stage {
                blocks.push(CouplingBlock::new(half, *width, rng));
            }
        }
        Ok(Self {
            blocks,
            stride,
            channels,
        })
    }
    /// Reinitializes the weights.
    pub fn init<R: Rng>(&mut self, initializer: &Initializer, rng: &mut R) -> Result<()> {
        for block in self.blocks.iter_mut() {
            block.bottleneck.init(initializer, rng)?;
        }
        Ok(())
    }
    /// Exactly inverts [`forward`](Forward::forward).
    ///
    /// Runs on plain tensors without gradient tracking.
    pub fn inverse(&self, output: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (_, channels, _, _) = output.dim();
        if channels != self.channels * self.stride * self.stride {
            bail!(
                "inverse expected {} channels, found {channels}!",
                self.channels * self.stride * self.stride
            );
        }
        let half = channels / 2;
        let mut y1 = output
            .slice_axis(ndarray::Axis(1), ndarray::Slice::from(..half))
            .to_owned();
        let mut y2 = output
            .slice_axis(ndarray::Axis(1), ndarray::Slice::from(half..))
            .to_owned();
        for block in self.blocks.iter().rev() {
            // (y1, y2) = (x2, x1 + F(x2)), so x2 = y1 and x1 = y2 - F(y1).
            let f = block
                .bottleneck
                .forward(Variable::from(y1.clone()))?
                .into_value();
            let x1 = &y2 - &f;
            y2 = y1;
            y1 = x1;
        }
        let merged = ndarray::concatenate(ndarray::Axis(1), &[y1.view(), y2.view()])?;
        Ok(depth_to_space(&merged.view(), self.stride))
    }
}

impl Layer for IRevNet {
    fn parameters_len(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.bottleneck.parameters_len())
            .sum()
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        for block in self.blocks.iter_mut() {
            block.bottleneck.collect_parameters_mut(parameters);
        }
    }
    fn set_training(&mut self, training: bool) {
        for block in self.blocks.iter_mut() {
            block.bottleneck.set_training(training);
        }
    }
}

impl Forward<Variable4> for IRevNet {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let stacked = psi(input, self.stride)?;
        let (mut x1, mut x2) = split_channels(&stacked)?;
        for block in self.blocks.iter() {
            let fx2 = block.bottleneck.forward(x2.clone())?;
            let y2 = x1.add(&fx2)?;
            x1 = x2;
            x2 = y2;
        }
        concat_channels(&x1, &x2)
    }
}

/// One additive coupling block.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CouplingBlock {
    bottleneck: Bottleneck,
}

impl CouplingBlock {
    fn new<R: Rng>(half: usize, width: usize, rng: &mut R) -> Self {
        Self {
            bottleneck: Bottleneck::new(half, width, rng),
        }
    }
}

/// The residual function `F`: three rounds of `BN → ReLU → Conv 3x3`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Bottleneck {
    norm1: BatchNorm2,
    conv1: Conv2,
    norm2: BatchNorm2,
    conv2: Conv2,
    norm3: BatchNorm2,
    conv3: Conv2,
}

impl Bottleneck {
    fn new<R: Rng>(half: usize, width: usize, rng: &mut R) -> Self {
        Self {
            norm1: BatchNorm2::from_channels(half),
            conv1: Conv2::from_inputs_outputs_kernel(half, width, 3, rng).with_padding(1),
            norm2: BatchNorm2::from_channels(width),
            conv2: Conv2::from_inputs_outputs_kernel(width, width, 3, rng).with_padding(1),
            norm3: BatchNorm2::from_channels(width),
            conv3: Conv2::from_inputs_outputs_kernel(width, half, 3, rng).with_padding(1),
        }
    }
    fn init<R: Rng>(&mut self, initializer: &Initializer, rng: &mut R) -> Result<()> {
        for (norm, conv) in [
            (&mut self.norm1, &mut self.conv1),
            (&mut self.norm2, &mut self.conv2),
            (&mut self.norm3, &mut self.conv3),
        ] {
            initializer.init_weight(LayerKind::BatchNorm, norm.weight_mut(), rng)?;
            initializer.init_bias(norm.bias_mut());
            initializer.init_weight(LayerKind::Conv, conv.weight_mut(), rng)?;
        }
        Ok(())
    }
}

impl Layer for Bottleneck {
    fn parameters_len(&self) -> usize {
        3 * (self.norm1.parameters_len() + self.conv1.parameters_len())
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        self.norm1.collect_parameters_mut(parameters);
        self.conv1.collect_parameters_mut(parameters);
        self.norm2.collect_parameters_mut(parameters);
        self.conv2.collect_parameters_mut(parameters);
        self.norm3.collect_parameters_mut(parameters);
        self.conv3.collect_parameters_mut(parameters);
    }
    fn set_training(&mut self, training: bool) {
        self.norm1.set_training(training);
        self.norm2.set_training(training);
        self.norm3.set_training(training);
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
    }
}

impl Forward<Variable4> for Bottleneck {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input
            .forward(&self.norm1)?
            .relu()
            .forward(&self.conv1)?
            .forward(&self.norm2)?
            .relu()
            .forward(&self.conv2)?
            .forward(&self.norm3)?
            .relu()
            .forward(&self.conv3)
    }
}

/// Invertible space-to-depth with backward.
fn psi(input: Variable4, stride: usize) -> Result<Variable4> {
    let (_, _, h, w) = input.dim();
    if h % stride != 0 || w % stride != 0 {
        bail!("psi stride {stride} does not divide input ({h}, {w})!");
    }
    let value = space_to_depth(&input.value().view(), stride);
    let mut builder = Variable::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix4>| {
            Ok(depth_to_space(&output_grad.view(), stride).into_shared())
        });
    }
    Ok(builder.build(value.into_shared()))
}

fn space_to_depth(x: &ArrayView4<f32>, stride: usize) -> Array4<f32> {
    let (batch_size, channels, h, w) = x.dim();
    let (ho, wo) = (h / stride, w / stride);
    let mut y = Array4::zeros([batch_size, channels * stride * stride, ho, wo]);
    for b in 0..batch_size {
        for c in 0..channels {
            for si in 0..stride {
                for sj in 0..stride {
                    let co = c * stride * stride + si * stride + sj;
                    for i in 0..ho {
                        for j in 0..wo {
                            y[(b, co, i, j)] = x[(b, c, i * stride + si, j * stride + sj)];
                        }
                    }
                }
            }
        }
    }
    y
}

fn depth_to_space(y: &ArrayView4<f32>, stride: usize) -> Array4<f32> {
    let (batch_size, channels_out, ho, wo) = y.dim();
    let channels = channels_out / (stride * stride);
    let mut x = Array4::zeros([batch_size, channels, ho * stride, wo * stride]);
    for b in 0..batch_size {
        for c in 0..channels {
            for si in 0..stride {
                for sj in 0..stride {
                    let co = c * stride * stride + si * stride + sj;
                    for i in 0..ho {
                        for j in 0..wo {
                            x[(b, c, i * stride + si, j * stride + sj)] = y[(b, co, i, j)];
                        }
                    }
                }
            }
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array4;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn space_depth_round_trip() {
        let x = Array4::from_shape_fn([2, 3, 4, 4], |(b, c, i, j)| {
            (b * 1000 + c * 100 + i * 10 + j) as f32
        });
        let y = space_to_depth(&x.view(), 2);
        assert_eq!(y.dim(), (2, 12, 2, 2));
        assert_eq!(depth_to_space(&y.view(), 2), x);
    }

    #[test]
    fn forward_shape() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let net = IRevNet::new(3, &[4, 4, 4], &[16, 16, 16], &mut rng)?;
        let input = Variable::from(Array4::<f32>::zeros([2, 3, 32, 32]));
        let output = net.forward(input)?;
        assert_eq!(output.shape(), [2, 12, 16, 16]);
        Ok(())
    }

    #[test]
    fn inverse_of_forward_is_identity() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(7);
        let net = IRevNet::new(1, &[2, 2], &[4, 4], &mut rng)?;
        let input = Array4::from_shape_fn([1, 1, 8, 8], |(_, _, i, j)| {
            ((i as f32) - (j as f32)) * 0.1
        });
        let output = net.forward(Variable::from(input.clone()))?;
        let recovered = net.inverse(&output.value().view())?;
        for (x, r) in input.iter().zip(recovered.iter()) {
            assert_relative_eq!(x, r, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn stage_mismatch_fails() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(IRevNet::new(3, &[4, 4, 4], &[16, 16], &mut rng).is_err());
    }
}

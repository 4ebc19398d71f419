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

/// Learned encoder producing the measurement of an image batch.
///
/// In linear mode, each channel is flattened to `n = h * w` and projected to `m = n / cr`
/// measurements by a bias-free [`Linear`]; a second bias-free [`Linear`] decodes the
/// measurement back to a proxy image of the input shape. In convolutional mode a strided
/// [`Conv2`] + [`BatchNorm2`] produce a feature map that is flattened into the measurement,
/// with no proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Encoder {
    mode: Mode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Mode {
    Linear { measure: Linear, decode: Linear },
    Conv { conv: Conv2, norm: BatchNorm2 },
}

impl Encoder {
    /// Creates a linear encoder for `channels` x `image_size` x `image_size` images
    /// compressed by `cr`.
    ///
    /// **Errors**
    ///
    /// `image_size² / cr` must be at least 1.
    pub fn linear<R: Rng>(image_size: usize, cr: usize, rng: &mut R) -> Result<Self> {
        let n = image_size * image_size;
        anyhow::ensure!(
            cr >= 1 && n / cr >= 1,
            "compression ratio {cr} leaves no measurements for {image_size}x{image_size} images!"
        );
        let m = n / cr;
        let measure = Linear::from_inputs_outputs(n, m, rng);
        let decode = Linear::from_inputs_outputs(m, n, rng);
        Ok(Self {
            mode: Mode::Linear { measure, decode },
        })
    }
    /// Creates a convolutional encoder with `outputs` feature channels and a square strided
    /// kernel.
    pub fn conv<R: Rng>(
        channels: usize,
        outputs: usize,
        kernel: usize,
        stride: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let conv = Conv2::from_inputs_outputs_kernel(channels, outputs, kernel, rng)
            .with_stride(stride);
        let norm = BatchNorm2::from_channels(outputs);
        Ok(Self {
            mode: Mode::Conv { conv, norm },
        })
    }
    /// The measurement length per channel in linear mode.
    pub fn measurements(&self) -> Option<usize> {
        match &self.mode {
            Mode::Linear { measure, .. } => Some(measure.outputs()),
            Mode::Conv { .. } => None,
        }
    }
    /// Reinitializes the weights.
    pub fn init<R: Rng>(&mut self, initializer: &Initializer, rng: &mut R) -> Result<()> {
        match &mut self.mode {
            Mode::Linear { measure, decode } => {
                initializer.init_weight(LayerKind::Linear, measure.weight_mut(), rng)?;
                initializer.init_weight(LayerKind::Linear, decode.weight_mut(), rng)?;
            }
            Mode::Conv { conv, norm } => {
                initializer.init_weight(LayerKind::Conv, conv.weight_mut(), rng)?;
                initializer.init_weight(LayerKind::BatchNorm, norm.weight_mut(), rng)?;
                initializer.init_bias(norm.bias_mut());
            }
        }
        Ok(())
    }
}

impl Layer for Encoder {
    fn parameters_len(&self) -> usize {
        match &self.mode {
            Mode::Linear { .. } => 2,
            Mode::Conv { conv, norm } => conv.parameters_len() + norm.parameters_len(),
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        match &mut self.mode {
            Mode::Linear { measure, decode } => {
                measure.collect_parameters_mut(parameters);
                decode.collect_parameters_mut(parameters);
            }
            Mode::Conv { conv, norm } => {
                conv.collect_parameters_mut(parameters);
                norm.collect_parameters_mut(parameters);
            }
        }
    }
    fn set_training(&mut self, training: bool) {
        if let Mode::Conv { norm, .. } = &mut self.mode {
            norm.set_training(training);
        }
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
    }
}

impl Forward<Variable4> for Encoder {
    /// The measurement and, in linear mode, the decoded proxy image.
    type Output = (Variable3, Option<Variable4>);
    fn forward(&self, input: Variable4) -> Result<Self::Output> {
        let (batch_size, channels, h, w) = input.dim();
        match &self.mode {
            Mode::Linear { measure, decode } => {
                let flat = input.into_shape([batch_size, channels, h * w])?;
                let measurement: Variable3 = measure.forward(flat)?;
                let proxy = decode
                    .forward(measurement.clone())?
                    .into_shape([batch_size, channels, h, w])?;
                Ok((measurement, Some(proxy)))
            }
            Mode::Conv { conv, norm } => {
                let features = input.forward(conv)?.forward(norm)?;
                let (batch_size, co, ho, wo) = features.dim();
                let measurement = features.into_shape([batch_size, 1, co * ho * wo])?;
                Ok((measurement, None))
            }
        }
    }
}

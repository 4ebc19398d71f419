use super::{
    autograd::{Parameter, ParameterD, Variable, Variable2, Variable3, Variable4},
    optimizer::Optimizer,
};
use anyhow::{bail, Result};
use ndarray::{
    Array1, Array2, Array3, Array4, ArrayView4, Axis, Dimension, Ix1, Ix2, Ix4,
};
use parking_lot::RwLock;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
pub trait Forward<X> {
    /// The output type.
    type Output;
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`]'s are expected to apply backward ops via
    /// [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed. Generally the implementation
    /// should return an error instead of panicking.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection and utility methods.
pub trait Layer: Send + Sync + 'static {
    /// The number of parameters.
    ///
    /// This is the length of [`.parameters_mut()`](Self::parameters_mut).
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {}
    /// Enumerates mutable references to the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Vec<&mut ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// Enables / disables training for all parameters.
    ///
    /// Layers with distinct train / eval behavior (ie [`BatchNorm2`]) override this to switch
    /// modes as well.
    fn set_training(&mut self, training: bool) {
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
    }
    /// Updates the layer with the optimizer.
    ///
    /// Call this method on the network after one or more backward passes.
    fn update<O: Optimizer>(&mut self, learning_rate: f32, optimizer: &O) -> Result<()>
    where
        Self: Sized,
    {
        for parameter in self.parameters_mut() {
            optimizer.update(learning_rate, parameter)?;
        }
        Ok(())
    }
}

fn xavier(inputs: usize, outputs: usize) -> Uniform<f32> {
    let a = (6. / (inputs as f32 + outputs as f32)).sqrt();
    Uniform::new(-a, a)
}

fn he_normal(mut inputs: usize) -> Normal<f32> {
    if inputs == 0 {
        inputs = 1;
    }
    Normal::new(0., (2. / inputs as f32).sqrt()).unwrap()
}

/// Dense / fully connected layer.
///
/// Applied along the last axis of the input, so a `(batch, channels, n)` input maps to
/// `(batch, channels, outputs)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Linear {
    weight: ParameterD,
    bias: Option<ParameterD>,
}

impl Linear {
    /// Creates a new [`Linear`] for `inputs` and `outputs`.
    ///
    /// The weight has shape `(outputs, inputs)`, initialized with a normal distribution with
    /// std_dev = sqrt(2 / inputs).
    pub fn from_inputs_outputs<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let data = he_normal(inputs)
            .sample_iter(rng)
            .take(inputs * outputs)
            .collect::<Vec<_>>();
        let weight = Parameter::from(Array2::from_shape_vec([outputs, inputs], data).unwrap());
        Self {
            weight: weight.into_dyn(),
            bias: None,
        }
    }
    /// Adds a bias to the layer, initialized with 0's.
    pub fn with_bias(mut self, bias: bool) -> Self {
        if bias {
            let outputs = self.weight.shape()[0];
            self.bias
                .replace(Parameter::from(Array1::<f32>::zeros(outputs)).into_dyn());
        } else {
            self.bias = None;
        }
        self
    }
    /// The weight parameter.
    pub fn weight_mut(&mut self) -> &mut ParameterD {
        &mut self.weight
    }
    /// The number of inputs.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1]
    }
    /// The number of outputs.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Layer for Linear {
    fn parameters_len(&self) -> usize {
        1 + usize::from(self.bias.is_some())
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias);
        }
    }
}

impl Forward<Variable2> for Linear {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Variable2> {
        let weight = self.weight.clone().into_dimensionality::<Ix2>()?;
        let output = input.dot(&weight.to_variable().t())?;
        if let Some(bias) = self.bias.as_ref() {
            let bias = bias.clone().into_dimensionality::<Ix1>()?;
            Ok(output.add_bias(&bias.to_variable()))
        } else {
            Ok(output)
        }
    }
}

impl Forward<Variable3> for Linear {
    type Output = Variable3;
    fn forward(&self, input: Variable3) -> Result<Variable3> {
        let (batch_size, channels, inputs) = input.dim();
        let flat: Variable2 = input.into_shape([batch_size * channels, inputs])?;
        let output = <Self as Forward<Variable2>>::forward(self, flat)?
            .into_shape([batch_size, channels, self.outputs()])?;
        Ok(output)
    }
}

/// Convolutional layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conv2 {
    weight: ParameterD,
    bias: Option<ParameterD>,
    stride: usize,
    padding: usize,
}

impl Conv2 {
    /// Creates a new [`Conv2`] for `inputs`, `outputs`, and a square `kernel`.
    ///
    /// Defaults:
    /// - stride: 1
    /// - padding: 0
    /// - bias: None
    ///
    /// The kernel has shape `(outputs, inputs, kernel, kernel)`, initialized with a uniform
    /// distribution of (-a, a) where a = sqrt(6 / (inputs + outputs)).
    pub fn from_inputs_outputs_kernel<R: Rng>(
        inputs: usize,
        outputs: usize,
        kernel: usize,
        rng: &mut R,
    ) -> Self {
        let data = xavier(inputs, outputs)
            .sample_iter(rng)
            .take(outputs * inputs * kernel * kernel)
            .collect::<Vec<_>>();
        let weight =
            Parameter::from(Array4::from_shape_vec([outputs, inputs, kernel, kernel], data).unwrap());
        Self {
            weight: weight.into_dyn(),
            bias: None,
            stride: 1,
            padding: 0,
        }
    }
    /// Adds `stride`.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }
    /// Adds zero `padding` on each side.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }
    /// Adds a bias to the layer, initialized with 0's.
    pub fn with_bias(mut self, bias: bool) -> Self {
        if bias {
            let outputs = self.weight.shape()[0];
            self.bias
                .replace(Parameter::from(Array1::<f32>::zeros(outputs)).into_dyn());
        } else {
            self.bias = None;
        }
        self
    }
    /// The weight parameter.
    pub fn weight_mut(&mut self) -> &mut ParameterD {
        &mut self.weight
    }
}

impl Layer for Conv2 {
    fn parameters_len(&self) -> usize {
        1 + usize::from(self.bias.is_some())
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias);
        }
    }
}

impl Forward<Variable4> for Conv2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let weight = self.weight.clone().into_dimensionality::<Ix4>()?;
        let (outputs, inputs, kh, kw) = weight.value().dim();
        let (_batch_size, channels, h, w) = input.dim();
        if channels != inputs {
            bail!(
                "Conv2 expected {inputs} input channels, found {channels}!"
            );
        }
        if h + 2 * self.padding < kh || w + 2 * self.padding < kw {
            bail!(
                "Conv2 kernel ({kh}, {kw}) does not fit input ({h}, {w}) with padding {}!",
                self.padding
            );
        }
        let (stride, padding) = (self.stride, self.padding);
        let value = conv2d(
            &input.value().view(),
            &weight.value().view(),
            stride,
            padding,
        );
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            let input_dim = input.raw_dim();
            builder.edge(node, move |output_grad| {
                Ok(
                    conv2d_backward_input(&weight.view(), &output_grad.view(), input_dim, stride, padding)
                        .into_shared(),
                )
            });
        }
        let weight_variable = weight.to_variable();
        if let Some(node) = weight_variable.node() {
            let input = input.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(
                    conv2d_backward_weight(
                        &input.view(),
                        &output_grad.view(),
                        [outputs, inputs, kh, kw],
                        stride,
                        padding,
                    )
                    .into_shared(),
                )
            });
        }
        let value = if let Some(bias) = self.bias.as_ref() {
            let bias = bias.clone().into_dimensionality::<Ix1>()?;
            let bias_variable = bias.to_variable();
            if let Some(node) = bias_variable.node() {
                builder.edge(node, |output_grad: ndarray::ArcArray<f32, Ix4>| {
                    Ok(output_grad
                        .sum_axis(Axis(3))
                        .sum_axis(Axis(2))
                        .sum_axis(Axis(0))
                        .into_shared())
                });
            }
            let mut value = value;
            let bias = bias_variable.into_value();
            for (mut channel, bias) in value.axis_iter_mut(Axis(1)).zip(bias.iter().copied()) {
                channel.mapv_inplace(|x| x + bias);
            }
            value
        } else {
            value
        };
        Ok(builder.build(value.into_shared()))
    }
}

/// Batch normalization over the channel axis of a 4 dimensional input.
///
/// In training mode, normalizes with the batch statistics and updates the running estimates;
/// in evaluation mode, normalizes with the running estimates. This is the only source of
/// train / eval divergence in the networks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchNorm2 {
    weight: ParameterD,
    bias: ParameterD,
    #[serde(
        serialize_with = "serialize_running",
        deserialize_with = "deserialize_running"
    )]
    running: Arc<RwLock<RunningStats>>,
    momentum: f32,
    epsilon: f32,
    #[serde(skip)]
    training: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunningStats {
    mean: Array1<f32>,
    var: Array1<f32>,
}

fn serialize_running<S: Serializer>(
    running: &Arc<RwLock<RunningStats>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    running.read().serialize(serializer)
}

fn deserialize_running<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Arc<RwLock<RunningStats>>, D::Error> {
    Ok(Arc::new(RwLock::new(RunningStats::deserialize(
        deserializer,
    )?)))
}

impl BatchNorm2 {
    /// Creates a new [`BatchNorm2`] for `channels`.
    ///
    /// The weight is initialized with 1's, the bias with 0's, the running statistics with
    /// mean 0 and var 1. Momentum defaults to 0.1, epsilon to 1e-5.
    pub fn from_channels(channels: usize) -> Self {
        Self {
            weight: Parameter::from(Array1::<f32>::ones(channels)).into_dyn(),
            bias: Parameter::from(Array1::<f32>::zeros(channels)).into_dyn(),
            running: Arc::new(RwLock::new(RunningStats {
                mean: Array1::zeros(channels),
                var: Array1::ones(channels),
            })),
            momentum: 0.1,
            epsilon: 1e-5,
            training: false,
        }
    }
    /// The weight (scale) parameter.
    pub fn weight_mut(&mut self) -> &mut ParameterD {
        &mut self.weight
    }
    /// The bias (shift) parameter.
    pub fn bias_mut(&mut self) -> &mut ParameterD {
        &mut self.bias
    }
}

impl Layer for BatchNorm2 {
    fn parameters_len(&self) -> usize {
        2
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        parameters.push(&mut self.bias);
    }
    fn set_training(&mut self, training: bool) {
        self.training = training;
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
    }
}

impl Forward<Variable4> for BatchNorm2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (batch_size, channels, h, w) = input.dim();
        if self.weight.shape() != [channels] {
            bail!(
                "BatchNorm2 expected {:?} channels, found {channels}!",
                self.weight.shape()
            );
        }
        let weight = self.weight.clone().into_dimensionality::<Ix1>()?;
        let bias = self.bias.clone().into_dimensionality::<Ix1>()?;
        let n = (batch_size * h * w) as f32;
        let (mean, var) = if self.training {
            let mean = channel_mean(&input.value().view());
            let var = channel_var(&input.value().view(), &mean);
            let mut running = self.running.write();
            // PyTorch stores the unbiased variance in the running estimate.
            let unbiased = var.mapv(|v| v * n / (n - 1.).max(1.));
            running.mean = (1. - self.momentum) * &running.mean + self.momentum * &mean;
            running.var = (1. - self.momentum) * &running.var + self.momentum * &unbiased;
            (mean, var)
        } else {
            let running = self.running.read();
            (running.mean.clone(), running.var.clone())
        };
        let inv_std = var.mapv(|v| 1. / (v + self.epsilon).sqrt());
        let mut x_hat = input.value().to_owned();
        for (mut channel, (mean, inv_std)) in x_hat
            .axis_iter_mut(Axis(1))
            .zip(mean.iter().copied().zip(inv_std.iter().copied()))
        {
            channel.mapv_inplace(|x| (x - mean) * inv_std);
        }
        let x_hat = x_hat.into_shared();
        let mut value = x_hat.to_owned();
        for (mut channel, (weight, bias)) in value.axis_iter_mut(Axis(1)).zip(
            weight
                .value()
                .iter()
                .copied()
                .zip(bias.value().iter().copied()),
        ) {
            channel.mapv_inplace(|x| weight * x + bias);
        }
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let x_hat = x_hat.clone();
            let weight = weight.value().clone();
            let inv_std = inv_std.clone();
            let training = self.training;
            builder.edge(node, move |output_grad| {
                if training {
                    Ok(batch_norm_backward_input(
                        &output_grad.view(),
                        &x_hat.view(),
                        &weight.view(),
                        &inv_std.view(),
                    )
                    .into_shared())
                } else {
                    let mut input_grad = output_grad.to_owned();
                    for (mut channel, (weight, inv_std)) in input_grad
                        .axis_iter_mut(Axis(1))
                        .zip(weight.iter().copied().zip(inv_std.iter().copied()))
                    {
                        channel.mapv_inplace(|dy| dy * weight * inv_std);
                    }
                    Ok(input_grad.into_shared())
                }
            });
        }
        let weight_variable = weight.to_variable();
        if let Some(node) = weight_variable.node() {
            let x_hat = x_hat.clone();
            builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix4>| {
                let mut weight_grad = Array1::<f32>::zeros(channels);
                for ((dy, x_hat), weight_grad) in output_grad
                    .axis_iter(Axis(1))
                    .zip(x_hat.axis_iter(Axis(1)))
                    .zip(weight_grad.iter_mut())
                {
                    *weight_grad = dy
                        .iter()
                        .copied()
                        .zip(x_hat.iter().copied())
                        .map(|(dy, x_hat)| dy * x_hat)
                        .sum();
                }
                Ok(weight_grad.into_shared())
            });
        }
        let bias_variable = bias.to_variable();
        if let Some(node) = bias_variable.node() {
            builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix4>| {
                Ok(output_grad
                    .sum_axis(Axis(3))
                    .sum_axis(Axis(2))
                    .sum_axis(Axis(0))
                    .into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

/// ReLU activation.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Relu {}

impl Layer for Relu {}

impl<D: Dimension + 'static> Forward<Variable<D>> for Relu {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        Ok(input.relu())
    }
}

/// Tanh activation.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Tanh {}

impl Layer for Tanh {}

impl<D: Dimension + 'static> Forward<Variable<D>> for Tanh {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        Ok(input.tanh())
    }
}

/// Concatenates two variables along the channel axis.
pub fn concat_channels(a: &Variable4, b: &Variable4) -> Result<Variable4> {
    let channels_a = a.shape()[1];
    let channels_b = b.shape()[1];
    let value = ndarray::concatenate(Axis(1), &[a.value().view(), b.value().view()])?;
    let mut builder = Variable::builder();
    if let Some(node) = a.node() {
        builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix4>| {
            Ok(output_grad
                .slice_axis(Axis(1), ndarray::Slice::from(..channels_a))
                .to_owned()
                .into_shared())
        });
    }
    if let Some(node) = b.node() {
        builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix4>| {
            Ok(output_grad
                .slice_axis(Axis(1), ndarray::Slice::from(channels_a..channels_a + channels_b))
                .to_owned()
                .into_shared())
        });
    }
    Ok(builder.build(value.into_shared()))
}

/// Splits a variable into two halves along the channel axis.
///
/// **Errors**
///
/// The channel count must be even.
pub fn split_channels(input: &Variable4) -> Result<(Variable4, Variable4)> {
    let (batch_size, channels, h, w) = input.dim();
    if channels % 2 != 0 {
        bail!("split_channels requires an even channel count, found {channels}!");
    }
    let half = channels / 2;
    let dim = input.raw_dim();
    let mut outputs = Vec::with_capacity(2);
    for index in 0..2 {
        let range = if index == 0 { 0..half } else { half..channels };
        let value = input
            .value()
            .slice_axis(Axis(1), ndarray::Slice::from(range.clone()))
            .to_owned();
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let dim = dim.clone();
            let range = range.clone();
            builder.edge(node, move |output_grad: ndarray::ArcArray<f32, Ix4>| {
                let mut input_grad = Array4::<f32>::zeros([batch_size, channels, h, w]);
                input_grad
                    .slice_axis_mut(Axis(1), ndarray::Slice::from(range))
                    .assign(&output_grad);
                debug_assert_eq!(input_grad.raw_dim(), dim.clone());
                Ok(input_grad.into_shared())
            });
        }
        outputs.push(builder.build(value.into_shared()));
    }
    let x2 = outputs.pop().unwrap();
    let x1 = outputs.pop().unwrap();
    Ok((x1, x2))
}

fn channel_mean(x: &ArrayView4<f32>) -> Array1<f32> {
    let (batch_size, channels, h, w) = x.dim();
    let n = (batch_size * h * w) as f32;
    let mut mean = Array1::zeros(channels);
    for (x, mean) in x.axis_iter(Axis(1)).zip(mean.iter_mut()) {
        *mean = x.iter().copied().sum::<f32>() / n;
    }
    mean
}

fn channel_var(x: &ArrayView4<f32>, mean: &Array1<f32>) -> Array1<f32> {
    let (batch_size, _channels, h, w) = x.dim();
    let n = (batch_size * h * w) as f32;
    let mut var = Array1::zeros(mean.raw_dim());
    for ((x, mean), var) in x
        .axis_iter(Axis(1))
        .zip(mean.iter().copied())
        .zip(var.iter_mut())
    {
        *var = x.iter().copied().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
    }
    var
}

fn batch_norm_backward_input(
    dy: &ArrayView4<f32>,
    x_hat: &ArrayView4<f32>,
    weight: &ndarray::ArrayView1<f32>,
    inv_std: &ndarray::ArrayView1<f32>,
) -> Array4<f32> {
    let (batch_size, _channels, h, w) = dy.dim();
    let n = (batch_size * h * w) as f32;
    let mut dx = Array4::zeros(dy.raw_dim());
    for (channel, ((dy, x_hat), mut dx)) in dy
        .axis_iter(Axis(1))
        .zip(x_hat.axis_iter(Axis(1)))
        .zip(dx.axis_iter_mut(Axis(1)))
        .enumerate()
    {
        let sum_dy = dy.iter().copied().sum::<f32>();
        let sum_dy_x_hat = dy
            .iter()
            .copied()
            .zip(x_hat.iter().copied())
            .map(|(dy, x_hat)| dy * x_hat)
            .sum::<f32>();
        let scale = weight[channel] * inv_std[channel] / n;
        ndarray::Zip::from(&mut dx)
            .and(&dy)
            .and(&x_hat)
            .for_each(|dx, dy, x_hat| {
                *dx = scale * (n * dy - sum_dy - x_hat * sum_dy_x_hat);
            });
    }
    dx
}

fn conv2d_output_dim(h: usize, w: usize, kh: usize, kw: usize, stride: usize, padding: usize) -> (usize, usize) {
    (
        (h + 2 * padding - kh) / stride + 1,
        (w + 2 * padding - kw) / stride + 1,
    )
}

fn im2col(
    x: &ArrayView4<f32>,
    kh: usize,
    kw: usize,
    stride: usize,
    padding: usize,
) -> Array3<f32> {
    let (batch_size, channels, h, w) = x.dim();
    let (ho, wo) = conv2d_output_dim(h, w, kh, kw, stride, padding);
    let mut cols = Array3::zeros([batch_size, channels * kh * kw, ho * wo]);
    for (x, mut cols) in x.outer_iter().zip(cols.outer_iter_mut()) {
        for ci in 0..channels {
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (ci * kh + ki) * kw + kj;
                    for oi in 0..ho {
                        let ii = oi * stride + ki;
                        if ii < padding || ii >= h + padding {
                            continue;
                        }
                        for oj in 0..wo {
                            let jj = oj * stride + kj;
                            if jj < padding || jj >= w + padding {
                                continue;
                            }
                            cols[(row, oi * wo + oj)] = x[(ci, ii - padding, jj - padding)];
                        }
                    }
                }
            }
        }
    }
    cols
}

fn col2im(
    cols: &ndarray::ArrayView3<f32>,
    dim: [usize; 4],
    kh: usize,
    kw: usize,
    stride: usize,
    padding: usize,
) -> Array4<f32> {
    let [batch_size, channels, h, w] = dim;
    let (ho, wo) = conv2d_output_dim(h, w, kh, kw, stride, padding);
    let mut x = Array4::zeros([batch_size, channels, h, w]);
    for (cols, mut x) in cols.outer_iter().zip(x.outer_iter_mut()) {
        for ci in 0..channels {
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (ci * kh + ki) * kw + kj;
                    for oi in 0..ho {
                        let ii = oi * stride + ki;
                        if ii < padding || ii >= h + padding {
                            continue;
                        }
                        for oj in 0..wo {
                            let jj = oj * stride + kj;
                            if jj < padding || jj >= w + padding {
                                continue;
                            }
                            x[(ci, ii - padding, jj - padding)] += cols[(row, oi * wo + oj)];
                        }
                    }
                }
            }
        }
    }
    x
}

fn conv2d(
    x: &ArrayView4<f32>,
    weight: &ArrayView4<f32>,
    stride: usize,
    padding: usize,
) -> Array4<f32> {
    let (batch_size, _channels, h, w) = x.dim();
    let (outputs, inputs, kh, kw) = weight.dim();
    let (ho, wo) = conv2d_output_dim(h, w, kh, kw, stride, padding);
    let cols = im2col(x, kh, kw, stride, padding);
    let weight = weight
        .to_shape([outputs, inputs * kh * kw])
        .unwrap()
        .to_owned();
    let mut y = Array4::zeros([batch_size, outputs, ho, wo]);
    for (cols, mut y) in cols.outer_iter().zip(y.outer_iter_mut()) {
        let y_mat = weight.dot(&cols);
        y.assign(&y_mat.into_shape([outputs, ho, wo]).unwrap());
    }
    y
}

fn conv2d_backward_input(
    weight: &ArrayView4<f32>,
    dy: &ArrayView4<f32>,
    input_dim: Ix4,
    stride: usize,
    padding: usize,
) -> Array4<f32> {
    let (batch_size, outputs, ho, wo) = dy.dim();
    let (_outputs, inputs, kh, kw) = weight.dim();
    let weight = weight
        .to_shape([outputs, inputs * kh * kw])
        .unwrap()
        .to_owned();
    let weight_t = weight.t();
    let mut cols = Array3::zeros([batch_size, inputs * kh * kw, ho * wo]);
    for (dy, mut cols) in dy.outer_iter().zip(cols.outer_iter_mut()) {
        let dy = dy.to_shape([outputs, ho * wo]).unwrap().to_owned();
        cols.assign(&weight_t.dot(&dy));
    }
    let [batch_size, channels, h, w] = [
        input_dim[0],
        input_dim[1],
        input_dim[2],
        input_dim[3],
    ];
    col2im(
        &cols.view(),
        [batch_size, channels, h, w],
        kh,
        kw,
        stride,
        padding,
    )
}

fn conv2d_backward_weight(
    x: &ArrayView4<f32>,
    dy: &ArrayView4<f32>,
    weight_dim: [usize; 4],
    stride: usize,
    padding: usize,
) -> Array4<f32> {
    let (_batch_size, outputs, ho, wo) = dy.dim();
    let [outputs_w, inputs, kh, kw] = weight_dim;
    debug_assert_eq!(outputs, outputs_w);
    let cols = im2col(x, kh, kw, stride, padding);
    let mut dw = Array2::<f32>::zeros([outputs, inputs * kh * kw]);
    for (x_cols, dy) in cols.outer_iter().zip(dy.outer_iter()) {
        let dy = dy.to_shape([outputs, ho * wo]).unwrap().to_owned();
        dw += &dy.dot(&x_cols.t());
    }
    dw.into_shape([outputs, inputs, kh, kw]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Variable0;
    use approx::assert_relative_eq;
    use ndarray::{arr0, ArcArray, Array, Ix0, IxDyn};
    use rand::{rngs::SmallRng, SeedableRng};

    fn sum_loss<D: Dimension + 'static>(x: Variable<D>) -> Variable0 {
        let mut builder = Variable0::builder();
        if let Some(node) = x.node() {
            let dim = x.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = output_grad[()];
                Ok(Array::from_elem(dim, dy).into_shared())
            });
        }
        builder.build(arr0(x.value().sum()).into_shared())
    }

    #[test]
    fn linear_forward_shape() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let linear = Linear::from_inputs_outputs(1024, 102, &mut rng);
        let input = Variable::from(Array::<f32, _>::zeros([32, 3, 1024]));
        let output = linear.forward(input)?;
        assert_eq!(output.shape(), [32, 3, 102]);
        Ok(())
    }

    #[test]
    fn linear_seeded_reproducible() {
        let mut rng1 = SmallRng::seed_from_u64(1);
        let mut rng2 = SmallRng::seed_from_u64(1);
        let mut a = Linear::from_inputs_outputs(8, 4, &mut rng1);
        let mut b = Linear::from_inputs_outputs(8, 4, &mut rng2);
        assert_eq!(
            a.parameters_mut()[0].value(),
            b.parameters_mut()[0].value()
        );
    }

    #[test]
    fn conv2d_identity_kernel() -> Result<()> {
        // A 1x1 kernel of 1 is the identity for a single channel.
        let conv = Conv2 {
            weight: Parameter::from(Array::<f32, _>::ones(IxDyn(&[1, 1, 1, 1]))),
            bias: None,
            stride: 1,
            padding: 0,
        };
        let input = Array::from_shape_fn([2, 1, 4, 4], |(b, _, i, j)| (b + i + j) as f32);
        let output = conv.forward(Variable::from(input.clone()))?;
        assert_eq!(output.value().to_owned(), input);
        Ok(())
    }

    #[test]
    fn conv2d_output_shape_stride_padding() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let conv = Conv2::from_inputs_outputs_kernel(3, 64, 11, &mut rng).with_padding(5);
        let input = Variable::from(Array::<f32, _>::zeros([2, 3, 32, 32]));
        let output = conv.forward(input)?;
        assert_eq!(output.shape(), [2, 64, 32, 32]);
        Ok(())
    }

    #[test]
    fn conv2d_gradients_match_finite_differences() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut conv = Conv2::from_inputs_outputs_kernel(2, 3, 3, &mut rng).with_padding(1);
        conv.set_training(true);
        let input = Array::from_shape_fn([1, 2, 5, 5], |(_, c, i, j)| {
            ((c + 1) as f32) * 0.1 * (i as f32 - j as f32)
        });
        let output = conv.forward(Variable::from(input.clone()))?;
        let loss = sum_loss(output);
        loss.backward()?;
        let analytic = conv.parameters_mut()[0].grad().unwrap();

        // Central differences on the first few weight entries.
        let weight = conv.parameters_mut()[0].value().to_owned();
        let eps = 1e-2;
        for index in [[0, 0, 0, 0], [1, 1, 1, 1], [2, 0, 2, 2]] {
            let mut wp = weight.clone();
            wp[IxDyn(&index)] += eps;
            let mut wm = weight.clone();
            wm[IxDyn(&index)] -= eps;
            let conv_p = Conv2 {
                weight: Parameter::from(wp),
                bias: None,
                stride: 1,
                padding: 1,
            };
            let conv_m = Conv2 {
                weight: Parameter::from(wm),
                bias: None,
                stride: 1,
                padding: 1,
            };
            let yp = conv_p.forward(Variable::from(input.clone()))?.value().sum();
            let ym = conv_m.forward(Variable::from(input.clone()))?.value().sum();
            let numeric = (yp - ym) / (2. * eps);
            assert_relative_eq!(analytic[IxDyn(&index)], numeric, epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn batch_norm_normalizes_in_training() -> Result<()> {
        let mut bn = BatchNorm2::from_channels(2);
        bn.set_training(true);
        let input = Array::from_shape_fn([4, 2, 3, 3], |(b, c, i, j)| {
            (b * 100 + c * 10 + i + j) as f32
        });
        let output = bn.forward(Variable::from(input))?;
        for channel in output.value().axis_iter(Axis(1)) {
            let n = channel.len() as f32;
            let mean = channel.iter().copied().sum::<f32>() / n;
            let var = channel.iter().copied().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
            assert_relative_eq!(mean, 0., epsilon = 1e-4);
            assert_relative_eq!(var, 1., epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn batch_norm_eval_uses_running_stats() -> Result<()> {
        let mut bn = BatchNorm2::from_channels(1);
        bn.set_training(false);
        // Fresh running stats are mean 0 / var 1, so eval mode is (nearly) the identity.
        let input = Array::from_shape_fn([2, 1, 2, 2], |(b, _, i, j)| (b + i + j) as f32);
        let output = bn.forward(Variable::from(input.clone()))?;
        assert_relative_eq!(
            output.value().as_slice().unwrap(),
            input.as_slice().unwrap(),
            epsilon = 1e-4
        );
        Ok(())
    }

    #[test]
    fn concat_split_round_trip() -> Result<()> {
        let input = Array::from_shape_fn([2, 4, 3, 3], |(b, c, i, j)| {
            (b * 1000 + c * 100 + i * 10 + j) as f32
        });
        let variable = Variable::from(input.clone());
        let (x1, x2) = split_channels(&variable)?;
        assert_eq!(x1.shape(), [2, 2, 3, 3]);
        let merged = concat_channels(&x1, &x2)?;
        assert_eq!(merged.value().to_owned(), input);
        Ok(())
    }

    #[test]
    fn split_channels_odd_fails() {
        let variable = Variable::from(Array::<f32, _>::zeros([1, 3, 2, 2]));
        assert!(split_channels(&variable).is_err());
    }
}

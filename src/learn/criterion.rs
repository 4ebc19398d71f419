use super::neural_network::autograd::{Variable0, Variable4};
use anyhow::{ensure, Result};
use ndarray::{ArcArray, ArrayView4, Ix4};

/// A trait for loss functions.
pub trait Criterion<X, T> {
    /// The output type, typically a scalar loss.
    type Output;
    /// Evaluates the criterion for `input` and `target`.
    ///
    /// **Errors**
    ///
    /// Returns an error if the shapes do not match.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Mean squared error.
///
/// The mean of the squared elementwise differences. Zero exactly when input and target are
/// equal.
#[derive(Default, Clone, Copy, Debug)]
pub struct MseLoss;

impl Criterion<Variable4, ArcArray<f32, Ix4>> for MseLoss {
    type Output = Variable0;
    fn eval(&self, input: Variable4, target: ArcArray<f32, Ix4>) -> Result<Variable0> {
        ensure!(
            input.shape() == target.shape(),
            "MseLoss: input shape {:?} does not match target shape {:?}!",
            input.shape(),
            target.shape()
        );
        let len = input.value().len() as f32;
        let value = mean_squared_error(&input.value().view(), &target.view());
        let mut builder = Variable0::builder();
        if let Some(node) = input.node() {
            let input = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, ndarray::Ix0>| {
                let dy = output_grad[()];
                let mut input_grad = input.to_owned();
                input_grad.zip_mut_with(&target, |x, t| *x = dy * 2. * (*x - t) / len);
                Ok(input_grad.into_shared())
            });
        }
        Ok(builder.build(ndarray::arr0(value).into_shared()))
    }
}

/// Mean squared error of plain tensors, for validation without gradient tracking.
pub fn mean_squared_error(input: &ArrayView4<f32>, target: &ArrayView4<f32>) -> f32 {
    let len = input.len() as f32;
    input
        .iter()
        .copied()
        .zip(target.iter().copied())
        .map(|(x, t)| (x - t).powi(2))
        .sum::<f32>()
        / len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::{Parameter, Variable};
    use approx::assert_relative_eq;
    use ndarray::Array4;

    #[test]
    fn mse_zero_iff_equal() -> Result<()> {
        let x = Array4::from_shape_fn([2, 1, 2, 2], |(b, _, i, j)| (b + i + j) as f32);
        let loss = MseLoss.eval(Variable::from(x.clone()), x.clone().into_shared())?;
        assert_eq!(loss.item(), 0.);
        let mut y = x.clone();
        y[[0, 0, 0, 0]] += 1.;
        let loss = MseLoss.eval(Variable::from(y), x.into_shared())?;
        assert!(loss.item() > 0.);
        Ok(())
    }

    #[test]
    fn mse_matches_hand_computation() -> Result<()> {
        let x = Array4::from_elem([1, 1, 2, 2], 1.0f32);
        let t = Array4::from_elem([1, 1, 2, 2], 0.0f32);
        let loss = MseLoss.eval(Variable::from(x), t.into_shared())?;
        assert_relative_eq!(loss.item(), 1., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn mse_backward() -> Result<()> {
        let mut w = Parameter::from(Array4::from_elem([1, 1, 1, 2], 3.0f32));
        w.set_training(true);
        let t = Array4::from_elem([1, 1, 1, 2], 1.0f32);
        let loss = MseLoss.eval(w.to_variable(), t.into_shared())?;
        loss.backward()?;
        // d/dx mean((x - t)^2) = 2 (x - t) / len = 2 * 2 / 2 = 2
        let grad = w.grad().unwrap();
        assert_relative_eq!(grad[[0, 0, 0, 0]], 2., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn mse_shape_mismatch_fails() {
        let x = Array4::<f32>::zeros([1, 1, 2, 2]);
        let t = Array4::<f32>::zeros([1, 1, 2, 3]);
        assert!(MseLoss.eval(Variable::from(x), t.into_shared()).is_err());
    }
}

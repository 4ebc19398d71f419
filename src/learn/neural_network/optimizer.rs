use super::autograd::ParameterD;
use anyhow::{bail, Result};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer for neural networks.
pub trait Optimizer {
    /// Updates the parameter.
    ///
    /// Drains the gradient of the parameter (see
    /// [`Parameter::take_grad`](super::autograd::Parameter::take_grad)) and applies it to the
    /// value, potentially updating the optimizer [`State`]. Does nothing if no gradient was
    /// computed since the last update.
    ///
    /// **Errors**
    ///
    /// Returns an error if the parameter has a [`State`] belonging to a different optimizer.
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()>;
}

/// A value stored in optimizer [`State`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// A scalar.
    Elem(f32),
    /// A tensor.
    Tensor(ArrayD<f32>),
}

impl Value {
    fn as_elem_mut(&mut self) -> Option<&mut f32> {
        if let Self::Elem(elem) = self {
            Some(elem)
        } else {
            None
        }
    }
    fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        if let Self::Tensor(tensor) = self {
            Some(tensor)
        } else {
            None
        }
    }
    fn as_tensor_mut(&mut self) -> Option<&mut ArrayD<f32>> {
        if let Self::Tensor(tensor) = self {
            Some(tensor)
        } else {
            None
        }
    }
}

/// Optimizer state.
///
/// Stored in the [`Parameter`](super::autograd::ParameterD) and serialized with it, so that
/// training can resume from a checkpoint without losing momentum estimates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    name: String,
    key_values: Vec<(String, Value)>,
}

impl State {
    /// Creates a new state for the optimizer named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_values: Vec::new(),
        }
    }
    /// The name of the optimizer the state belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Adds a key value pair.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.key_values.push((key.into(), value));
        self
    }
    fn get(&self, key: &str) -> Option<&Value> {
        self.key_values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
    fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.key_values
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// Stochastic gradient descent with optional momentum.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct SGD {
    momentum: f32,
}

impl SGD {
    /// Adds `momentum`.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for SGD {
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = match parameter.take_grad() {
            Some(grad) => grad,
            None => return Ok(()),
        };
        if self.momentum > 0. {
            if parameter.state().map(State::name) != Some("SGD") {
                let state = State::new("SGD").with(
                    "velocity",
                    Value::Tensor(ArrayD::zeros(parameter.raw_dim())),
                );
                parameter.init_state(state);
            }
            let momentum = self.momentum;
            let (mut value, state) = parameter.value_view_state_mut();
            let state = match state {
                Some(state) => state,
                None => bail!("SGD state was not initialized!"),
            };
            let velocity = match state.get_mut("velocity").and_then(Value::as_tensor_mut) {
                Some(velocity) => velocity,
                None => bail!("SGD state is missing `velocity`!"),
            };
            Zip::from(velocity.view_mut())
                .and(&grad)
                .for_each(|v, dx| *v = momentum * *v + dx);
            Zip::from(&mut value)
                .and(velocity.view())
                .for_each(|x, v| *x -= learning_rate * v);
        } else {
            let mut value = parameter.value_view_mut();
            Zip::from(&mut value)
                .and(&grad)
                .for_each(|x, dx| *x -= learning_rate * dx);
        }
        Ok(())
    }
}

/// Adam optimizer.
///
/// Keeps exponential moving estimates of the first and second gradient moments per parameter,
/// with bias correction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Adam {
    /// Sets the exponential decay rates of the moment estimates.
    pub fn with_betas(mut self, betas: (f32, f32)) -> Self {
        self.beta1 = betas.0;
        self.beta2 = betas.1;
        self
    }
}

impl Optimizer for Adam {
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = match parameter.take_grad() {
            Some(grad) => grad,
            None => return Ok(()),
        };
        if parameter.state().map(State::name) != Some("Adam") {
            let state = State::new("Adam")
                .with("step", Value::Elem(0.))
                .with("m", Value::Tensor(ArrayD::zeros(parameter.raw_dim())))
                .with("v", Value::Tensor(ArrayD::zeros(parameter.raw_dim())));
            parameter.init_state(state);
        }
        let Self {
            beta1,
            beta2,
            epsilon,
        } = *self;
        let (mut value, state) = parameter.value_view_state_mut();
        let state = match state {
            Some(state) => state,
            None => bail!("Adam state was not initialized!"),
        };
        let step = match state.get_mut("step").and_then(Value::as_elem_mut) {
            Some(step) => step,
            None => bail!("Adam state is missing `step`!"),
        };
        *step += 1.;
        let step = *step;
        let bias1 = 1. - beta1.powf(step);
        let bias2 = 1. - beta2.powf(step);
        {
            let m = match state.get_mut("m").and_then(Value::as_tensor_mut) {
                Some(m) => m,
                None => bail!("Adam state is missing `m`!"),
            };
            Zip::from(m.view_mut())
                .and(&grad)
                .for_each(|m, dx| *m = beta1 * *m + (1. - beta1) * dx);
        }
        {
            let v = match state.get_mut("v").and_then(Value::as_tensor_mut) {
                Some(v) => v,
                None => bail!("Adam state is missing `v`!"),
            };
            Zip::from(v.view_mut())
                .and(&grad)
                .for_each(|v, dx| *v = beta2 * *v + (1. - beta2) * dx * dx);
        }
        let m = match state.get("m").and_then(Value::as_tensor) {
            Some(m) => m,
            None => bail!("Adam state is missing `m`!"),
        };
        let v = match state.get("v").and_then(Value::as_tensor) {
            Some(v) => v,
            None => bail!("Adam state is missing `v`!"),
        };
        Zip::from(&mut value)
            .and(m)
            .and(v)
            .for_each(|x, m, v| {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *x -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    fn set_grad(parameter: &mut ParameterD, grad: ArrayD<f32>) -> Result<()> {
        parameter.set_training(true);
        let variable = parameter.to_variable();
        variable.node().unwrap().backward_grad(grad.into_shared())?;
        Ok(())
    }

    #[test]
    fn sgd_step() -> Result<()> {
        let mut w = Parameter::from(arr1(&[1.0f32, -1.])).into_dyn();
        set_grad(&mut w, arr1(&[0.5f32, -0.5]).into_dyn())?;
        SGD::default().update(0.1, &mut w)?;
        assert_relative_eq!(w.value()[0], 0.95, epsilon = 1e-6);
        assert_relative_eq!(w.value()[1], -0.95, epsilon = 1e-6);
        // The gradient was drained, so a second update is a no-op.
        SGD::default().update(0.1, &mut w)?;
        assert_relative_eq!(w.value()[0], 0.95, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn sgd_momentum_accumulates() -> Result<()> {
        let sgd = SGD::default().with_momentum(0.5);
        let mut w = Parameter::from(arr1(&[0.0f32])).into_dyn();
        set_grad(&mut w, arr1(&[1.0f32]).into_dyn())?;
        sgd.update(1., &mut w)?;
        assert_relative_eq!(w.value()[0], -1., epsilon = 1e-6);
        set_grad(&mut w, arr1(&[1.0f32]).into_dyn())?;
        sgd.update(1., &mut w)?;
        // velocity = 0.5 * 1 + 1 = 1.5
        assert_relative_eq!(w.value()[0], -2.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn adam_first_step_is_signed_learning_rate() -> Result<()> {
        // With bias correction, the first step is lr * g / (|g| + eps).
        let adam = Adam::default();
        let mut w = Parameter::from(arr1(&[1.0f32, 1.])).into_dyn();
        set_grad(&mut w, arr1(&[0.5f32, -0.25]).into_dyn())?;
        adam.update(0.01, &mut w)?;
        assert_relative_eq!(w.value()[0], 0.99, epsilon = 1e-5);
        assert_relative_eq!(w.value()[1], 1.01, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn adam_second_step_matches_hand_computation() -> Result<()> {
        let adam = Adam::default().with_betas((0.5, 0.999));
        let mut w = Parameter::from(arr1(&[0.0f32])).into_dyn();
        let (lr, g) = (0.1f32, 2.0f32);
        adam_reference_check(&adam, &mut w, lr, g, 2)?;
        Ok(())
    }

    fn adam_reference_check(
        adam: &Adam,
        w: &mut ParameterD,
        lr: f32,
        g: f32,
        steps: usize,
    ) -> Result<()> {
        let (beta1, beta2, eps) = (0.5f32, 0.999f32, 1e-8f32);
        let (mut m, mut v, mut x) = (0.0f32, 0.0f32, w.value()[0]);
        for step in 1..=steps {
            set_grad(w, arr1(&[g]).into_dyn())?;
            adam.update(lr, w)?;
            m = beta1 * m + (1. - beta1) * g;
            v = beta2 * v + (1. - beta2) * g * g;
            let m_hat = m / (1. - beta1.powi(step as i32));
            let v_hat = v / (1. - beta2.powi(step as i32));
            x -= lr * m_hat / (v_hat.sqrt() + eps);
            assert_relative_eq!(w.value()[0], x, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn state_survives_serde() -> Result<()> {
        let adam = Adam::default();
        let mut w = Parameter::from(arr1(&[1.0f32])).into_dyn();
        set_grad(&mut w, arr1(&[1.0f32]).into_dyn())?;
        adam.update(0.01, &mut w)?;
        let bytes = bincode::serialize(&w)?;
        let w2: ParameterD = bincode::deserialize(&bytes)?;
        assert_eq!(w2.state().unwrap().name(), "Adam");
        assert_eq!(w.value(), w2.value());
        Ok(())
    }
}

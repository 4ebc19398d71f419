use super::optimizer::State as OptimizerState;
use anyhow::{Error, Result};
use ndarray::{
    ArcArray, Array, Dimension, IntoDimension, Ix0, Ix1, Ix2, Ix3, Ix4, IxDyn, ShapeError,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use ndarray::{ArcArray, Ix2};
    /// # use lapnet::learn::neural_network::autograd::{Variable, Variable2};
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcArray<f32, Ix2>| -> Result<ArcArray<f32, Ix2>> { todo!() });
    /// }
    /// let output_value: ArcArray<f32, Ix2> = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added. May be useful for testing or
        /// for connecting backward passes together.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of
        /// `node` given the gradient of `self`. When multiple edges compute the same gradient,
        /// they are added together. Once there are no more edges needed to compute a gradient
        /// for a node, its edges can be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcArray<f32, D>) -> Result<ArcArray<f32, D2>> + Send + Sync + 'static,
        {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            let mut output_grad_lock = Some(self.grad.clone().unwrap());
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock
                        .read()
                        .clone()
                        .unwrap()
                        .into_dimensionality()
                        .unwrap();
                    std::mem::drop(output_grad_lock);
                    let grad = (f)(grad)?;
                    assert_eq!(grad.shape(), dim.slice(), "{name}");
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        input_grad.zip_mut_with(&grad.into_dyn(), |x, dx| *x += dx);
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = if let Some(grad) = self.grad {
                Some(Node::new(value.raw_dim().into_dyn(), grad, self.edges))
            } else {
                None
            };
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(
        dim: IxDyn,
        grad: Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>,
        edges: Vec<EdgeInner>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        Some(
            self.inner
                .grad
                .read()
                .clone()?
                .into_dimensionality()
                .unwrap(),
        )
    }
    /// Executes the backward pass.
    pub fn backward(&self) -> Result<()> {
        self.backward_grad(
            Array::ones(self.inner.dim.clone())
                .into_shared()
                .into_dimensionality::<D>()
                .map_err(Error::msg)?,
        )
    }
    /// Executes the backward pass with `grad`.
    pub fn backward_grad(&self, grad: ArcArray<f32, D>) -> Result<()> {
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node.clone())
                }
            }
        }
        Ok(())
    }
    fn into_dyn(self) -> Node<IxDyn> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are shared tensors ([`ArcArray`]) with an optional [`Node`] that stores a
/// gradient. Numerical operations on variables with a node create a graph of edges that is
/// traversed during the backward pass to compute the gradients.
///
/// Variables can be created from arrays via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 3 dimensions
pub type Variable3 = Variable<Ix3>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Converts the variable into a tensor.
    pub fn into_value(self) -> ArcArray<f32, D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: super::layer::Forward<Self>>(self, f: &F) -> Result<F::Output> {
        f.forward(self)
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dyn),
        }
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
    /// The scalar value.
    pub fn item(&self) -> f32 {
        self.value[()]
    }
}

impl<D: Dimension + 'static> Variable<D> {
    /// Converts into `shape`.
    ///
    /// **Errors**
    ///
    /// The size of `shape` must match the size of the variable.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>, ShapeError>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let shape = shape.into_dimension();
        let dim = self.raw_dim();
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                if let Ok(input_grad) = output_grad.clone().into_shape(dim.clone()) {
                    Ok(input_grad)
                } else {
                    Ok(output_grad
                        .as_standard_layout()
                        .to_owned()
                        .into_shared()
                        .into_shape(dim)
                        .unwrap())
                }
            })
        }
        let value = if let Ok(value) = self.value.clone().into_shape(shape.clone()) {
            value
        } else {
            self.value
                .as_standard_layout()
                .to_owned()
                .into_shared()
                .into_shape(shape)?
        };
        Ok(builder.build(value))
    }
    /// Flattens the variable into 2 dimensions, preserving the first axis.
    pub fn flatten(self) -> Result<Variable2, ShapeError> {
        let dim = flattened_dim(self.shape());
        self.into_shape(dim)
    }
    /// Applies `f` elementwise; `df` is the derivative of `f` at the input.
    pub fn map<F, DF>(self, f: F, df: DF) -> Self
    where
        F: Fn(f32) -> f32,
        DF: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let input = self.value().clone();
            builder.edge(node, move |output_grad| {
                let mut input_grad = input.to_owned();
                input_grad.zip_mut_with(&output_grad, |x, dy| *x = df(*x) * dy);
                Ok(input_grad.into_shared())
            });
        }
        let value = self.value.map(|x| f(*x)).into_shared();
        builder.build(value)
    }
    /// Rectified linear unit.
    pub fn relu(self) -> Self {
        self.map(|x| x.max(0.), |x| if x > 0. { 1. } else { 0. })
    }
    /// Hyperbolic tangent.
    pub fn tanh(self) -> Self {
        self.map(f32::tanh, |x| 1. - x.tanh().powi(2))
    }
    /// Numerically stable `ln(1 + exp(x))`.
    pub fn softplus(self) -> Self {
        self.map(softplus, |x| 1. / (1. + (-x).exp()))
    }
    /// Adds a same-shaped variable.
    ///
    /// **Errors**
    ///
    /// The shapes must match, broadcasting is not performed.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        anyhow::ensure!(
            self.shape() == rhs.shape(),
            "add: shape mismatch {:?} vs {:?}!",
            self.shape(),
            rhs.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            builder.edge(node, Ok);
        }
        let value = (self.value() + rhs.value()).into_shared();
        Ok(builder.build(value))
    }
    /// Scales by `alpha`.
    pub fn scale(self, alpha: f32) -> Self {
        self.map(move |x| alpha * x, move |_| alpha)
    }
}

/// `ln(1 + exp(x))` without overflow for large `x`.
pub fn softplus(x: f32) -> f32 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn flattened_dim(shape: &[usize]) -> Ix2 {
    let (batch_size, inputs) = match shape {
        [] => (1, 1),
        [batch_size] => (*batch_size, 1),
        [batch_size, inputs @ ..] => (*batch_size, inputs.iter().product()),
    };
    ndarray::Dim([batch_size, inputs])
}

impl Variable2 {
    /// Reverses (transposes) the axes of the variable.
    pub fn reversed_axes(self) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.reversed_axes())
            });
        }
        builder.build(self.value.reversed_axes())
    }
    /// Transposes the variable.
    pub fn t(&self) -> Self {
        self.clone().reversed_axes()
    }
    /// Matrix product, with backward edges for both operands.
    pub fn dot(&self, rhs: &Self) -> Result<Self> {
        let lhs = self;
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.dot(&rhs.t()).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                Ok(lhs.t().dot(&output_grad).into_shared())
            });
        }
        let value = lhs.value().dot(rhs.value()).into_shared();
        Ok(builder.build(value))
    }
    /// Adds `bias` to each row.
    pub fn add_bias(self, bias: &Variable1) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = bias.node() {
            builder.edge(node, |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.sum_axis(ndarray::Axis(0)).into_shared())
            });
        }
        let value =
            (&self.value + &bias.value().view().insert_axis(ndarray::Axis(0))).into_shared();
        builder.build(value)
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

/// Parameter.
///
/// Parameter values are updated during training by the
/// [`Optimizer`](super::optimizer::Optimizer). A Parameter can be converted to a [`Variable`]
/// via [`.to_variable()`](Parameter::to_variable), which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that the variable
/// created from this parameter has a [`Node`].
/// A parameter stores the optimizer [`State`](OptimizerState) which is updated during
/// training. Training progress may be saved by serializing with [`serde`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))]
pub struct Parameter<D: Dimension> {
    value: ArcArray<f32, D>,
    #[serde(skip)]
    grad: Option<Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>>,
    state: Option<OptimizerState>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 2 dimensions.
pub type Parameter2 = Parameter<Ix2>;
/// Parameter with 4 dimensions.
pub type Parameter4 = Parameter<Ix4>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Borrows the value of the parameter as a mutable view, copying if it is shared.
    pub fn value_view_mut(&mut self) -> ndarray::ArrayViewMut<f32, D> {
        self.value.view_mut()
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        Some(
            self.grad
                .as_ref()?
                .read()
                .clone()?
                .into_dimensionality()
                .unwrap(),
        )
    }
    /// Takes the gradient, leaving the slot empty.
    ///
    /// The optimizer drains the gradient on update, which doubles as zeroing it for the next
    /// batch.
    pub fn take_grad(&self) -> Option<ArcArray<f32, D>> {
        Some(
            self.grad
                .as_ref()?
                .write()
                .take()?
                .into_dimensionality()
                .unwrap(),
        )
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`], it will
    /// have a [`Node`] for computing a gradient. If `training` is false, discards any gradient
    /// that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(Arc::new(RwLock::default()));
        } else if !training {
            self.grad = None;
        }
    }
    /// Whether training is enabled.
    pub fn training(&self) -> bool {
        self.grad.is_some()
    }
    /// Borrows the optimizer state.
    pub fn state(&self) -> Option<&OptimizerState> {
        self.state.as_ref()
    }
    /// Replaces the optimizer state.
    pub fn init_state(&mut self, state: OptimizerState) {
        self.state.replace(state);
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_view_state_mut(
        &mut self,
    ) -> (ndarray::ArrayViewMut<f32, D>, Option<&mut OptimizerState>) {
        (self.value.view_mut(), self.state.as_mut())
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
            state: self.state,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            state: self.state,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Parameter<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            grad: None,
            state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("value", &self.value)
            .field("training", &self.grad.is_some())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr0, arr1, arr2, Axis};

    fn mean_for_test(x: Variable2) -> Variable0 {
        let len = x.value().len() as f32;
        let mut builder = Variable0::builder();
        if let Some(node) = x.node() {
            let dim = x.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = output_grad[()];
                Ok(Array::from_elem(dim, dy / len).into_shared())
            });
        }
        builder.build(arr0(x.value().mean().unwrap()).into_shared())
    }

    #[test]
    fn backward_accumulates_edges() -> Result<()> {
        let mut w = Parameter::from(arr2(&[[1.0f32, 2.], [3., 4.]]));
        w.set_training(true);
        let x = w.to_variable();
        // y = x + x, so dy/dx = 2 everywhere.
        let y = x.add(&x)?;
        let loss = mean_for_test(y).scale(4.);
        loss.backward()?;
        let grad = w.grad().unwrap();
        assert_eq!(grad, arr2(&[[2.0f32, 2.], [2., 2.]]).into_shared());
        Ok(())
    }

    #[test]
    fn dot_backward() -> Result<()> {
        let mut w = Parameter::from(arr2(&[[1.0f32, -1.], [0.5, 2.]]));
        w.set_training(true);
        let x = Variable::from(arr2(&[[1.0f32, 2.], [3., 4.]]));
        let y = x.clone().dot(&w.to_variable())?;
        let loss = mean_for_test(y);
        loss.backward()?;
        // d mean(x.dot(w)) / dw = x^T . ones / len
        let grad = w.grad().unwrap();
        let expected = x
            .value()
            .t()
            .dot(&Array::from_elem([2, 2], 1.0f32 / 4.));
        assert_relative_eq!(
            grad.as_standard_layout().as_slice().unwrap(),
            expected.as_slice().unwrap(),
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn add_bias_backward() -> Result<()> {
        let mut b = Parameter::from(arr1(&[1.0f32, -1.]));
        b.set_training(true);
        let x = Variable::from(arr2(&[[0.0f32, 0.], [1., 1.], [2., 2.]]));
        let y = x.add_bias(&b.to_variable());
        assert_eq!(y.value().index_axis(Axis(0), 0), arr1(&[1.0f32, -1.]));
        mean_for_test(y).scale(6.).backward()?;
        // Bias gradient is the column sum of the output gradient.
        assert_eq!(b.grad().unwrap(), arr1(&[3.0f32, 3.]).into_shared());
        Ok(())
    }

    #[test]
    fn relu_map() {
        let x = Variable::from(arr1(&[-1.0f32, 0., 2.]));
        let y = x.relu();
        assert_eq!(y.value().to_vec(), vec![0.0f32, 0., 2.]);
    }

    #[test]
    fn tanh_bounded() {
        let x = Variable::from(arr1(&[-100.0f32, 0., 100.]));
        let y = x.tanh();
        assert_eq!(y.value().to_vec(), vec![-1.0f32, 0., 1.]);
    }

    #[test]
    fn softplus_stable() {
        assert_relative_eq!(softplus(0.), 2.0f32.ln(), epsilon = 1e-6);
        assert_relative_eq!(softplus(100.), 100., epsilon = 1e-4);
        assert!(softplus(-100.) >= 0.);
    }

    #[test]
    fn scalar_add_scale() -> Result<()> {
        let a = Variable0::from(arr0(0.25f32));
        let b = Variable0::from(arr0(0.75f32));
        let c = a.add(&b)?.scale(2.);
        assert_relative_eq!(c.item(), 2.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn parameter_serde_round_trip() -> Result<()> {
        let w = Parameter::from(arr2(&[[1.0f32, 2.], [3., 4.]]));
        let bytes = bincode::serialize(&w)?;
        let w2: Parameter2 = bincode::deserialize(&bytes)?;
        assert_eq!(w.value(), w2.value());
        Ok(())
    }
}

//! Running graphs: forward evaluation of fetched nodes and reverse-mode
//! differentiation of scalar costs.
use crate::{
    activation_functions::{relu, relu_gradient},
    convolutions::{conv2d_filter_gradient, conv2d_same},
    fully_connected::{add_bias, bias_gradient, matmul},
    graph::{Graph, GraphError, GraphResult, Node, NodeId, Operation},
    transposed_convolutions::conv2d_transpose_same,
    ImagePrecision, TensorData,
};
use log::trace;
use ndarray::{arr0, Array, ArrayD, ArrayView2, ArrayView4, Ix2, Ix4, IxDyn, Zip};
use std::{borrow::Cow, collections::HashMap};

/// Values for the placeholders of a graph, keyed by placeholder node.
#[derive(Debug, Default, Clone)]
pub struct Feeds {
    values: HashMap<NodeId, TensorData>,
}

impl Feeds {
    pub fn new() -> Feeds {
        Feeds::default()
    }

    pub fn with(mut self, placeholder: NodeId, value: TensorData) -> Feeds {
        self.insert(placeholder, value);
        self
    }

    pub fn insert(&mut self, placeholder: NodeId, value: TensorData) {
        self.values.insert(placeholder, value);
    }

    pub fn get(&self, placeholder: NodeId) -> Option<&TensorData> {
        self.values.get(&placeholder)
    }
}

/// Result of a backward pass.
#[derive(Debug)]
pub struct Gradients {
    /// Value of the cost in the forward pass
    pub cost: ImagePrecision,
    /// One entry per requested node, `None` if the node does not influence the cost
    pub gradients: Vec<Option<TensorData>>,
}

/// Node values of one forward pass. Placeholders and variables are borrowed.
type Values<'a> = Vec<Option<Cow<'a, TensorData>>>;

fn value<'v>(
    values: &'v [Option<Cow<'_, TensorData>>],
    id: NodeId,
) -> GraphResult<&'v TensorData> {
    values
        .get(id.0)
        .and_then(|v| v.as_deref())
        .ok_or(GraphError::UnknownNode(id))
}

fn matrix(value: &TensorData) -> GraphResult<ArrayView2<'_, ImagePrecision>> {
    Ok(value.view().into_dimensionality::<Ix2>()?)
}

fn image_batch(value: &TensorData) -> GraphResult<ArrayView4<'_, ImagePrecision>> {
    Ok(value.view().into_dimensionality::<Ix4>()?)
}

/// Copies `value` into a new standard layout array of the given shape.
fn reshaped(value: &TensorData, shape: &[usize]) -> GraphResult<TensorData> {
    Ok(Array::from_shape_vec(
        IxDyn(shape),
        value.iter().copied().collect(),
    )?)
}

impl Graph {
    /// Evaluates all nodes marked in `needed`, in arena order.
    fn forward<'a>(&'a self, needed: &[bool], feeds: &'a Feeds) -> GraphResult<Values<'a>> {
        let mut values: Values<'a> = vec![None; self.len()];
        for index in (0..needed.len()).filter(|&i| needed[i]) {
            let id = NodeId(index);
            let node = self.node(id)?;
            let computed = match *node.op() {
                Operation::Placeholder => {
                    let name = node.name().unwrap_or_default().to_string();
                    let fed = feeds
                        .get(id)
                        .ok_or_else(|| GraphError::MissingFeed(name.clone()))?;
                    if fed.shape() != node.shape() {
                        return Err(GraphError::FeedShapeMismatch {
                            name,
                            expected: node.shape().to_vec(),
                            actual: fed.shape().to_vec(),
                        });
                    }
                    Cow::Borrowed(fed)
                }
                Operation::Variable => Cow::Borrowed(self.variable_value(id)?),
                _ => Cow::Owned(evaluate(id, node, &values)?),
            };
            values[index] = Some(computed);
        }
        Ok(values)
    }

    /// Computes the values of `fetches`, evaluating only the nodes they depend on.
    pub fn run(&self, fetches: &[NodeId], feeds: &Feeds) -> GraphResult<Vec<TensorData>> {
        let needed = self.dependencies(fetches)?;
        trace!(
            "Running {} of {} nodes",
            needed.iter().filter(|&&n| n).count(),
            self.len()
        );
        let values = self.forward(&needed, feeds)?;
        fetches
            .iter()
            .map(|&id| value(&values, id).map(|v| v.clone()))
            .collect()
    }

    pub fn run_single(&self, fetch: NodeId, feeds: &Feeds) -> GraphResult<TensorData> {
        let mut fetched = self.run(&[fetch], feeds)?;
        fetched.pop().ok_or(GraphError::UnknownNode(fetch))
    }

    /// Differentiates the scalar `cost` with respect to each node in `wrt`.
    /// Nodes should be listed once. Only nodes on a path between `wrt` and `cost`
    /// are visited in the backward pass.
    pub fn gradients(
        &self,
        cost: NodeId,
        wrt: &[NodeId],
        feeds: &Feeds,
    ) -> GraphResult<Gradients> {
        let cost_shape = self.shape(cost)?;
        if !cost_shape.is_empty() {
            return Err(GraphError::NonScalarCost(cost_shape.to_vec()));
        }
        let needed = self.dependencies(&[cost])?;
        let values = self.forward(&needed, feeds)?;

        let mut relevant = vec![false; self.len()];
        for &id in wrt {
            self.node(id)?;
            relevant[id.0] = needed[id.0];
        }
        for index in 0..=cost.0 {
            if needed[index] && !relevant[index] {
                let inputs = self.node(NodeId(index))?.op().inputs();
                relevant[index] = inputs.iter().any(|input| relevant[input.0]);
            }
        }

        let mut grads: Vec<Option<TensorData>> = vec![None; self.len()];
        grads[cost.0] = Some(arr0(1.0).into_dyn());
        for index in (0..=cost.0).rev() {
            if !relevant[index] {
                continue;
            }
            let node = self.node(NodeId(index))?;
            if node.op().inputs().is_empty() {
                continue;
            }
            // inputs always live below `index`
            let (lower, upper) = grads.split_at_mut(index);
            let grad = match upper[0].take() {
                Some(grad) => grad,
                None => continue,
            };
            for (input, input_grad) in self.backward(node, &grad, &values, &relevant)? {
                match &mut lower[input.0] {
                    Some(accumulated) => *accumulated += &input_grad,
                    slot => *slot = Some(input_grad),
                }
            }
        }

        let cost_value = value(&values, cost)?.sum();
        let gradients = wrt.iter().map(|id| grads[id.0].take()).collect();
        Ok(Gradients {
            cost: cost_value,
            gradients,
        })
    }

    /// Gradients of the inputs of `node` that are marked relevant, given the
    /// gradient of its output.
    fn backward(
        &self,
        node: &Node,
        grad: &TensorData,
        values: &[Option<Cow<'_, TensorData>>],
        relevant: &[bool],
    ) -> GraphResult<Vec<(NodeId, TensorData)>> {
        let wants = |id: NodeId| relevant[id.0];
        let mut out = Vec::with_capacity(2);
        match *node.op() {
            Operation::Placeholder | Operation::Variable => {}
            Operation::MatMul(a, b) => {
                let g = matrix(grad)?;
                if wants(a) {
                    let b_value = matrix(value(values, b)?)?;
                    out.push((a, g.dot(&b_value.t()).into_dyn()));
                }
                if wants(b) {
                    let a_value = matrix(value(values, a)?)?;
                    out.push((b, a_value.t().dot(&g).into_dyn()));
                }
            }
            Operation::AddBias { input, bias } => {
                if wants(input) {
                    out.push((input, grad.clone()));
                }
                if wants(bias) {
                    out.push((bias, bias_gradient(grad, self.shape(bias)?)?));
                }
            }
            Operation::Sub(a, b) => {
                if wants(a) {
                    out.push((a, grad.clone()));
                }
                if wants(b) {
                    out.push((b, grad.mapv(|g| -g)));
                }
            }
            Operation::Square(x) => {
                if wants(x) {
                    let squared = Zip::from(value(values, x)?)
                        .and(grad)
                        .map_collect(|&x, &g| 2. * x * g);
                    out.push((x, squared));
                }
            }
            Operation::ReduceSum(x) => {
                if wants(x) {
                    out.push((x, ArrayD::from_elem(IxDyn(self.shape(x)?), grad.sum())));
                }
            }
            Operation::Relu(x) => {
                if wants(x) {
                    out.push((x, relu_gradient(value(values, x)?, grad)));
                }
            }
            Operation::Reshape(x) => {
                if wants(x) {
                    out.push((x, reshaped(grad, self.shape(x)?)?));
                }
            }
            Operation::Conv2d { input, filter } => {
                let g = image_batch(grad)?;
                let f = image_batch(value(values, filter)?)?;
                if wants(input) {
                    out.push((input, conv2d_transpose_same(f, g)?.into_dyn()));
                }
                if wants(filter) {
                    let x = image_batch(value(values, input)?)?;
                    let (kh, kw) = (f.shape()[0], f.shape()[1]);
                    out.push((filter, conv2d_filter_gradient(x, g, kh, kw)?.into_dyn()));
                }
            }
            Operation::Conv2dTranspose { input, filter } => {
                let g = image_batch(grad)?;
                let f = image_batch(value(values, filter)?)?;
                if wants(input) {
                    out.push((input, conv2d_same(f, g)?.into_dyn()));
                }
                if wants(filter) {
                    // the transposed convolution is linear in the filter, with the
                    // roles of input and output gradient swapped
                    let y = image_batch(value(values, input)?)?;
                    let (kh, kw) = (f.shape()[0], f.shape()[1]);
                    out.push((filter, conv2d_filter_gradient(g, y, kh, kw)?.into_dyn()));
                }
            }
        }
        Ok(out)
    }
}

/// Forward computation of a non-leaf node from the values of its inputs.
fn evaluate(
    id: NodeId,
    node: &Node,
    values: &[Option<Cow<'_, TensorData>>],
) -> GraphResult<TensorData> {
    let result = match *node.op() {
        // leaves are never computed
        Operation::Placeholder | Operation::Variable => return Err(GraphError::UnknownNode(id)),
        Operation::MatMul(a, b) => {
            matmul(matrix(value(values, a)?)?, matrix(value(values, b)?)?).into_dyn()
        }
        Operation::AddBias { input, bias } => {
            add_bias(value(values, input)?, value(values, bias)?)?
        }
        Operation::Sub(a, b) => value(values, a)? - value(values, b)?,
        Operation::Square(x) => value(values, x)?.mapv(|v| v * v),
        Operation::ReduceSum(x) => arr0(value(values, x)?.sum()).into_dyn(),
        Operation::Relu(x) => relu(value(values, x)?),
        Operation::Reshape(x) => reshaped(value(values, x)?, node.shape())?,
        Operation::Conv2d { input, filter } => conv2d_same(
            image_batch(value(values, filter)?)?,
            image_batch(value(values, input)?)?,
        )?
        .into_dyn(),
        Operation::Conv2dTranspose { input, filter } => conv2d_transpose_same(
            image_batch(value(values, filter)?)?,
            image_batch(value(values, input)?)?,
        )?
        .into_dyn(),
    };
    Ok(result)
}

//! Symbolic computation graphs.
//!
//! A [`Graph`] is an append-only arena of nodes. Every node carries the
//! operation that produces it and its static shape, which is checked when the
//! node is created. A node can only reference nodes created before it, so the
//! arena order is always a valid evaluation order.
use crate::{TensorData, WeightPrecision};
use ndarray::{ArrayD, IxDyn, ShapeError};
use ndarray_rand::rand::{rngs::StdRng, SeedableRng};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use std::collections::HashMap;
use thiserror::Error;

pub type Shape = Vec<usize>;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Incompatible shapes in {op}: {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    #[error("{op} expects an input of rank {expected}, got shape {actual:?}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        actual: Shape,
    },
    #[error("Cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Shape, to: Shape },
    #[error("Node {0:?} does not belong to this graph")]
    UnknownNode(NodeId),
    #[error("Node {0:?} is not a variable")]
    NotAVariable(NodeId),
    #[error("A variable named {0} already exists")]
    DuplicateVariable(String),
    #[error("No value was fed for placeholder {0}")]
    MissingFeed(String),
    #[error("Value fed for {name} has shape {actual:?}, expected {expected:?}")]
    FeedShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },
    #[error("Cost must be a scalar, got shape {0:?}")]
    NonScalarCost(Shape),
    #[error("Filter size {0}x{1} is empty")]
    EmptyKernel(usize, usize),
    #[error("Standard deviation {0} is not valid for a normal initializer")]
    InvalidInitializer(WeightPrecision),
    #[error("Tensor layout error:\n {0}.")]
    Kernel(#[from] ShapeError),
}

/// Handle to a node of a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Placeholder,
    Variable,
    MatMul(NodeId, NodeId),
    AddBias { input: NodeId, bias: NodeId },
    Sub(NodeId, NodeId),
    Square(NodeId),
    ReduceSum(NodeId),
    Relu(NodeId),
    Reshape(NodeId),
    /// Stride 1, `SAME` padding, NHWC input, filter `[height, width, in, out]`.
    Conv2d { input: NodeId, filter: NodeId },
    /// Adjoint of [`Operation::Conv2d`] with the same filter layout.
    Conv2dTranspose { input: NodeId, filter: NodeId },
}

impl Operation {
    /// Nodes this operation reads from, in argument order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match *self {
            Operation::Placeholder | Operation::Variable => Vec::new(),
            Operation::Square(x)
            | Operation::ReduceSum(x)
            | Operation::Relu(x)
            | Operation::Reshape(x) => vec![x],
            Operation::MatMul(a, b) | Operation::Sub(a, b) => vec![a, b],
            Operation::AddBias { input, bias } => vec![input, bias],
            Operation::Conv2d { input, filter } | Operation::Conv2dTranspose { input, filter } => {
                vec![input, filter]
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    op: Operation,
    shape: Shape,
    name: Option<String>,
}

impl Node {
    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Only placeholders and variables are named.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Current values of the variable nodes
    values: HashMap<NodeId, TensorData>,
    variable_names: HashMap<String, NodeId>,
    /// Variables in creation order
    variables: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id))
    }

    pub fn shape(&self, id: NodeId) -> GraphResult<&[usize]> {
        Ok(self.node(id)?.shape())
    }

    fn push(&mut self, op: Operation, shape: Shape, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { op, shape, name });
        id
    }

    /// Input node whose value has to be supplied on every run.
    pub fn placeholder(&mut self, name: &str, shape: &[usize]) -> NodeId {
        self.push(Operation::Placeholder, shape.to_vec(), Some(name.to_string()))
    }

    /// Trainable node holding `value`. Variable names have to be unique, as
    /// they are used as keys in checkpoints.
    pub fn variable(&mut self, name: &str, value: TensorData) -> GraphResult<NodeId> {
        if self.variable_names.contains_key(name) {
            return Err(GraphError::DuplicateVariable(name.to_string()));
        }
        let id = self.push(
            Operation::Variable,
            value.shape().to_vec(),
            Some(name.to_string()),
        );
        self.values.insert(id, value);
        self.variable_names.insert(name.to_string(), id);
        self.variables.push(id);
        Ok(id)
    }

    /// All variables with their names, in creation order.
    pub fn variables(&self) -> impl Iterator<Item = (NodeId, &str)> + '_ {
        self.variables
            .iter()
            .map(move |&id| (id, self.nodes[id.0].name().unwrap_or_default()))
    }

    pub fn variable_by_name(&self, name: &str) -> Option<NodeId> {
        self.variable_names.get(name).copied()
    }

    pub fn variable_value(&self, id: NodeId) -> GraphResult<&TensorData> {
        self.values.get(&id).ok_or(GraphError::NotAVariable(id))
    }

    pub(crate) fn variable_value_mut(&mut self, id: NodeId) -> GraphResult<&mut TensorData> {
        self.values.get_mut(&id).ok_or(GraphError::NotAVariable(id))
    }

    /// Overwrites the value of a variable. The shape may not change.
    pub fn set_variable_value(&mut self, id: NodeId, value: TensorData) -> GraphResult<()> {
        let current = self.variable_value_mut(id)?;
        if current.shape() != value.shape() {
            return Err(GraphError::ShapeMismatch {
                op: "assign",
                lhs: current.shape().to_vec(),
                rhs: value.shape().to_vec(),
            });
        }
        *current = value;
        Ok(())
    }

    /// Marks every node the given roots depend on (roots included).
    pub fn dependencies(&self, roots: &[NodeId]) -> GraphResult<Vec<bool>> {
        let mut needed = vec![false; self.nodes.len()];
        let mut stack = Vec::with_capacity(roots.len());
        for &root in roots {
            self.node(root)?;
            stack.push(root);
        }
        while let Some(id) = stack.pop() {
            if needed[id.0] {
                continue;
            }
            needed[id.0] = true;
            stack.extend(self.nodes[id.0].op.inputs());
        }
        Ok(needed)
    }

    /// Variables that influence `node`, in creation order.
    pub fn variables_of(&self, node: NodeId) -> GraphResult<Vec<NodeId>> {
        let needed = self.dependencies(&[node])?;
        Ok(self
            .variables
            .iter()
            .copied()
            .filter(|id| needed[id.0])
            .collect())
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> GraphResult<NodeId> {
        let lhs = self.shape(a)?.to_vec();
        let rhs = self.shape(b)?.to_vec();
        expect_rank("matmul", &lhs, 2)?;
        expect_rank("matmul", &rhs, 2)?;
        if lhs[1] != rhs[0] {
            return Err(GraphError::ShapeMismatch {
                op: "matmul",
                lhs,
                rhs,
            });
        }
        let shape = vec![lhs[0], rhs[1]];
        Ok(self.push(Operation::MatMul(a, b), shape, None))
    }

    /// Adds `bias` to `input`, broadcasting it over the leading axes. The shape
    /// of the bias has to equal the trailing axes of the input.
    pub fn add_bias(&mut self, input: NodeId, bias: NodeId) -> GraphResult<NodeId> {
        let x = self.shape(input)?.to_vec();
        let b = self.shape(bias)?.to_vec();
        if b.len() > x.len() || x[x.len() - b.len()..] != b[..] {
            return Err(GraphError::ShapeMismatch {
                op: "add_bias",
                lhs: x,
                rhs: b,
            });
        }
        Ok(self.push(Operation::AddBias { input, bias }, x, None))
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> GraphResult<NodeId> {
        let lhs = self.shape(a)?.to_vec();
        let rhs = self.shape(b)?.to_vec();
        if lhs != rhs {
            return Err(GraphError::ShapeMismatch { op: "sub", lhs, rhs });
        }
        Ok(self.push(Operation::Sub(a, b), lhs, None))
    }

    pub fn square(&mut self, x: NodeId) -> GraphResult<NodeId> {
        let shape = self.shape(x)?.to_vec();
        Ok(self.push(Operation::Square(x), shape, None))
    }

    /// Sum over all elements, producing a scalar.
    pub fn reduce_sum(&mut self, x: NodeId) -> GraphResult<NodeId> {
        self.node(x)?;
        Ok(self.push(Operation::ReduceSum(x), Vec::new(), None))
    }

    pub fn relu(&mut self, x: NodeId) -> GraphResult<NodeId> {
        let shape = self.shape(x)?.to_vec();
        Ok(self.push(Operation::Relu(x), shape, None))
    }

    pub fn reshape(&mut self, x: NodeId, shape: &[usize]) -> GraphResult<NodeId> {
        let from = self.shape(x)?.to_vec();
        if from.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(GraphError::InvalidReshape {
                from,
                to: shape.to_vec(),
            });
        }
        Ok(self.push(Operation::Reshape(x), shape.to_vec(), None))
    }

    /// 2D convolution with stride 1 and `SAME` padding.
    /// Input is `[batch, height, width, channels]`, filter is
    /// `[filter height, filter width, channels, filters]`.
    pub fn conv2d(&mut self, input: NodeId, filter: NodeId) -> GraphResult<NodeId> {
        let x = self.shape(input)?.to_vec();
        let f = self.shape(filter)?.to_vec();
        expect_rank("conv2d", &x, 4)?;
        expect_rank("conv2d", &f, 4)?;
        expect_kernel(&f)?;
        if x[3] != f[2] {
            return Err(GraphError::ShapeMismatch {
                op: "conv2d",
                lhs: x,
                rhs: f,
            });
        }
        let shape = vec![x[0], x[1], x[2], f[3]];
        Ok(self.push(Operation::Conv2d { input, filter }, shape, None))
    }

    /// Transposed 2D convolution (gradient of [`Graph::conv2d`] with respect to
    /// its input), stride 1 and `SAME` padding.
    /// Input is `[batch, height, width, filters]`, filter is
    /// `[filter height, filter width, channels, filters]` and the output has
    /// shape `output_shape = [batch, height, width, channels]`.
    pub fn conv2d_transpose(
        &mut self,
        input: NodeId,
        filter: NodeId,
        output_shape: &[usize],
    ) -> GraphResult<NodeId> {
        let x = self.shape(input)?.to_vec();
        let f = self.shape(filter)?.to_vec();
        expect_rank("conv2d_transpose", &x, 4)?;
        expect_rank("conv2d_transpose", &f, 4)?;
        expect_rank("conv2d_transpose", output_shape, 4)?;
        expect_kernel(&f)?;
        if x[3] != f[3] {
            return Err(GraphError::ShapeMismatch {
                op: "conv2d_transpose",
                lhs: x,
                rhs: f,
            });
        }
        if output_shape[..3] != x[..3] || output_shape[3] != f[2] {
            return Err(GraphError::ShapeMismatch {
                op: "conv2d_transpose",
                lhs: x,
                rhs: output_shape.to_vec(),
            });
        }
        Ok(self.push(
            Operation::Conv2dTranspose { input, filter },
            output_shape.to_vec(),
            None,
        ))
    }
}

fn expect_rank(op: &'static str, shape: &[usize], expected: usize) -> GraphResult<()> {
    if shape.len() != expected {
        return Err(GraphError::RankMismatch {
            op,
            expected,
            actual: shape.to_vec(),
        });
    }
    Ok(())
}

pub(crate) fn expect_kernel(filter: &[usize]) -> GraphResult<()> {
    if filter[0] == 0 || filter[1] == 0 {
        return Err(GraphError::EmptyKernel(filter[0], filter[1]));
    }
    Ok(())
}

/// Draws initial variable values from a normal distribution with mean 0.
pub struct Initializer {
    stddev: WeightPrecision,
    rng: StdRng,
}

impl Initializer {
    pub fn normal(stddev: WeightPrecision) -> Initializer {
        Initializer {
            stddev,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible initializer, mostly for tests.
    pub fn seeded(stddev: WeightPrecision, seed: u64) -> Initializer {
        Initializer {
            stddev,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fails for a negative or non-finite standard deviation.
    pub fn random_normal(&mut self, shape: &[usize]) -> GraphResult<TensorData> {
        if !(self.stddev >= 0.0 && self.stddev.is_finite()) {
            return Err(GraphError::InvalidInitializer(self.stddev));
        }
        let distribution = Normal::new(0.0, self.stddev)
            .map_err(|_| GraphError::InvalidInitializer(self.stddev))?;
        Ok(ArrayD::random_using(
            IxDyn(shape),
            distribution,
            &mut self.rng,
        ))
    }
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::normal(1.0)
    }
}

use crate::{
    execution::{Feeds, Gradients},
    graph::{Graph, GraphResult, NodeId},
    ImagePrecision, TensorData, WeightPrecision,
};
use log::trace;
use ndarray::Zip;
use std::collections::HashMap;

/// Update rule for variables, given their gradients.
pub trait Optimizer {
    /// Updates each variable in place with its gradient.
    fn apply_gradients(
        &mut self,
        graph: &mut Graph,
        gradients: Vec<(NodeId, TensorData)>,
    ) -> GraphResult<()>;

    /// Binds this optimizer to the scalar `cost` and all variables it depends on.
    fn minimize(self, graph: &Graph, cost: NodeId) -> GraphResult<TrainStep<Self>>
    where
        Self: Sized,
    {
        let variables = graph.variables_of(cost)?;
        Ok(TrainStep {
            cost,
            variables,
            optimizer: self,
        })
    }
}

/// One optimizer bound to one cost.
#[derive(Debug)]
pub struct TrainStep<O> {
    cost: NodeId,
    variables: Vec<NodeId>,
    optimizer: O,
}

impl<O: Optimizer> TrainStep<O> {
    /// Runs one optimization step and returns the cost before the update.
    pub fn run(&mut self, graph: &mut Graph, feeds: &Feeds) -> GraphResult<ImagePrecision> {
        let Gradients { cost, gradients } = graph.gradients(self.cost, &self.variables, feeds)?;
        let updates = self
            .variables
            .iter()
            .copied()
            .zip(gradients)
            .filter_map(|(variable, gradient)| gradient.map(|g| (variable, g)))
            .collect();
        self.optimizer.apply_gradients(graph, updates)?;
        Ok(cost)
    }

    pub fn cost(&self) -> NodeId {
        self.cost
    }

    /// Variables updated by this step.
    pub fn variables(&self) -> &[NodeId] {
        &self.variables
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
}

/// Plain gradient descent: `value -= learning_rate * gradient`.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    learning_rate: WeightPrecision,
}

impl GradientDescent {
    pub fn new(learning_rate: WeightPrecision) -> GradientDescent {
        GradientDescent { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn apply_gradients(
        &mut self,
        graph: &mut Graph,
        gradients: Vec<(NodeId, TensorData)>,
    ) -> GraphResult<()> {
        let lr = self.learning_rate;
        for (variable, gradient) in gradients {
            let value = graph.variable_value_mut(variable)?;
            value.scaled_add(-lr, &gradient);
        }
        Ok(())
    }
}

/// Adam (Kingma & Ba, 2014) in the formulation Tensorflow uses, with the bias
/// correction folded into the step size:
///
/// ```text
/// lr_t = lr * sqrt(1 - beta2^t) / (1 - beta1^t)
/// m = beta1 * m + (1 - beta1) * g
/// v = beta2 * v + (1 - beta2) * g * g
/// value -= lr_t * m / (sqrt(v) + epsilon)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: WeightPrecision,
    pub beta1: WeightPrecision,
    pub beta2: WeightPrecision,
    pub epsilon: WeightPrecision,
    /// Number of updates applied so far
    t: i32,
    /// First and second moment estimates per variable
    moments: HashMap<NodeId, (TensorData, TensorData)>,
}

impl Adam {
    pub fn new(learning_rate: WeightPrecision) -> Adam {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            moments: HashMap::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn apply_gradients(
        &mut self,
        graph: &mut Graph,
        gradients: Vec<(NodeId, TensorData)>,
    ) -> GraphResult<()> {
        self.t += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let lr_t =
            self.learning_rate * (1. - beta2.powi(self.t)).sqrt() / (1. - beta1.powi(self.t));
        trace!("Adam step {} with effective learning rate {}", self.t, lr_t);

        for (variable, gradient) in gradients {
            let value = graph.variable_value_mut(variable)?;
            let (m, v) = self.moments.entry(variable).or_insert_with(|| {
                (
                    TensorData::zeros(gradient.raw_dim()),
                    TensorData::zeros(gradient.raw_dim()),
                )
            });
            Zip::from(value)
                .and(m)
                .and(v)
                .and(&gradient)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1. - beta1) * g;
                    *v = beta2 * *v + (1. - beta2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + epsilon);
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// cost = sum((w - target)^2)
    fn quadratic(graph: &mut Graph) -> (NodeId, NodeId, Feeds) {
        let w = graph.variable("w", array![3., -2., 0.5].into_dyn()).unwrap();
        let target = graph.placeholder("target", &[3]);
        let diff = graph.sub(w, target).unwrap();
        let squared = graph.square(diff).unwrap();
        let cost = graph.reduce_sum(squared).unwrap();
        let feeds = Feeds::new().with(target, array![1., 1., 1.].into_dyn());
        (w, cost, feeds)
    }

    #[test]
    fn test_first_adam_step_has_learning_rate_size() {
        let mut graph = Graph::new();
        let (w, cost, feeds) = quadratic(&mut graph);
        let mut step = Adam::new(0.1).minimize(&graph, cost).unwrap();
        assert_eq!(step.variables(), &[w]);

        step.run(&mut graph, &feeds).unwrap();
        let updated = graph.variable_value(w).unwrap();
        let expected = array![2.9f32, -1.9, 0.6];
        for (a, e) in updated.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5, "{} vs {}", a, e);
        }
        assert_eq!(step.optimizer().steps(), 1);
    }

    #[test]
    fn test_optimizers_decrease_cost() {
        let mut graph = Graph::new();
        let (_, cost, feeds) = quadratic(&mut graph);
        let mut adam = Adam::new(0.05).minimize(&graph, cost).unwrap();
        let first = adam.run(&mut graph, &feeds).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = adam.run(&mut graph, &feeds).unwrap();
        }
        assert!(last < first / 10., "{} did not go below {}", last, first / 10.);

        let mut graph = Graph::new();
        let (w, cost, feeds) = quadratic(&mut graph);
        let mut sgd = GradientDescent::new(0.25).minimize(&graph, cost).unwrap();
        let first = sgd.run(&mut graph, &feeds).unwrap();
        assert_eq!(first, 4. + 9. + 0.25);
        // step size 0.25 halves the distance to the target every run
        sgd.run(&mut graph, &feeds).unwrap();
        let expected = array![1.5f32, 0.25, 0.875].into_dyn();
        assert_eq!(graph.variable_value(w).unwrap(), &expected);
    }

    #[test]
    fn test_minimize_only_binds_dependencies() {
        let mut graph = Graph::new();
        let (w, cost, _) = quadratic(&mut graph);
        let other = graph.variable("other", array![1.].into_dyn()).unwrap();
        let step = GradientDescent::new(0.1).minimize(&graph, cost).unwrap();
        assert_eq!(step.variables(), &[w]);
        assert!(!step.variables().contains(&other));
        assert_eq!(step.cost(), cost);
    }
}

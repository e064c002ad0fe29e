//! Greedy layer-wise pretraining of a convolutional autoencoder.
//!
//! Every layer gets its own L2 reconstruction cost between the input it sees
//! and its pretrainer output, each minimized by an independent Adam optimizer.
//! All layer optimizers run on every batch, lower layers are not trained to
//! convergence before the upper ones start.
use crate::{
    array_to_image,
    batches::{BatchError, BatchResult, BatchShape},
    to_pixel,
};
use image::ImageError;
use log::{info, warn};
use ml::{
    checkpoint::{CheckpointError, Saver},
    execution::Feeds,
    graph::{Graph, GraphError, Initializer},
    models::{AutoencoderBuilder, ConvolutionalAutoencoder},
    optimizers::{Adam, Optimizer, TrainStep},
    WeightPrecision,
};
use ndarray::{Array4, Axis, Ix4};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type TrainingResult<T> = Result<T, TrainingError>;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Model error:\n {0}")]
    Graph(#[from] GraphError),
    #[error("Checkpoint error:\n {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Batch error:\n {0}")]
    Batch(#[from] BatchError),
    #[error("Sample image {path} could not be written: {source}")]
    Sample { path: PathBuf, source: ImageError },
    #[error("Reconstructions with {0} channels cannot be saved as image")]
    SampleDepth(usize),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Everything that parameterizes a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub iterations: u64,
    pub learning_rate: WeightPrecision,
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub depth: usize,
    /// Height and width of the convolution filters
    pub filter_size: usize,
    pub filters: usize,
    /// Size of the code at the top of the encoder
    pub representation_size: usize,
    /// Costs are logged and checkpoints saved every this many iterations
    pub report_interval: u64,
    pub init_stddev: WeightPrecision,
    pub seed: Option<u64>,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_prefix: String,
    pub max_to_keep: usize,
    /// Where to write a reconstruction of the first image at every report
    pub sample_path: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            iterations: 10000,
            learning_rate: 0.01,
            batch_size: 5,
            height: 256,
            width: 256,
            depth: 3,
            filter_size: 5,
            filters: 128,
            representation_size: 64,
            report_interval: 100,
            init_stddev: 1.0,
            seed: None,
            checkpoint_dir: PathBuf::from("."),
            checkpoint_prefix: "checkpoint.model".to_string(),
            max_to_keep: 5,
            sample_path: None,
        }
    }
}

impl TrainingConfig {
    pub fn batch_shape(&self) -> BatchShape {
        BatchShape {
            batch_size: self.batch_size,
            height: self.height,
            width: self.width,
            depth: self.depth,
        }
    }
}

/// Owns the graph, the autoencoder on it and one optimizer per layer.
pub struct Trainer {
    config: TrainingConfig,
    graph: Graph,
    autoencoder: ConvolutionalAutoencoder,
    layer_trainers: Vec<TrainStep<Adam>>,
    saver: Saver,
    next_iteration: u64,
}

impl Trainer {
    /// Builds conv -> flatten -> fully connected and the pretraining costs of every layer.
    pub fn new(config: TrainingConfig) -> TrainingResult<Trainer> {
        if config.report_interval == 0 {
            return Err(TrainingError::Config(
                "the report interval has to be at least 1".to_string(),
            ));
        }
        let mut graph = Graph::new();
        let images = graph.placeholder("images", &config.batch_shape().to_vec());
        let code = graph.placeholder("code", &[config.batch_size, config.representation_size]);
        let initializer = match config.seed {
            Some(seed) => Initializer::seeded(config.init_stddev, seed),
            None => Initializer::normal(config.init_stddev),
        };

        let mut builder =
            AutoencoderBuilder::new(&mut graph, images, code).with_initializer(initializer);
        builder
            .add_conv2d(
                config.filter_size,
                config.filter_size,
                config.depth,
                config.filters,
            )?
            .add_flatten()?
            .add_fc(config.representation_size)?;
        let autoencoder = builder.finalize()?;

        let mut layer_trainers = Vec::with_capacity(autoencoder.layers().len());
        for (index, layer) in autoencoder.layers().iter().enumerate() {
            info!(
                "Layer {}: encoder shape {:?}, pretrainer shape {:?}",
                index,
                graph.shape(layer.input)?,
                graph.shape(layer.pretrainer_output)?
            );
            let diff = graph.sub(layer.input, layer.pretrainer_output)?;
            let squared = graph.square(diff)?;
            let l2_cost = graph.reduce_sum(squared)?;
            layer_trainers.push(Adam::new(config.learning_rate).minimize(&graph, l2_cost)?);
        }

        let saver = Saver::new(
            &config.checkpoint_dir,
            &config.checkpoint_prefix,
            config.max_to_keep,
        );
        Ok(Trainer {
            config,
            graph,
            autoencoder,
            layer_trainers,
            saver,
            next_iteration: 0,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn autoencoder(&self) -> &ConvolutionalAutoencoder {
        &self.autoencoder
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Number of pretraining stages, one per layer.
    pub fn layer_trainers(&self) -> usize {
        self.layer_trainers.len()
    }

    /// Iteration the next call to [`Trainer::train`] starts at.
    pub fn next_iteration(&self) -> u64 {
        self.next_iteration
    }

    /// Runs every layer optimizer once on `batch`. Returns the cost of each
    /// layer, measured before its update.
    pub fn step(&mut self, batch: Array4<f32>) -> TrainingResult<Vec<f32>> {
        let feeds = Feeds::new().with(self.autoencoder.input(), batch.into_dyn());
        let mut costs = Vec::with_capacity(self.layer_trainers.len());
        for trainer in self.layer_trainers.iter_mut() {
            costs.push(trainer.run(&mut self.graph, &feeds)?);
        }
        Ok(costs)
    }

    /// Trains until the configured number of iterations is reached, reporting
    /// at every report interval. Stops early if `batches` runs dry.
    pub fn train<I>(&mut self, batches: I) -> TrainingResult<()>
    where
        I: IntoIterator<Item = BatchResult<Array4<f32>>>,
    {
        let mut batches = batches.into_iter();
        while self.next_iteration < self.config.iterations {
            let iteration = self.next_iteration;
            let batch = match batches.next() {
                Some(batch) => batch?,
                None => {
                    warn!("Ran out of batches at iteration {}", iteration);
                    break;
                }
            };
            let report = iteration % self.config.report_interval == 0;
            let sample_batch = match (&self.config.sample_path, report) {
                (Some(_), true) => Some(batch.clone()),
                _ => None,
            };

            let costs = self.step(batch)?;
            if report {
                info!("Iteration {}: layer costs {:?}", iteration, costs);
                self.saver.save(&self.graph, iteration)?;
                if let (Some(batch), Some(path)) = (sample_batch, self.config.sample_path.clone()) {
                    self.write_sample(batch, &path)?;
                }
            }
            self.next_iteration += 1;
        }
        Ok(())
    }

    /// Full autoencoder pass over `batch`.
    pub fn reconstruct(&self, batch: Array4<f32>) -> TrainingResult<Array4<f32>> {
        let reconstructed = self.autoencoder.reconstruct(&self.graph, batch.into_dyn())?;
        Ok(reconstructed
            .into_dimensionality::<Ix4>()
            .map_err(GraphError::from)?)
    }

    /// Saves the reconstruction of the first image of `batch` at `path`.
    pub fn write_sample(&self, batch: Array4<f32>, path: &Path) -> TrainingResult<()> {
        let reconstructed = self.reconstruct(batch)?;
        let first = reconstructed.index_axis(Axis(0), 0).map(to_pixel);
        let image = array_to_image(first).ok_or(TrainingError::SampleDepth(self.config.depth))?;
        image.save(path).map_err(|source| TrainingError::Sample {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved sample reconstruction to {}", path.display());
        Ok(())
    }

    /// Restores the most recent checkpoint; training continues after its iteration.
    pub fn restore_latest(&mut self) -> TrainingResult<u64> {
        let step = self.saver.restore_latest(&mut self.graph)?;
        self.next_iteration = step + 1;
        info!("Resuming training at iteration {}", self.next_iteration);
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter;
    use tempfile::tempdir;

    fn small_config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            iterations: 3,
            batch_size: 2,
            height: 4,
            width: 4,
            depth: 3,
            filter_size: 3,
            filters: 2,
            representation_size: 3,
            report_interval: 2,
            init_stddev: 0.1,
            seed: Some(1),
            checkpoint_dir: dir.to_path_buf(),
            ..TrainingConfig::default()
        }
    }

    fn batch() -> Array4<f32> {
        Array4::from_shape_fn((2, 4, 4, 3), |(n, i, j, c)| {
            ((n + i * 4 + j + c) % 5) as f32 / 4.0
        })
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_shape().dim(), (5, 256, 256, 3));
        assert_eq!(config.iterations, 10000);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.report_interval, 100);
        assert_eq!(config.checkpoint_prefix, "checkpoint.model");
    }

    #[test]
    fn test_one_trainer_per_layer() {
        let dir = tempdir().unwrap();
        let mut trainer = Trainer::new(small_config(dir.path())).unwrap();
        assert_eq!(trainer.layer_trainers(), 3);
        assert_eq!(trainer.autoencoder().layer_count(), 4);

        let costs = trainer.step(batch()).unwrap();
        assert_eq!(costs.len(), 3);
        assert!(costs.iter().all(|c| c.is_finite() && *c >= 0.0));
        // the flatten layer reconstructs its input exactly
        assert_eq!(costs[1], 0.0);
    }

    #[test]
    fn test_training_writes_checkpoints_and_resumes() {
        let dir = tempdir().unwrap();
        let sample = dir.path().join("sample.png");
        let mut config = small_config(dir.path());
        config.sample_path = Some(sample.clone());

        let mut trainer = Trainer::new(config.clone()).unwrap();
        trainer.train(iter::repeat_with(|| Ok(batch()))).unwrap();
        assert_eq!(trainer.next_iteration(), 3);
        assert!(dir.path().join("checkpoint.model-0.npz").exists());
        assert!(dir.path().join("checkpoint.model-2.npz").exists());
        assert!(!dir.path().join("checkpoint.model-1.npz").exists());
        assert!(sample.exists());

        // a differently initialized trainer picks up the saved variables
        config.seed = Some(2);
        config.iterations = 5;
        let mut resumed = Trainer::new(config).unwrap();
        assert_eq!(resumed.restore_latest().unwrap(), 2);
        assert_eq!(resumed.next_iteration(), 3);
        for (id, name) in trainer.graph().variables() {
            let restored = resumed.graph().variable_by_name(name).unwrap();
            assert_eq!(
                trainer.graph().variable_value(id).unwrap(),
                resumed.graph().variable_value(restored).unwrap(),
                "variable {}",
                name
            );
        }

        resumed.train(iter::repeat_with(|| Ok(batch()))).unwrap();
        assert_eq!(resumed.next_iteration(), 5);
        assert!(dir.path().join("checkpoint.model-4.npz").exists());
    }

    #[test]
    fn test_training_errors() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.report_interval = 0;
        assert!(matches!(
            Trainer::new(config),
            Err(TrainingError::Config(_))
        ));

        let mut config = small_config(dir.path());
        config.init_stddev = -1.0;
        assert!(matches!(
            Trainer::new(config),
            Err(TrainingError::Graph(GraphError::InvalidInitializer(_)))
        ));

        let mut trainer = Trainer::new(small_config(dir.path())).unwrap();
        let failing = iter::once(Err(BatchError::UnsupportedDepth(2)));
        assert!(matches!(
            trainer.train(failing),
            Err(TrainingError::Batch(_))
        ));

        // a batch stream that runs dry ends training early
        trainer.train(iter::once(Ok(batch()))).unwrap();
        assert_eq!(trainer.next_iteration(), 1);
    }

    #[test]
    fn test_reconstruct() {
        let dir = tempdir().unwrap();
        let trainer = Trainer::new(small_config(dir.path())).unwrap();
        let reconstructed = trainer.reconstruct(batch()).unwrap();
        assert_eq!(reconstructed.dim(), (2, 4, 4, 3));
        assert!(reconstructed.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}

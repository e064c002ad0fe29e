//! Command line interface for training a convolutional autoencoder on a set of images.

use autoencoder::{
    batches::BatchGenerator,
    training::{Trainer, TrainingConfig},
};
use env_logger::Builder;
use log::info;
use quicli::prelude::*;
use std::path::PathBuf;
use structopt::StructOpt;

/// Trains a convolutional autoencoder layer by layer on the images matching a glob.
/// Checkpoints are written to the checkpoint directory at every report interval.
#[derive(Debug, StructOpt)]
#[structopt(name = "autoencoder")]
struct TrainOpts {
    /// File glob of the training images, e.g. "images/*.png"
    images: String,
    /// Number of training iterations
    #[structopt(long = "iterations", default_value = "10000")]
    iterations: u64,
    /// Learning rate of the Adam optimizers
    #[structopt(long = "learning-rate", default_value = "0.01")]
    learning_rate: f32,
    #[structopt(long = "batch-size", default_value = "5")]
    batch_size: usize,
    /// Height of the training images in pixels
    #[structopt(long = "height", default_value = "256")]
    height: usize,
    /// Width of the training images in pixels
    #[structopt(long = "width", default_value = "256")]
    width: usize,
    /// Channels per pixel: 1 (luma), 3 (RGB) or 4 (RGBA)
    #[structopt(long = "depth", default_value = "3")]
    depth: usize,
    /// Height and width of the convolution filters
    #[structopt(long = "filter-size", default_value = "5")]
    filter_size: usize,
    /// Number of convolution filters
    #[structopt(long = "filters", default_value = "128")]
    filters: usize,
    /// Size of the code the images are compressed to
    #[structopt(long = "representation-size", default_value = "64")]
    representation_size: usize,
    /// Log costs and save a checkpoint every this many iterations
    #[structopt(long = "report-interval", default_value = "100")]
    report_interval: u64,
    /// Standard deviation of the initial weights
    #[structopt(long = "init-stddev", default_value = "1.0")]
    init_stddev: f32,
    /// Seed for the weight initialization, random if not given
    #[structopt(long = "seed")]
    seed: Option<u64>,
    #[structopt(long = "checkpoint-dir", default_value = ".", parse(from_os_str))]
    checkpoint_dir: PathBuf,
    #[structopt(long = "checkpoint-prefix", default_value = "checkpoint.model")]
    checkpoint_prefix: String,
    /// Number of checkpoints to keep around, 0 keeps all
    #[structopt(long = "max-to-keep", default_value = "5")]
    max_to_keep: usize,
    /// Continue from the latest checkpoint in the checkpoint directory
    #[structopt(long = "restore")]
    restore: bool,
    /// Writes a reconstruction of the first image of the batch here at every report
    #[structopt(long = "sample", parse(from_os_str))]
    sample: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

impl TrainOpts {
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.verbosity.log_level().to_level_filter())
            .init();

        Ok(())
    }

    fn config(&self) -> TrainingConfig {
        TrainingConfig {
            iterations: self.iterations,
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            height: self.height,
            width: self.width,
            depth: self.depth,
            filter_size: self.filter_size,
            filters: self.filters,
            representation_size: self.representation_size,
            report_interval: self.report_interval,
            init_stddev: self.init_stddev,
            seed: self.seed,
            checkpoint_dir: self.checkpoint_dir.clone(),
            checkpoint_prefix: self.checkpoint_prefix.clone(),
            max_to_keep: self.max_to_keep,
            sample_path: self.sample.clone(),
        }
    }

    fn run(&self) -> CliResult {
        let config = self.config();
        let batches = BatchGenerator::new(&self.images, config.batch_shape())?;
        let mut trainer = Trainer::new(config)?;
        if self.restore {
            let step = trainer.restore_latest()?;
            info!("Restored checkpoint of iteration {}", step);
        }
        trainer.train(batches)?;
        info!("Training finished after {} iterations", trainer.next_iteration());
        Ok(())
    }
}

fn main() -> CliResult {
    let args = TrainOpts::from_args();
    args.setup_env_logger()?;
    args.run()
}

//! A small static-graph tensor engine on top of ndarray, together with the
//! convolutional autoencoder that is assembled on it.
//!
//! Graphs are built once (placeholders, variables and operations), then run
//! any number of times with different feeds. Gradients are computed by
//! reverse-mode differentiation over the same graph.
pub mod activation_functions;
pub mod checkpoint;
pub mod convolutions;
pub mod execution;
pub mod fully_connected;
pub mod graph;
pub mod models;
pub mod optimizers;
pub mod transposed_convolutions;

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Dense tensor values flowing through the graph.
pub type TensorData = ndarray::ArrayD<ImagePrecision>;

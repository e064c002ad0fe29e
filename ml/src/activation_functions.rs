//! Activation functions for the autoencoder layers, together with their gradients.
use ndarray::*;

use crate::ImagePrecision;

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Backpropagates `gradient` through a relu that was applied to `input`.
/// Gradients are only passed where the input was strictly positive.
pub fn relu_gradient<D: Dimension>(
    input: &Array<ImagePrecision, D>,
    gradient: &Array<ImagePrecision, D>,
) -> Array<ImagePrecision, D> {
    Zip::from(gradient)
        .and(input)
        .map_collect(|&g, &x| if x > 0. { g } else { 0. })
}

//! Dense layer kernels. Activations are `[batch, inputs]`, weights are stored
//! as `[inputs, outputs]` (Tensorflow layout), biases cover the trailing axes
//! of whatever they are added to.
use crate::{ImagePrecision, TensorData, WeightPrecision};
use ndarray::*;

pub fn matmul<'a, V, W>(data: V, weights: W) -> Array2<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix2>,
    W: AsArray<'a, WeightPrecision, Ix2>,
{
    let data: ArrayView2<ImagePrecision> = data.into();
    let weights: ArrayView2<WeightPrecision> = weights.into();
    data.dot(&weights)
}

/// Adds the bias to every entry of the leading axes of `data`.
pub fn add_bias(data: &TensorData, bias: &TensorData) -> Result<TensorData, ShapeError> {
    let bias = bias
        .broadcast(data.raw_dim())
        .ok_or_else(|| ShapeError::from_kind(ErrorKind::IncompatibleShape))?;
    Ok(data + &bias)
}

/// Gradient of [`add_bias`] with respect to the bias: the incoming gradient
/// summed over the leading axes.
pub fn bias_gradient(gradient: &TensorData, bias_shape: &[usize]) -> Result<TensorData, ShapeError> {
    let bias_len: usize = bias_shape.iter().product();
    let rows = gradient.len() / bias_len.max(1);
    let per_row = Array2::from_shape_vec((rows, bias_len), gradient.iter().copied().collect())?;
    per_row.sum_axis(Axis(0)).into_shape(IxDyn(bias_shape))
}

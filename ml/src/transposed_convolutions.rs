//! Transposed convolutions (also wrongly called deconvolution layers)
//! are learnable upsampling maps. With stride 1 and `SAME` padding they keep the
//! spatial size and are exactly the adjoint of the corresponding convolution,
//! which is also how the input gradient of a convolution is computed.
//! More can be read here:
//! - https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers
//! - https://ieee.nitk.ac.in/blog/deconv/
use crate::{
    convolutions::{filter_matrix, pixel_matrix, same_padding, source_index},
    ImagePrecision, WeightPrecision,
};
use ndarray::*;

/// Inverse of [`crate::convolutions::im2col`]: scatters every row back onto the receptive
/// field it was taken from, summing overlapping contributions. Entries that fall
/// into the padding are dropped.
pub fn col2im<'a, T>(
    cols: T,
    shape: (usize, usize, usize, usize),
    kernel_height: usize,
    kernel_width: usize,
) -> Array4<ImagePrecision>
where
    T: AsArray<'a, ImagePrecision, Ix2>,
{
    let cols: ArrayView2<ImagePrecision> = cols.into();
    let (batch, height, width, channels) = shape;
    let (pad_top, pad_left) = same_padding(kernel_height, kernel_width);
    debug_assert_eq!(cols.dim(), (batch * height * width, kernel_height * kernel_width * channels));

    let mut images = Array4::zeros(shape);
    for n in 0..batch {
        for i in 0..height {
            for j in 0..width {
                let row = cols.row((n * height + i) * width + j);
                for a in 0..kernel_height {
                    let y = match source_index(i, a, pad_top, height) {
                        Some(y) => y,
                        None => continue,
                    };
                    for b in 0..kernel_width {
                        let x = match source_index(j, b, pad_left, width) {
                            Some(x) => x,
                            None => continue,
                        };
                        let start = (a * kernel_width + b) * channels;
                        let mut pixel = images.slice_mut(s![n, y, x, ..]);
                        pixel += &row.slice(s![start..start + channels]);
                    }
                }
            }
        }
    }
    images
}

/// Transposed 2D convolution with stride 1 and `SAME` padding.
///
/// The input has shape `[batch, height, width, filters]` and the filter
/// `[kernel height, kernel width, channels, filters]`, the same filter that the
/// forward convolution from `channels` to `filters` would use. The output has
/// shape `[batch, height, width, channels]`.
pub fn conv2d_transpose_same<'a, T, V>(
    filter: T,
    images: V,
) -> Result<Array4<ImagePrecision>, ShapeError>
where
    T: AsArray<'a, WeightPrecision, Ix4>,
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let filter: ArrayView4<WeightPrecision> = filter.into();
    let images: ArrayView4<ImagePrecision> = images.into();
    let (batch, height, width, filters) = images.dim();
    let (kh, kw, channels, filter_filters) = filter.dim();
    debug_assert_eq!(filters, filter_filters);

    let cols = pixel_matrix(&images)?.dot(&filter_matrix(&filter)?.t());
    Ok(col2im(&cols, (batch, height, width, channels), kh, kw))
}

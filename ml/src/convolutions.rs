use crate::{ImagePrecision, WeightPrecision};
use ndarray::*;

/// Zeros added before the first row / column for a stride 1 `SAME` convolution.
/// The remaining `kernel - 1 - before` zeros go after the last row / column,
/// as in Tensorflow.
pub fn same_padding(kernel_height: usize, kernel_width: usize) -> (usize, usize) {
    ((kernel_height - 1) / 2, (kernel_width - 1) / 2)
}

/// Maps output position `out` and kernel offset `k` to the input position it reads,
/// or None if it falls into the padding.
#[inline]
pub(crate) fn source_index(out: usize, k: usize, pad: usize, len: usize) -> Option<usize> {
    let pos = (out + k).checked_sub(pad)?;
    if pos < len {
        Some(pos)
    } else {
        None
    }
}

/// Unrolls every receptive field of a NHWC image batch into a row.
/// The result has shape `(batch * height * width, kernel_height * kernel_width * channels)`,
/// columns are ordered like a `[kernel_height, kernel_width, channels]` filter in standard layout.
/// More on the technique here:
/// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
pub fn im2col<'a, V>(images: V, kernel_height: usize, kernel_width: usize) -> Array2<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let images: ArrayView4<ImagePrecision> = images.into();
    let (batch, height, width, channels) = images.dim();
    let (pad_top, pad_left) = same_padding(kernel_height, kernel_width);

    let mut cols = Array2::zeros((
        batch * height * width,
        kernel_height * kernel_width * channels,
    ));
    for n in 0..batch {
        for i in 0..height {
            for j in 0..width {
                let mut row = cols.row_mut((n * height + i) * width + j);
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
                        row.slice_mut(s![start..start + channels])
                            .assign(&images.slice(s![n, y, x, ..]));
                    }
                }
            }
        }
    }
    cols
}

/// Filter `[kh, kw, in, out]` as a `(kh * kw * in, out)` matrix.
pub(crate) fn filter_matrix(
    filter: &ArrayView4<WeightPrecision>,
) -> Result<Array2<WeightPrecision>, ShapeError> {
    let (kh, kw, channels, filters) = filter.dim();
    Array::from_shape_vec(
        (kh * kw * channels, filters),
        filter.iter().copied().collect(),
    )
}

/// Rows of a NHWC batch, one per pixel: `(batch * height * width, channels)`.
pub(crate) fn pixel_matrix(
    images: &ArrayView4<ImagePrecision>,
) -> Result<Array2<ImagePrecision>, ShapeError> {
    let (n, h, w, c) = images.dim();
    Array::from_shape_vec((n * h * w, c), images.iter().copied().collect())
}

/// 2D convolution with stride 1 and `SAME` padding.
/// Images are NHWC, the filter has shape `[kernel height, kernel width, channels, filters]`
/// (Tensorflow layout). Returns `[batch, height, width, filters]`.
pub fn conv2d_same<'a, T, V>(
    filter: T,
    images: V,
) -> Result<Array4<ImagePrecision>, ShapeError>
where
    // Both can be passed as owned array or view.
    T: AsArray<'a, WeightPrecision, Ix4>,
    V: AsArray<'a, ImagePrecision, Ix4>,
{
    let filter: ArrayView4<WeightPrecision> = filter.into();
    let images: ArrayView4<ImagePrecision> = images.into();
    let (batch, height, width, channels) = images.dim();
    let (kh, kw, filter_channels, filters) = filter.dim();
    debug_assert_eq!(channels, filter_channels);

    let cols = im2col(&images, kh, kw);
    let activations = cols.dot(&filter_matrix(&filter)?);
    activations.into_shape((batch, height, width, filters))
}

/// Gradient of [`conv2d_same`] with respect to the filter, given the layer input
/// and the gradient flowing into the layer output.
pub fn conv2d_filter_gradient<'a, V, G>(
    images: V,
    output_gradient: G,
    kernel_height: usize,
    kernel_width: usize,
) -> Result<Array4<WeightPrecision>, ShapeError>
where
    V: AsArray<'a, ImagePrecision, Ix4>,
    G: AsArray<'a, ImagePrecision, Ix4>,
{
    let images: ArrayView4<ImagePrecision> = images.into();
    let output_gradient: ArrayView4<ImagePrecision> = output_gradient.into();
    let channels = images.len_of(Axis(3));
    let filters = output_gradient.len_of(Axis(3));

    let cols = im2col(&images, kernel_height, kernel_width);
    let gradient = cols.t().dot(&pixel_matrix(&output_gradient)?);
    Array::from_shape_vec(
        (kernel_height, kernel_width, channels, filters),
        gradient.iter().copied().collect(),
    )
}

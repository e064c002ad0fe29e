//! Layer-wise training of convolutional autoencoders on image files.
//!
//! The model itself lives in the `ml` crate, this crate feeds it with batches of
//! images and drives the training loop.
pub mod batches;
pub mod training;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::Array3;

/// Turns a `(height, width, depth)` ndarray into an image. Depth 1 gives a
/// grayscale, 3 an RGB and 4 an RGBA image; other depths return None.
pub fn array_to_image(arr: Array3<u8>) -> Option<DynamicImage> {
    let (height, width, depth) = arr.dim();
    // into_raw_vec keeps the memory order, which has to be row major here
    let raw = if arr.is_standard_layout() {
        arr.into_raw_vec()
    } else {
        arr.iter().copied().collect()
    };
    let (width, height) = (width as u32, height as u32);

    match depth {
        1 => GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, raw).map(DynamicImage::ImageRgba8),
        _ => None,
    }
}

/// Turns output from the network into a pixel value.
pub fn to_pixel(x: &f32) -> u8 {
    (x.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_to_pixel() {
        assert_eq!(to_pixel(&-0.5), 0);
        assert_eq!(to_pixel(&0.2), 51);
        assert_eq!(to_pixel(&3.0), 255);
    }

    #[test]
    fn test_array_to_image() {
        let arr = Array::from_shape_vec((2, 3, 3), (0..18).collect()).unwrap();
        let image = array_to_image(arr).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (3, 2));
        // pixel (x = 1, y = 1) starts at offset (1 * 3 + 1) * 3
        assert_eq!(image.get_pixel(1, 1).0, [12, 13, 14]);

        // column major memory, read in logical order
        let transposed = Array::from_shape_vec((3, 2, 1), (0..6).collect())
            .unwrap()
            .permuted_axes([1, 0, 2]);
        let gray = array_to_image(transposed).unwrap();
        assert_eq!(gray.to_luma8().into_raw(), vec![0, 2, 4, 1, 3, 5]);

        assert!(array_to_image(Array3::zeros((2, 2, 2))).is_none());
    }
}

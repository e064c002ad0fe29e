//! Endless stream of image batches read from a file glob.
use glob::{glob, GlobError, Pattern, PatternError};
use image::{io::Reader as ImageReader, DynamicImage, ImageError};
use log::{debug, warn};
use ndarray::{s, Array, Array3, Array4};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid file pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        source: PatternError,
    },
    #[error("Matching files could not be listed: {0}")]
    Glob(#[from] GlobError),
    #[error("Image {path} could not be read: {source}")]
    Image { path: PathBuf, source: ImageError },
    #[error("Image {path} is {actual_width}x{actual_height} pixels, expected {width}x{height}")]
    Dimensions {
        path: PathBuf,
        width: usize,
        height: usize,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("Images with {0} channels are not supported, use 1 (luma), 3 (RGB) or 4 (RGBA)")]
    UnsupportedDepth(usize),
}

/// Shape of the batches, `(batch_size, height, width, depth)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub depth: usize,
}

impl BatchShape {
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        (self.batch_size, self.height, self.width, self.depth)
    }

    pub fn to_vec(&self) -> Vec<usize> {
        vec![self.batch_size, self.height, self.width, self.depth]
    }
}

/// Iterator over batches of the first `batch_size` files matching a glob, in
/// sorted order. Every batch re-scans the glob, so the iterator never ends.
/// Slots without a matching file stay zero. Pixel values are scaled to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct BatchGenerator {
    pattern: String,
    shape: BatchShape,
}

impl BatchGenerator {
    pub fn new(pattern: &str, shape: BatchShape) -> BatchResult<BatchGenerator> {
        Pattern::new(pattern).map_err(|source| BatchError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        if !matches!(shape.depth, 1 | 3 | 4) {
            return Err(BatchError::UnsupportedDepth(shape.depth));
        }
        Ok(BatchGenerator {
            pattern: pattern.to_string(),
            shape,
        })
    }

    /// Reads one batch.
    pub fn next_batch(&self) -> BatchResult<Array4<f32>> {
        let mut batch = Array4::zeros(self.shape.dim());
        let paths = glob(&self.pattern).map_err(|source| BatchError::Pattern {
            pattern: self.pattern.clone(),
            source,
        })?;

        let mut filled = 0;
        for (index, path) in paths.take(self.shape.batch_size).enumerate() {
            let image = self.load_image(&path?)?;
            batch.slice_mut(s![index, .., .., ..]).assign(&image);
            filled += 1;
        }

        if filled == 0 {
            warn!("No files match {}, the batch is all zeros", self.pattern);
        } else if filled < self.shape.batch_size {
            debug!(
                "Only {} of {} batch slots filled from {}",
                filled, self.shape.batch_size, self.pattern
            );
        }
        Ok(batch)
    }

    /// Returns the image at `path` as `(height, width, depth)` array, scaled to `[0, 1]`.
    fn load_image(&self, path: &Path) -> BatchResult<Array3<f32>> {
        let image_error = |source| BatchError::Image {
            path: path.to_path_buf(),
            source,
        };
        let image = ImageReader::open(path)
            .map_err(|e| image_error(ImageError::IoError(e)))?
            .decode()
            .map_err(image_error)?;

        let (width, height, raw) = raw_pixels(&image, self.shape.depth)?;
        if width as usize != self.shape.width || height as usize != self.shape.height {
            return Err(BatchError::Dimensions {
                path: path.to_path_buf(),
                width: self.shape.width,
                height: self.shape.height,
                actual_width: width,
                actual_height: height,
            });
        }
        let pixels = Array::from_shape_vec(
            (self.shape.height, self.shape.width, self.shape.depth),
            raw,
        )
        .map_err(|_| BatchError::UnsupportedDepth(self.shape.depth))?;
        Ok(pixels.mapv(|p| p as f32 / 255.0))
    }
}

/// Converts to the requested number of channels, returns `(width, height, HWC pixels)`.
fn raw_pixels(image: &DynamicImage, depth: usize) -> BatchResult<(u32, u32, Vec<u8>)> {
    Ok(match depth {
        1 => {
            let buffer = image.to_luma8();
            (buffer.width(), buffer.height(), buffer.into_raw())
        }
        3 => {
            let buffer = image.to_rgb8();
            (buffer.width(), buffer.height(), buffer.into_raw())
        }
        4 => {
            let buffer = image.to_rgba8();
            (buffer.width(), buffer.height(), buffer.into_raw())
        }
        _ => return Err(BatchError::UnsupportedDepth(depth)),
    })
}

impl Iterator for BatchGenerator {
    type Item = BatchResult<Array4<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use tempfile::tempdir;

    fn shape(batch_size: usize, depth: usize) -> BatchShape {
        BatchShape {
            batch_size,
            height: 2,
            width: 3,
            depth,
        }
    }

    fn pattern(dir: &Path) -> String {
        dir.join("*.png").to_str().unwrap().to_string()
    }

    #[test]
    fn test_batches_are_normalized_and_zero_filled() {
        let dir = tempdir().unwrap();
        RgbImage::from_pixel(3, 2, Rgb([255, 0, 51]))
            .save(dir.path().join("a.png"))
            .unwrap();
        RgbImage::from_pixel(3, 2, Rgb([0, 255, 0]))
            .save(dir.path().join("b.png"))
            .unwrap();

        let mut generator = BatchGenerator::new(&pattern(dir.path()), shape(3, 3)).unwrap();
        let batch = generator.next().unwrap().unwrap();
        assert_eq!(batch.dim(), (3, 2, 3, 3));
        // sorted order: a.png first
        assert_eq!(batch[[0, 1, 2, 0]], 1.0);
        assert_eq!(batch[[0, 1, 2, 1]], 0.0);
        assert_eq!(batch[[0, 0, 0, 2]], 0.2);
        assert_eq!(batch[[1, 0, 1, 1]], 1.0);
        assert!(batch.slice(s![2, .., .., ..]).iter().all(|&v| v == 0.0));
        dir.close().unwrap();
    }

    #[test]
    fn test_generator_never_ends() {
        let dir = tempdir().unwrap();
        GrayImage::from_pixel(3, 2, Luma([255]))
            .save(dir.path().join("only.png"))
            .unwrap();
        let generator = BatchGenerator::new(&pattern(dir.path()), shape(2, 1)).unwrap();
        let batches: Vec<_> = generator.take(4).collect();
        assert_eq!(batches.len(), 4);
        for batch in batches {
            let batch = batch.unwrap();
            assert_eq!(batch.slice(s![0, .., .., ..]).sum(), 6.0);
            assert_eq!(batch.slice(s![1, .., .., ..]).sum(), 0.0);
        }

        // nothing matches at all
        let empty = tempdir().unwrap();
        let mut generator = BatchGenerator::new(&pattern(empty.path()), shape(2, 1)).unwrap();
        assert_eq!(generator.next().unwrap().unwrap().sum(), 0.0);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            BatchGenerator::new("images/[", shape(1, 3)),
            Err(BatchError::Pattern { .. })
        ));
        assert!(matches!(
            BatchGenerator::new("*.png", shape(1, 2)),
            Err(BatchError::UnsupportedDepth(2))
        ));

        let dir = tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]))
            .save(dir.path().join("large.png"))
            .unwrap();
        let mut generator = BatchGenerator::new(&pattern(dir.path()), shape(1, 3)).unwrap();
        match generator.next().unwrap() {
            Err(BatchError::Dimensions {
                actual_width,
                actual_height,
                ..
            }) => assert_eq!((actual_width, actual_height), (4, 4)),
            other => panic!("unexpected result {:?}", other),
        }

        std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();
        let mut generator = BatchGenerator::new(&pattern(dir.path()), shape(1, 3)).unwrap();
        // broken.png sorts before large.png
        assert!(matches!(
            generator.next().unwrap(),
            Err(BatchError::Image { .. })
        ));
        dir.close().unwrap();
    }
}

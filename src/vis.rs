//! Sample image grids.

use anyhow::{ensure, Context, Result};
use image::{GrayImage, RgbImage};
use ndarray::ArrayView4;
use std::path::Path;

const PER_ROW: usize = 8;
const PADDING: usize = 2;

/// Saves a batch as a PNG grid, 8 images per row with 2px padding.
///
/// Values are de-normalized from `[-1, 1]` and clamped. Batches with 1 channel are written as
/// grayscale, 3 channels as RGB.
///
/// **Errors**
///
/// The batch must be non-empty with 1 or 3 channels.
pub fn save_image_grid(images: &ArrayView4<f32>, path: &Path) -> Result<()> {
    let (count, channels, h, w) = images.dim();
    ensure!(count > 0, "cannot save an empty image grid!");
    ensure!(
        channels == 1 || channels == 3,
        "image grids support 1 or 3 channels, found {channels}!"
    );
    let cols = count.min(PER_ROW);
    let rows = (count + PER_ROW - 1) / PER_ROW;
    let width = cols * w + (cols + 1) * PADDING;
    let height = rows * h + (rows + 1) * PADDING;
    let mut pixels = vec![0u8; width * height * channels];
    for index in 0..count {
        let (row, col) = (index / PER_ROW, index % PER_ROW);
        let top = row * h + (row + 1) * PADDING;
        let left = col * w + (col + 1) * PADDING;
        for i in 0..h {
            for j in 0..w {
                for c in 0..channels {
                    let value = denormalize(images[(index, c, i, j)]);
                    pixels[((top + i) * width + left + j) * channels + c] = value;
                }
            }
        }
    }
    let saved = if channels == 1 {
        GrayImage::from_raw(width as u32, height as u32, pixels)
            .map(|buffer| buffer.save(path))
    } else {
        RgbImage::from_raw(width as u32, height as u32, pixels)
            .map(|buffer| buffer.save(path))
    };
    match saved {
        Some(result) => result.with_context(|| format!("saving image grid to {path:?} failed!")),
        None => anyhow::bail!("image grid buffer for {path:?} has the wrong length!"),
    }
}

fn denormalize(x: f32) -> u8 {
    ((x + 1.) * 127.5).clamp(0., 255.) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn denormalize_bounds() {
        assert_eq!(denormalize(-1.), 0);
        assert_eq!(denormalize(1.), 255);
        assert_eq!(denormalize(100.), 255);
        assert_eq!(denormalize(0.), 127);
    }

    #[test]
    fn saves_gray_and_rgb_grids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let gray = Array4::from_elem([10, 1, 8, 8], 0.5f32);
        let gray_path = dir.path().join("gray.png");
        save_image_grid(&gray.view(), &gray_path)?;
        assert!(gray_path.exists());
        let rgb = Array4::from_elem([3, 3, 8, 8], -0.5f32);
        let rgb_path = dir.path().join("rgb.png");
        save_image_grid(&rgb.view(), &rgb_path)?;
        assert!(rgb_path.exists());
        Ok(())
    }

    #[test]
    fn unsupported_channels_fail() {
        let images = Array4::<f32>::zeros([2, 2, 4, 4]);
        let path = Path::new("unused.png");
        assert!(save_image_grid(&images.view(), path).is_err());
    }

    #[test]
    fn empty_batch_fails() {
        let images = Array4::<f32>::zeros([0, 1, 4, 4]);
        assert!(save_image_grid(&images.view(), Path::new("unused.png")).is_err());
    }
}

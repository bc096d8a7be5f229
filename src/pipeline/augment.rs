//! Per-image geometric and photometric transforms.
//!
//! All transforms work on a single-channel `f32` image. Out-of-range values
//! are never clipped.

use ndarray::{Array2, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Random augmentation applied to every training image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Rotation angle is drawn from [-max, max] degrees
    pub max_rotation_degrees: f64,
    /// Brightness delta is drawn from [-max, max]
    pub max_brightness_delta: f64,
    pub contrast_lower: f64,
    pub contrast_upper: f64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        AugmentConfig {
            max_rotation_degrees: 25.0,
            max_brightness_delta: 0.2,
            contrast_lower: 0.5,
            contrast_upper: 1.5,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rotation_degrees < 0.0 || self.max_brightness_delta < 0.0 {
            return Err(Error::InvalidConfig(
                "rotation and brightness bounds must be non-negative".to_string(),
            ));
        }
        if self.contrast_lower < 0.0 || self.contrast_lower > self.contrast_upper {
            return Err(Error::InvalidConfig(format!(
                "contrast range [{}, {}] is invalid",
                self.contrast_lower, self.contrast_upper
            )));
        }
        Ok(())
    }

    /// Resize, rotate, then jitter brightness and contrast
    pub fn apply<R: Rng>(
        &self,
        image: ArrayView2<f32>,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> Array2<f32> {
        let resized = resize_bilinear(image, height, width);

        let max_angle = self.max_rotation_degrees.to_radians() as f32;
        let angle = rng.gen_range(-max_angle..=max_angle);
        let mut out = rotate(resized.view(), angle);

        let max_delta = self.max_brightness_delta as f32;
        adjust_brightness(&mut out, rng.gen_range(-max_delta..=max_delta));

        let factor = rng.gen_range(self.contrast_lower as f32..=self.contrast_upper as f32);
        adjust_contrast(&mut out, factor);

        out
    }
}

/// Bilinear resize with half-pixel centers. Resizing to the same size is the identity.
pub fn resize_bilinear(image: ArrayView2<f32>, height: usize, width: usize) -> Array2<f32> {
    let (in_h, in_w) = image.dim();
    if (in_h, in_w) == (height, width) {
        return image.to_owned();
    }

    let scale_y = in_h as f32 / height as f32;
    let scale_x = in_w as f32 / width as f32;

    Array2::from_shape_fn((height, width), |(y, x)| {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
        sample_bilinear(&image, src_y, src_x)
    })
}

/// Rotate counter-clockwise by `angle` radians about the image center.
/// Sampling is bilinear and points falling outside the image take the nearest edge pixel.
pub fn rotate(image: ArrayView2<f32>, angle: f32) -> Array2<f32> {
    let (h, w) = image.dim();
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let (sin, cos) = angle.sin_cos();

    Array2::from_shape_fn((h, w), |(y, x)| {
        let dy = y as f32 - cy;
        let dx = x as f32 - cx;
        let src_x = cos * dx - sin * dy + cx;
        let src_y = sin * dx + cos * dy + cy;
        sample_bilinear(&image, src_y, src_x)
    })
}

pub fn adjust_brightness(image: &mut Array2<f32>, delta: f32) {
    image.mapv_inplace(|p| p + delta);
}

/// Scale each pixel's distance from the image mean by `factor`
pub fn adjust_contrast(image: &mut Array2<f32>, factor: f32) {
    let mean = image.mean().unwrap_or(0.0);
    image.mapv_inplace(|p| (p - mean) * factor + mean);
}

fn sample_bilinear(image: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
    let (h, w) = image.dim();
    let y = y.clamp(0.0, (h - 1) as f32);
    let x = x.clamp(0.0, (w - 1) as f32);

    let y0 = y.floor() as usize;
    let x0 = x.floor() as usize;
    let y1 = (y0 + 1).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let wy = y - y0 as f32;
    let wx = x - x0 as f32;

    let top = image[[y0, x0]] * (1.0 - wx) + image[[y0, x1]] * wx;
    let bottom = image[[y1, x0]] * (1.0 - wx) + image[[y1, x1]] * wx;

    top * (1.0 - wy) + bottom * wy
}

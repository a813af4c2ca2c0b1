//! Smoothing kernels: validation, the default Gaussian, and convolution.
//!
//! A kernel whose weights sum to (nearly) zero cannot be normalised and
//! is rejected. A kernel whose weights do not sum to 1 is still used,
//! but raises [`CleanWarning::KernelNotNormalized`]. Convolution always
//! divides by the kernel sum, so the smoothed image keeps the flux
//! scale of its input.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::types::{CleanWarning, GalmaskError, Image};

/// Absolute tolerance for "sum is zero".
pub const ZERO_SUM_ATOL: f64 = 1e-8;

/// Absolute tolerance for "sum is one".
pub const UNIT_SUM_ATOL: f64 = 1e-8;

/// Relative tolerance for "sum is one".
pub const UNIT_SUM_RTOL: f64 = 1e-5;

/// Conversion factor from a Gaussian FWHM to its standard deviation,
/// `1 / (2 * sqrt(2 * ln 2))`.
pub const FWHM_TO_SIGMA: f64 = 0.424_660_900_144_009_5;

/// A 2D convolution kernel stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    weights: Vec<f64>,
    width: usize,
    height: usize,
}

impl Kernel {
    /// Create a kernel from row-major weights.
    ///
    /// Odd sizes are recommended so the kernel has a centre pixel; even
    /// sizes are accepted and anchored at `(height / 2, width / 2)`.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::EmptyInput`] for a zero-sized kernel and
    /// [`GalmaskError::InvalidConfig`] when `weights.len()` is not
    /// `width * height`.
    pub fn new(weights: Vec<f64>, width: usize, height: usize) -> Result<Self, GalmaskError> {
        if width == 0 || height == 0 {
            return Err(GalmaskError::EmptyInput);
        }
        if weights.len() != width * height {
            return Err(GalmaskError::InvalidConfig(format!(
                "kernel has {} weights, expected {width}x{height}",
                weights.len()
            )));
        }
        Ok(Self {
            weights,
            width,
            height,
        })
    }

    /// Create a kernel from row-major rows.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Kernel::new`], plus
    /// [`GalmaskError::InvalidConfig`] for ragged rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, GalmaskError> {
        let width = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != width) {
            return Err(GalmaskError::InvalidConfig(
                "kernel rows differ in length".to_string(),
            ));
        }
        Self::new(rows.concat(), width, rows.len())
    }

    /// The 3x3 Gaussian with a FWHM of 3 pixels, normalised to sum 1.
    #[must_use]
    pub fn default_gaussian() -> Self {
        Self::gaussian(3.0 * FWHM_TO_SIGMA, 3)
    }

    /// A `size`x`size` Gaussian sampled at pixel centres, normalised to
    /// sum 1. Even sizes are bumped to the next odd size.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn gaussian(sigma: f64, size: usize) -> Self {
        let size = if size % 2 == 0 { size + 1 } else { size };
        let half = (size / 2) as f64;
        let inv_2s2 = 1.0 / (2.0 * sigma * sigma);
        let mut weights = Vec::with_capacity(size * size);
        for ky in 0..size {
            for kx in 0..size {
                let dy = ky as f64 - half;
                let dx = kx as f64 - half;
                weights.push((-(dx.mul_add(dx, dy * dy)) * inv_2s2).exp());
            }
        }
        let sum: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= sum;
        }
        Self {
            weights,
            width: size,
            height: size,
        }
    }

    /// Kernel width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Kernel height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Row-major weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sum of all weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// A copy of this kernel scaled by `factor`.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            weights: self.weights.iter().map(|w| w * factor).collect(),
            width: self.width,
            height: self.height,
        }
    }

    /// Validate the kernel sum.
    ///
    /// Returns `Ok(Some(warning))` when the kernel is usable but not
    /// normalised.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::DegenerateKernel`] when the sum is
    /// within [`ZERO_SUM_ATOL`] of zero (or not finite), and
    /// [`GalmaskError::InvalidConfig`] when a deserialized kernel's
    /// weights do not match its shape.
    pub fn check(&self) -> Result<Option<CleanWarning>, GalmaskError> {
        if self.weights.len() != self.width * self.height {
            return Err(GalmaskError::InvalidConfig(format!(
                "kernel has {} weights, expected {}x{}",
                self.weights.len(),
                self.width,
                self.height
            )));
        }
        let sum = self.sum();
        if !sum.is_finite() || sum.abs() <= ZERO_SUM_ATOL {
            return Err(GalmaskError::DegenerateKernel { sum });
        }
        if (sum - 1.0).abs() > UNIT_SUM_RTOL.mul_add(1.0, UNIT_SUM_ATOL) {
            return Ok(Some(CleanWarning::KernelNotNormalized { sum }));
        }
        Ok(None)
    }

    /// Convolve `image` with the sum-normalised kernel.
    ///
    /// Pixels outside the image count as zero, as do non-finite pixels.
    /// The output has the shape of the input.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Kernel::check`].
    pub fn convolve(&self, image: &Image) -> Result<Image, GalmaskError> {
        self.check()?;
        let norm = self.sum();
        let (w, h) = (image.width() as usize, image.height() as usize);
        let (cx, cy) = (self.width / 2, self.height / 2);
        let src = image.as_raw();

        let mut out = vec![0.0f64; w * h];
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for ky in 0..self.height {
                    // Convolution flips the kernel: sample at y + cy - ky.
                    let Some(sy) = (y + cy).checked_sub(ky).filter(|&sy| sy < h) else {
                        continue;
                    };
                    let k_row = &self.weights[ky * self.width..(ky + 1) * self.width];
                    for (kx, &k) in k_row.iter().enumerate() {
                        let Some(sx) = (x + cx).checked_sub(kx).filter(|&sx| sx < w) else {
                            continue;
                        };
                        let v = src[sy * w + sx];
                        if v.is_finite() {
                            acc = k.mul_add(v, acc);
                        }
                    }
                }
                out[y * w + x] = acc / norm;
            }
        }
        Image::from_raw(image.width(), image.height(), out).ok_or(GalmaskError::EmptyInput)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::default_gaussian()
    }
}

/// Subtract a scalar level from every pixel.
#[must_use]
pub fn subtract(image: &Image, level: f64) -> Image {
    Image::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y).0[0] - level])
    })
}

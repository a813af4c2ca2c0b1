//! Sigma-clipped statistics for scalar background estimation.
//!
//! Values farther than `sigma` standard deviations from the median are
//! rejected repeatedly until nothing more is clipped or `max_iters`
//! rounds have run. Non-finite samples are ignored throughout.

use serde::{Deserialize, Serialize};

use crate::types::{GalmaskError, Image};

/// Sigma-clipping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SigmaClip {
    /// Rejection bound in standard deviations around the median.
    pub sigma: f64,
    /// Maximum number of clipping rounds.
    pub max_iters: usize,
}

impl Default for SigmaClip {
    fn default() -> Self {
        Self {
            sigma: 3.0,
            max_iters: 10,
        }
    }
}

/// Statistics of the samples that survived clipping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClippedStats {
    /// Mean of the surviving samples.
    pub mean: f64,
    /// Median of the surviving samples.
    pub median: f64,
    /// Population standard deviation of the surviving samples.
    pub std: f64,
}

/// Sigma-clipped mean, median and standard deviation.
///
/// Returns `None` when there are no finite samples.
#[must_use]
pub fn sigma_clipped_stats(
    samples: impl IntoIterator<Item = f64>,
    clip: SigmaClip,
) -> Option<ClippedStats> {
    let mut data: Vec<f64> = samples.into_iter().filter(|v| v.is_finite()).collect();
    if data.is_empty() {
        return None;
    }
    data.sort_by(f64::total_cmp);

    for _ in 0..clip.max_iters {
        let center = median_of_sorted(&data);
        let (_, std) = mean_std(&data);
        let lo = clip.sigma.mul_add(-std, center);
        let hi = clip.sigma.mul_add(std, center);
        let before = data.len();
        data.retain(|&v| v >= lo && v <= hi);
        if data.len() == before || data.is_empty() {
            break;
        }
    }
    if data.is_empty() {
        return None;
    }

    let (mean, std) = mean_std(&data);
    Some(ClippedStats {
        mean,
        median: median_of_sorted(&data),
        std,
    })
}

/// Scalar background level: the sigma-clipped median of the image.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] if the image has no finite
/// pixels.
pub fn median_background(image: &Image) -> Result<f64, GalmaskError> {
    image_stats(image).map(|s| s.median)
}

/// Sigma-clipped statistics over every pixel of an image.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] if the image has no finite
/// pixels.
pub fn image_stats(image: &Image) -> Result<ClippedStats, GalmaskError> {
    sigma_clipped_stats(image.pixels().map(|p| p.0[0]), SigmaClip::default())
        .ok_or(GalmaskError::EmptyInput)
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        f64::midpoint(sorted[n / 2 - 1], sorted[n / 2])
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_std(data: &[f64]) -> (f64, f64) {
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    use super::*;

    #[test]
    fn median_of_odd_and_even_lengths() {
        assert!((median_of_sorted(&[1.0, 2.0, 9.0]) - 2.0).abs() < f64::EPSILON);
        assert!((median_of_sorted(&[1.0, 2.0, 4.0, 9.0]) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn constant_data_has_zero_spread() {
        let stats = sigma_clipped_stats(vec![4.0; 25], SigmaClip::default()).unwrap();
        assert!((stats.median - 4.0).abs() < f64::EPSILON);
        assert!((stats.mean - 4.0).abs() < f64::EPSILON);
        assert!(stats.std.abs() < f64::EPSILON);
    }

    #[test]
    fn outliers_are_clipped() {
        let mut data = vec![10.0; 99];
        data[0] = 9.0;
        data[1] = 11.0;
        data.push(1.0e6);
        let stats = sigma_clipped_stats(data, SigmaClip::default()).unwrap();
        assert!((stats.median - 10.0).abs() < f64::EPSILON);
        assert!(stats.mean < 10.1, "outlier survived: mean = {}", stats.mean);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let stats =
            sigma_clipped_stats(vec![f64::NAN, 1.0, 2.0, 3.0, f64::INFINITY], SigmaClip::default())
                .unwrap();
        assert!((stats.median - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_finite_samples_yields_none() {
        assert!(sigma_clipped_stats(vec![f64::NAN], SigmaClip::default()).is_none());
        assert!(sigma_clipped_stats(Vec::new(), SigmaClip::default()).is_none());
    }

    #[test]
    fn gaussian_noise_recovers_level_and_sigma() {
        let mut rng = StdRng::seed_from_u64(42);
        let normal = Normal::new(100.0, 5.0).unwrap();
        let img = Image::from_fn(100, 100, |_, _| image::Luma([normal.sample(&mut rng)]));
        let stats = image_stats(&img).unwrap();
        assert!((stats.median - 100.0).abs() < 0.5, "median {}", stats.median);
        assert!((stats.std - 5.0).abs() < 0.5, "std {}", stats.std);
        assert!((median_background(&img).unwrap() - stats.median).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_image_background_is_an_error() {
        let img = Image::from_pixel(2, 2, image::Luma([f64::NAN]));
        assert!(matches!(
            median_background(&img),
            Err(GalmaskError::EmptyInput)
        ));
    }
}

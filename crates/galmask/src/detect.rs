//! Source detection: threshold the smoothed image and label what's left.
//!
//! The threshold is `nsigma` sigma-clipped standard deviations of the
//! background-subtracted image. Smoothed pixels strictly above it are
//! grouped with 8-connectivity and groups smaller than `npixels` are
//! discarded.

use image::Luma;

use crate::components::{ComponentLabeler, Components, ImageprocLabeler, renumber_in_raster_order};
use crate::stats::image_stats;
use crate::types::{Connectivity, GalmaskError, Image, LabelMap};

/// Detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Threshold in standard deviations above the (zero) background.
    pub nsigma: f64,
    /// Minimum connected pixel count of a source.
    pub npixels: usize,
}

/// Capability: produce an initial label map from an image.
pub trait Detector {
    /// Detect sources.
    ///
    /// `residual` is the background-subtracted image used for noise
    /// estimation; `smoothed` is the kernel-smoothed residual that is
    /// thresholded.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::NoDetection`] if no source survives.
    fn detect(
        &self,
        residual: &Image,
        smoothed: &Image,
        params: &DetectionParams,
    ) -> Result<LabelMap, GalmaskError>;
}

/// Default detector: global sigma threshold plus minimum-area filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigmaThresholdDetector;

impl Detector for SigmaThresholdDetector {
    fn detect(
        &self,
        residual: &Image,
        smoothed: &Image,
        params: &DetectionParams,
    ) -> Result<LabelMap, GalmaskError> {
        let threshold = detection_threshold(residual, params.nsigma)?;
        log::debug!("detection threshold {threshold:.4} ({} sigma)", params.nsigma);
        let labels = detect_sources(smoothed, threshold, params.npixels);
        let count = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
        if count == 0 {
            return Err(GalmaskError::NoDetection);
        }
        Ok(labels)
    }
}

/// Per-pixel detection threshold for a background-subtracted image.
///
/// The background is already removed, so the threshold is just
/// `nsigma` times the sigma-clipped noise.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] if the image has no finite
/// pixels.
pub fn detection_threshold(residual: &Image, nsigma: f64) -> Result<f64, GalmaskError> {
    Ok(nsigma * image_stats(residual)?.std)
}

/// Label 8-connected groups of at least `npixels` pixels strictly above
/// `threshold`. Labels run `1..=n` in raster order; the map may be
/// empty.
#[must_use]
pub fn detect_sources(data: &Image, threshold: f64, npixels: usize) -> LabelMap {
    let binary = LabelMap::from_fn(data.width(), data.height(), |x, y| {
        let v = data.get_pixel(x, y).0[0];
        Luma([u32::from(v.is_finite() && v > threshold)])
    });
    let labels = ImageprocLabeler.label_regions(&binary, Connectivity::Eight);
    remove_small_labels(labels, npixels)
}

/// Zero every label with fewer than `npixels` pixels and renumber the
/// rest in raster order.
#[must_use]
pub fn remove_small_labels(labels: LabelMap, npixels: usize) -> LabelMap {
    let min_area = u64::try_from(npixels).unwrap_or(u64::MAX);
    let components = Components::from_labels(labels);
    let mut labels = components.labels;
    for px in labels.pixels_mut() {
        let label = px.0[0] as usize;
        if label != 0 && components.areas[label - 1] < min_area {
            px.0[0] = 0;
        }
    }
    renumber_in_raster_order(&labels)
}

//! galmask: isolate the central galaxy of an astronomical cutout
//! (sans-IO).
//!
//! Takes a calibrated single-channel image and returns it with every
//! source other than the central galaxy zeroed, together with the
//! `{0, 1}` mask that did the zeroing:
//! background subtraction -> smoothing -> detection -> deblending ->
//! farthest-peak pruning -> central-object selection.
//!
//! This crate has **no I/O dependencies**. It operates on in-memory
//! [`image`] buffers; reading FITS files or writing results is left to
//! the caller.

pub mod components;
pub mod deblend;
pub mod detect;
pub mod diagnostics;
pub mod geometry;
pub mod kernel;
pub mod peaks;
pub mod pipeline;
pub mod select;
pub mod stats;
pub mod types;

use web_time::Instant;

pub use deblend::DeblendLevels;
pub use diagnostics::PipelineDiagnostics;
pub use geometry::DistanceMetric;
pub use kernel::Kernel;
pub use pipeline::{Capabilities, Pipeline, PipelineStage};
pub use select::SelectionMode;
pub use types::{
    CleanConfig, CleanResult, CleanWarning, Connectivity, Dimensions, GalmaskError, Image,
    LabelMap, Mask, PixelCoord, Point, StagedResult, image_from_rows, label_map_from_rows,
};

use diagnostics::{PipelineSummary, StageDiagnostics, count_labels, count_mask_pixels};

/// Isolate the central galaxy of `image`.
///
/// When `seg_image` is given it replaces source detection; it must
/// have the shape of `image`.
///
/// # Pipeline steps
///
/// 1. Validate the kernel (warn if not normalised, fail if it sums to 0)
/// 2. Subtract the sigma-clipped median background
/// 3. Smooth with the normalised kernel
/// 4. Detect sources above `nsigma` (skipped when `seg_image` is given)
/// 5. Optional deblending of overlapping sources
/// 6. Optional removal of the label owning the peak farthest from the
///    centre
/// 7. Central-object selection (pluggable mode)
/// 8. `mask ⊙ image`
///
/// # Errors
///
/// Returns [`GalmaskError::DegenerateKernel`] for a kernel summing to
/// zero, [`GalmaskError::NoDetection`] if nothing is detected,
/// [`GalmaskError::NoComponent`] if selection is left with an empty
/// map, [`GalmaskError::ShapeMismatch`] for a mis-shaped `seg_image`,
/// and [`GalmaskError::InvalidConfig`] /
/// [`GalmaskError::InvalidConnectivity`] for bad parameters.
pub fn clean(
    image: &Image,
    seg_image: Option<&LabelMap>,
    config: &CleanConfig,
) -> Result<CleanResult, GalmaskError> {
    clean_with(image, seg_image, config, &Capabilities::default())
}

/// [`clean`] running on caller-supplied capabilities.
///
/// # Errors
///
/// Same conditions as [`clean`], plus whatever the supplied detector
/// reports.
pub fn clean_with(
    image: &Image,
    seg_image: Option<&LabelMap>,
    config: &CleanConfig,
    caps: &Capabilities<'_>,
) -> Result<CleanResult, GalmaskError> {
    let staged = Pipeline::with_capabilities(image, seg_image, config.clone(), *caps)
        .smooth()?
        .detect()?
        .deblend()
        .prune()?
        .select()?
        .into_result();
    Ok(staged.into_clean_result())
}

/// [`clean`] keeping every intermediate, plus per-stage diagnostics.
///
/// # Errors
///
/// Same conditions as [`clean`].
pub fn clean_staged(
    image: &Image,
    seg_image: Option<&LabelMap>,
    config: &CleanConfig,
) -> Result<(StagedResult, PipelineDiagnostics), GalmaskError> {
    clean_staged_with(image, seg_image, config, &Capabilities::default())
}

/// [`clean_staged`] running on caller-supplied capabilities.
///
/// # Errors
///
/// Same conditions as [`clean_with`].
pub fn clean_staged_with(
    image: &Image,
    seg_image: Option<&LabelMap>,
    config: &CleanConfig,
    caps: &Capabilities<'_>,
) -> Result<(StagedResult, PipelineDiagnostics), GalmaskError> {
    let start = Instant::now();

    let t = Instant::now();
    let smoothed = Pipeline::with_capabilities(image, seg_image, config.clone(), *caps).smooth()?;
    let smooth = timed(&smoothed, t);

    let t = Instant::now();
    let detected = smoothed.detect()?;
    let detect = timed(&detected, t);
    let detected_labels = count_labels(detected.detection());

    let t = Instant::now();
    let deblended = detected.deblend();
    let deblend = deblended.applied().then(|| timed(&deblended, t));

    let t = Instant::now();
    let pruned = deblended.prune()?;
    let prune = pruned.applied().then(|| timed(&pruned, t));

    let t = Instant::now();
    let selected = pruned.select()?;
    let select = timed(&selected, t);

    let staged = selected.into_result();
    let dimensions = Dimensions::of(image);
    let diagnostics = PipelineDiagnostics {
        smooth,
        detect,
        deblend,
        prune,
        select,
        total_duration: start.elapsed(),
        summary: PipelineSummary {
            image_width: dimensions.width,
            image_height: dimensions.height,
            pixel_count: dimensions.pixel_count(),
            detected_labels,
            mask_pixels: count_mask_pixels(&staged.mask),
            warning_count: staged.warnings.len(),
        },
    };
    Ok((staged, diagnostics))
}

fn timed<S: PipelineStage>(stage: &S, started: Instant) -> StageDiagnostics {
    StageDiagnostics {
        duration: started.elapsed(),
        metrics: stage.metrics(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;

    /// A round galaxy at the centre and a compact star off to the side.
    fn galaxy_and_star(width: u32, height: u32) -> Image {
        let (cx, cy) = (f64::from(width) / 2.0, f64::from(height) / 2.0);
        Image::from_fn(width, height, |x, y| {
            let (fx, fy) = (f64::from(x), f64::from(y));
            let galaxy = 80.0 * (-((fx - cx).powi(2) + (fy - cy).powi(2)) / 30.0).exp();
            let star = 50.0 * (-((fx - 5.0).powi(2) + (fy - 5.0).powi(2)) / 3.0).exp();
            let texture = f64::from((x * 3 + y * 11) % 7) * 0.05;
            Luma([galaxy + star + texture])
        })
    }

    #[test]
    fn clean_keeps_the_galaxy_and_drops_the_star() {
        let img = galaxy_and_star(50, 40);
        let result = clean(&img, None, &CleanConfig::default()).unwrap();
        assert!(result.mask.get_pixel(25, 20).0[0] > 0.5);
        assert!(result.mask.get_pixel(5, 5).0[0] < 0.5);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn mask_is_binary_and_masked_matches_image_in_every_mode() {
        let img = galaxy_and_star(50, 40);
        for mode in SelectionMode::ALL {
            let config = CleanConfig {
                mode,
                ..CleanConfig::default()
            };
            let result = clean(&img, None, &config).unwrap();
            for (x, y, m) in result.mask.enumerate_pixels() {
                let m = m.0[0];
                assert!(
                    [0.0, 1.0].contains(&m),
                    "mode {mode}: mask value {m} at ({x}, {y})"
                );
                let expected = m * img.get_pixel(x, y).0[0];
                assert!(
                    (result.masked.get_pixel(x, y).0[0] - expected).abs() < 1e-12,
                    "mode {mode}: masked value at ({x}, {y})"
                );
            }
        }
    }

    #[test]
    fn every_mode_selects_the_galaxy() {
        let img = galaxy_and_star(50, 40);
        for mode in SelectionMode::ALL {
            let config = CleanConfig {
                mode,
                ..CleanConfig::default()
            };
            let result = clean(&img, None, &config).unwrap();
            assert!(result.mask.get_pixel(25, 20).0[0] > 0.5, "mode {mode}");
        }
    }

    #[test]
    fn clean_matches_the_staged_outputs() {
        let img = galaxy_and_star(50, 40);
        let config = CleanConfig::default();
        let plain = clean(&img, None, &config).unwrap();
        let (staged, diagnostics) = clean_staged(&img, None, &config).unwrap();
        assert_eq!(plain.mask.as_raw(), staged.mask.as_raw());
        assert_eq!(diagnostics.summary.image_width, 50);
        assert_eq!(diagnostics.summary.image_height, 40);
        assert!(diagnostics.deblend.is_some());
        assert!(diagnostics.prune.is_some());
        assert_eq!(staged.pruned_label, Some(staged.deblended.get_pixel(5, 5).0[0]));
    }

    #[test]
    fn disabled_stages_have_no_diagnostics() {
        let img = galaxy_and_star(50, 40);
        let config = CleanConfig {
            deblend: false,
            remove_local_max: false,
            ..CleanConfig::default()
        };
        let (staged, diagnostics) = clean_staged(&img, None, &config).unwrap();
        assert!(diagnostics.deblend.is_none());
        assert!(diagnostics.prune.is_none());
        assert!(staged.peaks.is_empty());
        assert!(diagnostics.report().contains("Select"));
    }

    /// Labels a fixed 10x10 square, ignoring the image.
    struct FixedDetector;

    impl detect::Detector for FixedDetector {
        fn detect(
            &self,
            residual: &Image,
            _smoothed: &Image,
            _params: &detect::DetectionParams,
        ) -> Result<LabelMap, GalmaskError> {
            Ok(LabelMap::from_fn(residual.width(), residual.height(), |x, y| {
                Luma([u32::from((20..30).contains(&x) && (15..25).contains(&y))])
            }))
        }
    }

    #[test]
    fn custom_capabilities_are_used() {
        let img = galaxy_and_star(50, 40);
        let caps = Capabilities {
            detector: &FixedDetector,
            ..Capabilities::default()
        };
        let config = CleanConfig {
            deblend: false,
            remove_local_max: false,
            ..CleanConfig::default()
        };
        let result = clean_with(&img, None, &config, &caps).unwrap();
        let kept = result.mask.pixels().filter(|p| p.0[0] > 0.5).count();
        assert_eq!(kept, 100);
    }

    #[test]
    fn staged_run_reports_custom_capabilities() {
        let img = galaxy_and_star(50, 40);
        let caps = Capabilities {
            detector: &FixedDetector,
            ..Capabilities::default()
        };
        let config = CleanConfig {
            deblend: false,
            remove_local_max: false,
            ..CleanConfig::default()
        };
        let (staged, diagnostics) = clean_staged_with(&img, None, &config, &caps).unwrap();
        assert_eq!(
            diagnostics.detect.metrics,
            diagnostics::StageMetrics::Detect {
                supplied: false,
                label_count: 1,
                foreground_pixels: 100,
            }
        );
        assert_eq!(diagnostics.summary.mask_pixels, 100);
        assert_eq!(count_mask_pixels(&staged.mask), 100);
    }
}

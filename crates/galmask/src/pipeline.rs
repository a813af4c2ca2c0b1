//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::clean`] which runs every stage in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use galmask::{CleanConfig, GalmaskError, Image, Pipeline};
//! # fn run(image: &Image) -> Result<(), GalmaskError> {
//! let selected = Pipeline::new(image, None, CleanConfig::default())
//!     .smooth()?
//!     .detect()?
//!     .deblend()
//!     .prune()?
//!     .select()?;
//!
//! let staged = selected.into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline
//! state (or `Result` for fallible stages), carrying the intermediates
//! later stages still need. The input image and segmentation map are
//! borrowed; every map produced along the way is owned by the stage
//! that holds it.

use crate::components::{ComponentLabeler, ImageprocLabeler};
use crate::deblend::{DeblendParams, Deblender, MultiThresholdDeblender};
use crate::detect::{DetectionParams, Detector, SigmaThresholdDetector};
use crate::diagnostics::{StageMetrics, count_foreground, count_labels, count_mask_pixels};
use crate::kernel::{Kernel, subtract};
use crate::peaks::{LocalMaxPeakFinder, PeakFinder, PeakParams, prune_farthest_peak};
use crate::select::{SelectionInput, apply_mask, select_central};
use crate::stats::median_background;
use crate::types::{
    CleanConfig, CleanWarning, Dimensions, GalmaskError, Image, LabelMap, Mask, PixelCoord,
    StagedResult, ensure_same_shape,
};

/// The pluggable primitives the pipeline runs on.
///
/// [`Capabilities::default`] wires in the crate's own implementations.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    /// Produces the initial label map when no map is supplied.
    pub detector: &'a dyn Detector,
    /// Splits blended labels.
    pub deblender: &'a dyn Deblender,
    /// Finds local maxima for pruning.
    pub peak_finder: &'a dyn PeakFinder,
    /// Connected-component labelling for selection.
    pub labeler: &'a dyn ComponentLabeler,
}

impl Default for Capabilities<'static> {
    fn default() -> Self {
        Self {
            detector: &SigmaThresholdDetector,
            deblender: &MultiThresholdDeblender,
            peak_finder: &LocalMaxPeakFinder,
            labeler: &ImageprocLabeler,
        }
    }
}

/// Raise a warning: log it and keep it for the caller.
fn raise(warnings: &mut Vec<CleanWarning>, warning: CleanWarning) {
    log::warn!("{warning}");
    warnings.push(warning);
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`smooth`](Self::smooth) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .smooth() to continue"]
pub struct Pending<'a> {
    image: &'a Image,
    seg_image: Option<&'a LabelMap>,
    config: CleanConfig,
    caps: Capabilities<'a>,
}

impl<'a> Pending<'a> {
    /// The input image.
    #[must_use]
    pub const fn image(&self) -> &'a Image {
        self.image
    }

    /// Validate the configuration, subtract the background and smooth.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::InvalidConfig`] or
    /// [`GalmaskError::InvalidConnectivity`] for a bad configuration,
    /// [`GalmaskError::DegenerateKernel`] for a kernel summing to zero,
    /// and [`GalmaskError::EmptyInput`] when the image has no finite
    /// pixels.
    pub fn smooth(self) -> Result<Smoothed<'a>, GalmaskError> {
        self.config.validate()?;
        if self.image.width() == 0 || self.image.height() == 0 {
            return Err(GalmaskError::EmptyInput);
        }

        let mut warnings = Vec::new();
        let kernel = self.config.kernel.clone().unwrap_or_default();
        if let Some(warning) = kernel.check()? {
            raise(&mut warnings, warning);
        }

        let background = median_background(self.image)?;
        let residual = subtract(self.image, background);
        let smoothed = kernel.convolve(&residual)?;
        log::debug!(
            "{}: background {background:.4}, {}x{} kernel",
            Smoothed::NAME,
            kernel.width(),
            kernel.height()
        );

        Ok(Smoothed {
            image: self.image,
            seg_image: self.seg_image,
            config: self.config,
            caps: self.caps,
            warnings,
            kernel,
            background,
            residual,
            smoothed,
        })
    }
}

// ───────────────────────── Stage 1: Smoothed ─────────────────────────

/// Pipeline state after background subtraction and smoothing.
///
/// Call [`detect`](Self::detect) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .detect() to continue"]
pub struct Smoothed<'a> {
    image: &'a Image,
    seg_image: Option<&'a LabelMap>,
    config: CleanConfig,
    caps: Capabilities<'a>,
    warnings: Vec<CleanWarning>,
    kernel: Kernel,
    background: f64,
    residual: Image,
    smoothed: Image,
}

impl<'a> Smoothed<'a> {
    /// Scalar background level that was subtracted.
    #[must_use]
    pub const fn background(&self) -> f64 {
        self.background
    }

    /// The kernel used for smoothing.
    #[must_use]
    pub const fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Background-subtracted image.
    #[must_use]
    pub const fn residual(&self) -> &Image {
        &self.residual
    }

    /// Background-subtracted, smoothed image.
    #[must_use]
    pub const fn smoothed(&self) -> &Image {
        &self.smoothed
    }

    /// Detect sources, or adopt the caller's segmentation map.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::ShapeMismatch`] if a supplied map does
    /// not match the image, and [`GalmaskError::NoDetection`] if
    /// detection finds nothing.
    pub fn detect(self) -> Result<Detected<'a>, GalmaskError> {
        let (detection, supplied) = match self.seg_image {
            Some(seg) => {
                ensure_same_shape(self.image, seg)?;
                (seg.clone(), true)
            }
            None => {
                let params = DetectionParams {
                    nsigma: self.config.nsigma,
                    npixels: self.config.npixels,
                };
                let labels = self
                    .caps
                    .detector
                    .detect(&self.residual, &self.smoothed, &params)?;
                (labels, false)
            }
        };
        log::debug!(
            "{}: {} labels ({})",
            Detected::NAME,
            count_labels(&detection),
            if supplied { "supplied" } else { "detected" }
        );

        Ok(Detected {
            image: self.image,
            config: self.config,
            caps: self.caps,
            warnings: self.warnings,
            background: self.background,
            smoothed: self.smoothed,
            detection,
            supplied,
        })
    }
}

// ───────────────────────── Stage 2: Detected ─────────────────────────

/// Pipeline state after detection.
///
/// Call [`deblend`](Self::deblend) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .deblend() to continue"]
pub struct Detected<'a> {
    image: &'a Image,
    config: CleanConfig,
    caps: Capabilities<'a>,
    warnings: Vec<CleanWarning>,
    background: f64,
    smoothed: Image,
    detection: LabelMap,
    supplied: bool,
}

impl<'a> Detected<'a> {
    /// The detection map (or the supplied segmentation map).
    #[must_use]
    pub const fn detection(&self) -> &LabelMap {
        &self.detection
    }

    /// Whether the map was supplied by the caller.
    #[must_use]
    pub const fn supplied(&self) -> bool {
        self.supplied
    }

    /// Deblend overlapping sources, or pass the map through when
    /// deblending is disabled.
    pub fn deblend(self) -> Deblended<'a> {
        let deblended = if self.config.deblend {
            let params = DeblendParams {
                npixels: self.config.npixels,
                nlevels: self.config.nlevels,
                contrast: self.config.contrast,
                levels: self.config.deblend_levels,
            };
            self.caps
                .deblender
                .deblend(&self.smoothed, self.detection.clone(), &params)
        } else {
            self.detection.clone()
        };
        if self.config.deblend {
            log::debug!(
                "{}: {} -> {} labels",
                Deblended::NAME,
                count_labels(&self.detection),
                count_labels(&deblended)
            );
        }

        Deblended {
            image: self.image,
            config: self.config,
            caps: self.caps,
            warnings: self.warnings,
            background: self.background,
            smoothed: self.smoothed,
            detection: self.detection,
            deblended,
        }
    }
}

// ───────────────────────── Stage 3: Deblended ────────────────────────

/// Pipeline state after deblending.
///
/// Call [`prune`](Self::prune) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .prune() to continue"]
pub struct Deblended<'a> {
    image: &'a Image,
    config: CleanConfig,
    caps: Capabilities<'a>,
    warnings: Vec<CleanWarning>,
    background: f64,
    smoothed: Image,
    detection: LabelMap,
    deblended: LabelMap,
}

impl<'a> Deblended<'a> {
    /// The deblended map (equal to the detection map when disabled).
    #[must_use]
    pub const fn deblended(&self) -> &LabelMap {
        &self.deblended
    }

    /// Whether deblending ran.
    #[must_use]
    pub const fn applied(&self) -> bool {
        self.config.deblend
    }

    /// Remove the label owning the peak farthest from the centre.
    ///
    /// With no peaks the map passes through unchanged and a
    /// [`CleanWarning::NoPeaksFound`] is raised.
    ///
    /// # Errors
    ///
    /// Propagates errors of [`prune_farthest_peak`].
    pub fn prune(self) -> Result<Pruned<'a>, GalmaskError> {
        let mut warnings = self.warnings;
        let center = Dimensions::of(self.image).center();

        let (pruned, peaks, removed) = if self.config.remove_local_max {
            let params = PeakParams {
                min_distance: self.config.min_distance,
                num_peaks: self.config.num_peaks,
                num_peaks_per_label: self.config.num_peaks_per_label,
            };
            let peaks = self
                .caps
                .peak_finder
                .find_peaks(&self.smoothed, &self.deblended, &params);
            if peaks.is_empty() {
                raise(&mut warnings, CleanWarning::NoPeaksFound);
                (self.deblended.clone(), peaks, None)
            } else {
                let (map, removed) = prune_farthest_peak(
                    self.deblended.clone(),
                    &peaks,
                    center,
                    self.config.distance_metric,
                )?;
                (map, peaks, removed)
            }
        } else {
            (self.deblended.clone(), Vec::new(), None)
        };
        log::debug!(
            "{}: {} peaks, removed label {removed:?}",
            Pruned::NAME,
            peaks.len()
        );

        Ok(Pruned {
            image: self.image,
            config: self.config,
            caps: self.caps,
            warnings,
            background: self.background,
            smoothed: self.smoothed,
            detection: self.detection,
            deblended: self.deblended,
            peaks,
            removed,
            pruned,
        })
    }
}

// ───────────────────────── Stage 4: Pruned ───────────────────────────

/// Pipeline state after farthest-peak pruning.
///
/// Call [`select`](Self::select) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .select() to continue"]
pub struct Pruned<'a> {
    image: &'a Image,
    config: CleanConfig,
    caps: Capabilities<'a>,
    warnings: Vec<CleanWarning>,
    background: f64,
    smoothed: Image,
    detection: LabelMap,
    deblended: LabelMap,
    peaks: Vec<PixelCoord>,
    removed: Option<u32>,
    pruned: LabelMap,
}

impl<'a> Pruned<'a> {
    /// Peaks found (empty when pruning is disabled).
    #[must_use]
    pub fn peaks(&self) -> &[PixelCoord] {
        &self.peaks
    }

    /// The label that was removed, if any.
    #[must_use]
    pub const fn removed_label(&self) -> Option<u32> {
        self.removed
    }

    /// The deblended map pruning started from.
    #[must_use]
    pub const fn deblended(&self) -> &LabelMap {
        &self.deblended
    }

    /// The map after pruning.
    #[must_use]
    pub const fn pruned(&self) -> &LabelMap {
        &self.pruned
    }

    /// Whether pruning ran.
    #[must_use]
    pub const fn applied(&self) -> bool {
        self.config.remove_local_max
    }

    /// Select the central object and apply its mask.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::NoComponent`] when the map the selection
    /// mode inspects is empty.
    pub fn select(self) -> Result<Selected, GalmaskError> {
        let input = SelectionInput {
            detection: &self.detection,
            pruned: &self.pruned,
            connectivity: self.config.connectivity()?,
            center: Dimensions::of(self.image).center(),
            metric: self.config.distance_metric,
        };
        let mask = select_central(self.config.mode, &input, self.caps.labeler)?;
        let masked = apply_mask(self.image, &mask);
        log::debug!(
            "{}: mode {} kept {} pixels",
            Selected::NAME,
            self.config.mode,
            count_mask_pixels(&mask)
        );

        Ok(Selected {
            config: self.config,
            warnings: self.warnings,
            background: self.background,
            smoothed: self.smoothed,
            detection: self.detection,
            deblended: self.deblended,
            peaks: self.peaks,
            removed: self.removed,
            pruned: self.pruned,
            mask,
            masked,
        })
    }
}

// ───────────────────────── Stage 5: Selected ─────────────────────────

/// Final pipeline state: the central object has been selected.
///
/// Call [`into_result`](Self::into_result) to collect every
/// intermediate.
#[must_use = "call .into_result() to obtain the outputs"]
pub struct Selected {
    config: CleanConfig,
    warnings: Vec<CleanWarning>,
    background: f64,
    smoothed: Image,
    detection: LabelMap,
    deblended: LabelMap,
    peaks: Vec<PixelCoord>,
    removed: Option<u32>,
    pruned: LabelMap,
    mask: Mask,
    masked: Image,
}

impl Selected {
    /// Footprint of the central object.
    #[must_use]
    pub const fn mask(&self) -> &Mask {
        &self.mask
    }

    /// `mask ⊙ image`.
    #[must_use]
    pub const fn masked(&self) -> &Image {
        &self.masked
    }

    /// Warnings raised so far.
    #[must_use]
    pub fn warnings(&self) -> &[CleanWarning] {
        &self.warnings
    }

    /// Consume the pipeline and return the full [`StagedResult`].
    #[must_use]
    pub fn into_result(self) -> StagedResult {
        StagedResult {
            background: self.background,
            smoothed: self.smoothed,
            detection: self.detection,
            deblended: self.deblended,
            peaks: self.peaks,
            pruned_label: self.removed,
            pruned: self.pruned,
            mask: self.mask,
            masked: self.masked,
            warnings: self.warnings,
        }
    }
}

// ─────────────────────────── PipelineStage trait ─────────────────────

/// Total number of stages after [`Pending`].
pub const STAGE_COUNT: usize = 5;

/// Trait implemented by every completed stage.
pub trait PipelineStage {
    /// Human-readable name of this stage (e.g. `"smooth"`).
    const NAME: &'static str;

    /// One-based index of this stage (`1` for [`Smoothed`] through `5`
    /// for [`Selected`]).
    const INDEX: usize;

    /// Metrics describing the work done to reach this state.
    fn metrics(&self) -> StageMetrics;
}

impl PipelineStage for Smoothed<'_> {
    const NAME: &'static str = "smooth";
    const INDEX: usize = 1;

    fn metrics(&self) -> StageMetrics {
        StageMetrics::Smooth {
            background: self.background,
            kernel_width: self.kernel.width(),
            kernel_height: self.kernel.height(),
            kernel_sum: self.kernel.sum(),
        }
    }
}

impl PipelineStage for Detected<'_> {
    const NAME: &'static str = "detect";
    const INDEX: usize = 2;

    fn metrics(&self) -> StageMetrics {
        StageMetrics::Detect {
            supplied: self.supplied,
            label_count: count_labels(&self.detection),
            foreground_pixels: count_foreground(&self.detection),
        }
    }
}

impl PipelineStage for Deblended<'_> {
    const NAME: &'static str = "deblend";
    const INDEX: usize = 3;

    fn metrics(&self) -> StageMetrics {
        StageMetrics::Deblend {
            labels_before: count_labels(&self.detection),
            labels_after: count_labels(&self.deblended),
        }
    }
}

impl PipelineStage for Pruned<'_> {
    const NAME: &'static str = "prune";
    const INDEX: usize = 4;

    fn metrics(&self) -> StageMetrics {
        StageMetrics::Prune {
            peak_count: self.peaks.len(),
            removed_label: self.removed,
            labels_after: count_labels(&self.pruned),
        }
    }
}

impl PipelineStage for Selected {
    const NAME: &'static str = "select";
    const INDEX: usize = 5;

    fn metrics(&self) -> StageMetrics {
        StageMetrics::Select {
            mode: self.config.mode.to_string(),
            mask_pixels: count_mask_pixels(&self.mask),
        }
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Entry point for the typestate pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline with the default capabilities.
    ///
    /// No processing is performed. Call
    /// [`.smooth()`](Pending::smooth) to begin.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<'a>(
        image: &'a Image,
        seg_image: Option<&'a LabelMap>,
        config: CleanConfig,
    ) -> Pending<'a> {
        Self::with_capabilities(image, seg_image, config, Capabilities::default())
    }

    /// Create a new pipeline running on caller-supplied capabilities.
    pub const fn with_capabilities<'a>(
        image: &'a Image,
        seg_image: Option<&'a LabelMap>,
        config: CleanConfig,
        caps: Capabilities<'a>,
    ) -> Pending<'a> {
        Pending {
            image,
            seg_image,
            config,
            caps,
        }
    }
}

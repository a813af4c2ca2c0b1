//! Shared types for the galmask cleaning pipeline.

use std::fmt;

use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

use crate::deblend::DeblendLevels;
use crate::geometry::DistanceMetric;
use crate::kernel::Kernel;
use crate::select::SelectionMode;

/// A calibrated single-channel intensity image.
///
/// `x` indexes columns and `y` indexes rows, following the `image`
/// crate convention.
pub type Image = ImageBuffer<Luma<f64>, Vec<f64>>;

/// Integer segmentation map. `0` is background; every other value
/// marks the pixels of one detected object.
pub type LabelMap = ImageBuffer<Luma<u32>, Vec<u32>>;

/// A `{0.0, 1.0}`-valued footprint with the same shape as its image.
pub type Mask = Image;

/// A real-valued position in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Vertical position (rows from the top edge).
    pub row: f64,
    /// Horizontal position (columns from the left edge).
    pub col: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(row: f64, col: f64) -> Self {
        Self { row, col }
    }
}

/// An integer pixel position, used for detected peaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelCoord {
    /// Row index.
    pub row: u32,
    /// Column index.
    pub col: u32,
}

impl PixelCoord {
    /// Create a new pixel coordinate.
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// The pixel position as a real-valued [`Point`].
    #[must_use]
    pub fn to_point(self) -> Point {
        Point::new(f64::from(self.row), f64::from(self.col))
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels (number of columns).
    pub width: u32,
    /// Height in pixels (number of rows).
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of any image buffer.
    #[must_use]
    pub fn of<P: image::Pixel>(image: &ImageBuffer<P, Vec<P::Subpixel>>) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// The reference centre `(H/2, W/2)` used for every distance query.
    #[must_use]
    pub fn center(self) -> Point {
        Point::new(f64::from(self.height) / 2.0, f64::from(self.width) / 2.0)
    }

    /// Total pixel count.
    #[must_use]
    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel connectivity used when grouping pixels into components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Horizontal and vertical neighbours only.
    #[default]
    Four,
    /// Horizontal, vertical and diagonal neighbours.
    Eight,
}

impl Connectivity {
    /// The `imageproc` equivalent of this connectivity.
    #[must_use]
    pub const fn to_imageproc(self) -> imageproc::region_labelling::Connectivity {
        match self {
            Self::Four => imageproc::region_labelling::Connectivity::Four,
            Self::Eight => imageproc::region_labelling::Connectivity::Eight,
        }
    }
}

impl TryFrom<u8> for Connectivity {
    type Error = GalmaskError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            other => Err(GalmaskError::InvalidConnectivity(other)),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(value: Connectivity) -> Self {
        match value {
            Connectivity::Four => 4,
            Connectivity::Eight => 8,
        }
    }
}

/// Configuration for the cleaning pipeline.
///
/// Missing fields take their default, so a parameter file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    /// Minimum number of connected pixels an object must have to be
    /// detected (and the minimum size of a deblended child).
    pub npixels: usize,

    /// Number of multi-thresholding levels used for deblending.
    pub nlevels: usize,

    /// Detection threshold in standard deviations above the background.
    pub nsigma: f64,

    /// Fraction of a source's total flux a child must carry to be
    /// deblended as a separate object. Must lie in `[0, 1]`.
    pub contrast: f64,

    /// Minimum separation, in pixels, between distinct local peaks.
    pub min_distance: u32,

    /// Maximum number of peaks in the whole image.
    pub num_peaks: usize,

    /// Maximum number of peaks per label of the segmentation map.
    pub num_peaks_per_label: usize,

    /// Connectivity used by the centroid tie-break selector: 4 or 8.
    pub connectivity: u8,

    /// Smoothing kernel. `None` uses [`Kernel::default_gaussian`].
    pub kernel: Option<Kernel>,

    /// Which central-object selection strategy to use.
    pub mode: SelectionMode,

    /// Whether to remove the label owning the peak farthest from the
    /// image centre.
    pub remove_local_max: bool,

    /// Whether to deblend overlapping sources.
    pub deblend: bool,

    /// How deblending threshold levels are spaced.
    pub deblend_levels: DeblendLevels,

    /// Distance metric used for every centre-distance query.
    pub distance_metric: DistanceMetric,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            npixels: 5,
            nlevels: 32,
            nsigma: 3.0,
            contrast: 0.001,
            min_distance: 3,
            num_peaks: 3,
            num_peaks_per_label: 2,
            connectivity: 4,
            kernel: None,
            mode: SelectionMode::default(),
            remove_local_max: true,
            deblend: true,
            deblend_levels: DeblendLevels::default(),
            distance_metric: DistanceMetric::default(),
        }
    }
}

impl CleanConfig {
    /// Parsed connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::InvalidConnectivity`] unless
    /// `connectivity` is 4 or 8.
    pub fn connectivity(&self) -> Result<Connectivity, GalmaskError> {
        Connectivity::try_from(self.connectivity)
    }

    /// Check every parameter against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`GalmaskError::InvalidConnectivity`] for a bad
    /// connectivity and [`GalmaskError::InvalidConfig`] for any other
    /// out-of-range parameter.
    pub fn validate(&self) -> Result<(), GalmaskError> {
        self.connectivity()?;
        if self.npixels == 0 {
            return Err(GalmaskError::InvalidConfig(
                "npixels must be at least 1".to_string(),
            ));
        }
        if self.nlevels == 0 {
            return Err(GalmaskError::InvalidConfig(
                "nlevels must be at least 1".to_string(),
            ));
        }
        if !self.nsigma.is_finite() {
            return Err(GalmaskError::InvalidConfig(format!(
                "nsigma must be finite, got {}",
                self.nsigma
            )));
        }
        if !(0.0..=1.0).contains(&self.contrast) {
            return Err(GalmaskError::InvalidConfig(format!(
                "contrast must be within [0, 1], got {}",
                self.contrast
            )));
        }
        if self.min_distance == 0 {
            return Err(GalmaskError::InvalidConfig(
                "min_distance must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Non-fatal conditions noticed while cleaning an image.
///
/// Each warning is logged through [`log::warn!`] when it is raised and
/// also returned to the caller so batch drivers can record it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CleanWarning {
    /// The smoothing kernel does not sum to 1. It is still used.
    KernelNotNormalized {
        /// Sum of the kernel weights.
        sum: f64,
    },
    /// Peak pruning found no local maxima, so no label was removed.
    NoPeaksFound,
}

impl fmt::Display for CleanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelNotNormalized { sum } => {
                write!(f, "kernel is not normalized (sum = {sum})")
            }
            Self::NoPeaksFound => write!(f, "no local peaks found; no label was pruned"),
        }
    }
}

/// Result of cleaning one image.
#[derive(Debug, Clone)]
pub struct CleanResult {
    /// `mask ⊙ image`: the input with every non-central pixel zeroed.
    pub masked: Image,
    /// Footprint of the central object, `{0.0, 1.0}`-valued.
    pub mask: Mask,
    /// Non-fatal conditions raised along the way.
    pub warnings: Vec<CleanWarning>,
}

/// Result of running the pipeline with every intermediate preserved.
///
/// Each field captures the output of one stage so callers can inspect
/// why a particular label was kept or removed.
#[derive(Debug, Clone)]
pub struct StagedResult {
    /// Scalar background level subtracted from the image.
    pub background: f64,
    /// Background-subtracted, kernel-smoothed image.
    pub smoothed: Image,
    /// Detection map (or the caller-supplied segmentation map).
    pub detection: LabelMap,
    /// Map after deblending (equal to `detection` when disabled).
    pub deblended: LabelMap,
    /// Peaks found by the prune stage (empty when disabled).
    pub peaks: Vec<PixelCoord>,
    /// Label removed by the prune stage, if any.
    pub pruned_label: Option<u32>,
    /// Map after pruning.
    pub pruned: LabelMap,
    /// Footprint of the selected central object.
    pub mask: Mask,
    /// `mask ⊙ image`.
    pub masked: Image,
    /// Non-fatal conditions raised along the way.
    pub warnings: Vec<CleanWarning>,
}

impl StagedResult {
    /// Drop the intermediates and keep only the final outputs.
    #[must_use]
    pub fn into_clean_result(self) -> CleanResult {
        CleanResult {
            masked: self.masked,
            mask: self.mask,
            warnings: self.warnings,
        }
    }
}

/// Errors that abort cleaning an image.
///
/// Every variant is fatal: no usable mask was produced.
#[derive(Debug, thiserror::Error)]
pub enum GalmaskError {
    /// The kernel weights sum to (nearly) zero, so it cannot be normalised.
    #[error("kernel sum is close to zero ({sum}); cannot use it for convolution")]
    DegenerateKernel {
        /// Sum of the kernel weights.
        sum: f64,
    },

    /// Detection found no source and no segmentation map was supplied.
    #[error("no source detection found in the image")]
    NoDetection,

    /// An image or coordinate set had no elements.
    #[error("input is empty")]
    EmptyInput,

    /// A component query ran on a map with no foreground pixels.
    #[error("there must be at least one connected component in the segmentation map")]
    NoComponent,

    /// Connectivity was neither 4 nor 8.
    #[error("connectivity must be 4 or 8, got {0}")]
    InvalidConnectivity(u8),

    /// A segmentation map does not match the image shape.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Shape of the image.
        expected: Dimensions,
        /// Shape of the offending map.
        actual: Dimensions,
    },

    /// A configuration parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Build an [`Image`] from row-major rows.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] when there are no rows or the
/// rows are empty, and [`GalmaskError::InvalidConfig`] when rows differ
/// in length.
pub fn image_from_rows(rows: &[Vec<f64>]) -> Result<Image, GalmaskError> {
    let (width, height, data) = flatten_rows(rows)?;
    Image::from_raw(width, height, data).ok_or(GalmaskError::EmptyInput)
}

/// Build a [`LabelMap`] from row-major rows.
///
/// # Errors
///
/// Same conditions as [`image_from_rows`].
pub fn label_map_from_rows(rows: &[Vec<u32>]) -> Result<LabelMap, GalmaskError> {
    let (width, height, data) = flatten_rows(rows)?;
    LabelMap::from_raw(width, height, data).ok_or(GalmaskError::EmptyInput)
}

fn flatten_rows<T: Copy>(rows: &[Vec<T>]) -> Result<(u32, u32, Vec<T>), GalmaskError> {
    let width = rows.first().map_or(0, Vec::len);
    if width == 0 {
        return Err(GalmaskError::EmptyInput);
    }
    if let Some(bad) = rows.iter().position(|r| r.len() != width) {
        return Err(GalmaskError::InvalidConfig(format!(
            "row {bad} has {} columns, expected {width}",
            rows[bad].len()
        )));
    }
    let w = u32::try_from(width)
        .map_err(|_| GalmaskError::InvalidConfig(format!("width {width} is too large")))?;
    let h = u32::try_from(rows.len())
        .map_err(|_| GalmaskError::InvalidConfig(format!("height {} is too large", rows.len())))?;
    Ok((w, h, rows.concat()))
}

/// Check that a label map has the same shape as its image.
///
/// # Errors
///
/// Returns [`GalmaskError::ShapeMismatch`] when the shapes differ.
pub fn ensure_same_shape(image: &Image, map: &LabelMap) -> Result<(), GalmaskError> {
    let expected = Dimensions::of(image);
    let actual = Dimensions::of(map);
    if expected == actual {
        Ok(())
    } else {
        Err(GalmaskError::ShapeMismatch { expected, actual })
    }
}

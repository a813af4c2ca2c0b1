//! Central-object selection.
//!
//! Three strategies turn the stage outputs into the final `{0, 1}` mask.
//! They are plain functions over a shared [`SelectionInput`] and
//! [`select_central`] dispatches on [`SelectionMode`].

use std::fmt;
use std::str::FromStr;

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::components::{ComponentLabeler, label_with, largest_component_with};
use crate::geometry::{DistanceMetric, closest};
use crate::types::{Connectivity, GalmaskError, Image, LabelMap, Mask, Point};

/// Strategy used to pick the central object.
///
/// Serialized as the strings `"0"`, `"1"` and `"2"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionMode {
    /// Largest equal-value region of the detection map, before
    /// deblending and pruning. Suited to fields with many small
    /// contaminants around the galaxy.
    #[serde(rename = "0")]
    LargestRaw,

    /// Connected component of the pruned map whose centroid is closest
    /// to the image centre.
    #[default]
    #[serde(rename = "1")]
    CentroidTieBreak,

    /// Largest equal-value region of the pruned map.
    #[serde(rename = "2")]
    LargestPruned,
}

impl SelectionMode {
    /// Every mode, in order of its string code.
    pub const ALL: [Self; 3] = [Self::LargestRaw, Self::CentroidTieBreak, Self::LargestPruned];

    /// The string code of this mode.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::LargestRaw => "0",
            Self::CentroidTieBreak => "1",
            Self::LargestPruned => "2",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for SelectionMode {
    type Err = GalmaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.code() == s)
            .ok_or_else(|| GalmaskError::InvalidConfig(format!("unknown selection mode {s:?}")))
    }
}

/// Everything a selection strategy may look at.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    /// Detection map before deblending and pruning.
    pub detection: &'a LabelMap,
    /// Map after deblending and pruning.
    pub pruned: &'a LabelMap,
    /// Connectivity for the centroid strategy.
    pub connectivity: Connectivity,
    /// Image centre, `(H / 2, W / 2)`.
    pub center: Point,
    /// Metric for the centroid distance.
    pub metric: DistanceMetric,
}

/// Pick the central object's footprint.
///
/// # Errors
///
/// Returns [`GalmaskError::NoComponent`] if the map the strategy
/// inspects has no foreground.
pub fn select_central(
    mode: SelectionMode,
    input: &SelectionInput<'_>,
    labeler: &dyn ComponentLabeler,
) -> Result<Mask, GalmaskError> {
    match mode {
        SelectionMode::LargestRaw => largest_raw(input, labeler),
        SelectionMode::CentroidTieBreak => centroid_tie_break(input, labeler),
        SelectionMode::LargestPruned => largest_pruned(input, labeler),
    }
}

/// Largest region of the detection map.
///
/// # Errors
///
/// Returns [`GalmaskError::NoComponent`] for an empty detection map.
pub fn largest_raw(
    input: &SelectionInput<'_>,
    labeler: &dyn ComponentLabeler,
) -> Result<Mask, GalmaskError> {
    largest_component_with(labeler, input.detection)
}

/// Largest region of the pruned map.
///
/// # Errors
///
/// Returns [`GalmaskError::NoComponent`] for an empty pruned map.
pub fn largest_pruned(
    input: &SelectionInput<'_>,
    labeler: &dyn ComponentLabeler,
) -> Result<Mask, GalmaskError> {
    largest_component_with(labeler, input.pruned)
}

/// Component of the pruned map closest to the centre.
///
/// Every non-zero pixel is foreground, so touching labels merge into one
/// component. When the largest component is also the closest it is
/// kept; otherwise the closest one wins over the larger one.
///
/// # Errors
///
/// Returns [`GalmaskError::NoComponent`] if the pruned map is empty.
pub fn centroid_tie_break(
    input: &SelectionInput<'_>,
    labeler: &dyn ComponentLabeler,
) -> Result<Mask, GalmaskError> {
    let components = label_with(labeler, input.pruned, input.connectivity);
    let largest = components.largest_label().ok_or(GalmaskError::NoComponent)?;
    let nearest = closest(&components.centroids, input.center, input.metric)
        .map_err(|_| GalmaskError::NoComponent)?;
    let nearest = u32::try_from(nearest)
        .map_err(|_| GalmaskError::InvalidConfig(format!("label {nearest} out of range")))?;
    let chosen = if nearest == largest {
        largest
    } else {
        log::debug!("component {nearest} is nearer the centre than the largest ({largest})");
        nearest
    };
    Ok(components.mask_of(chosen))
}

/// Pixel-wise product `mask ⊙ image`.
#[must_use]
pub fn apply_mask(image: &Image, mask: &Mask) -> Image {
    Image::from_fn(image.width(), image.height(), |x, y| {
        Luma([mask.get_pixel(x, y).0[0] * image.get_pixel(x, y).0[0]])
    })
}

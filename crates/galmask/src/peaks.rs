//! Local-maximum detection and farthest-peak pruning.
//!
//! Bright compact sources near the frame edge often survive detection
//! and deblending as their own labels. The prune stage finds local
//! maxima of the smoothed image within each label, takes the one
//! farthest from the image centre, and removes the label that owns it.
//! Exactly one label is removed per call.

use std::collections::BTreeMap;

use crate::geometry::{DistanceMetric, farthest};
use crate::types::{GalmaskError, Image, LabelMap, PixelCoord, Point};

/// Peak-finding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakParams {
    /// Minimum Chebyshev separation between peaks, and the width of the
    /// excluded image border.
    pub min_distance: u32,
    /// Maximum number of peaks over the whole image.
    pub num_peaks: usize,
    /// Maximum number of peaks within one label.
    pub num_peaks_per_label: usize,
}

/// Capability: locate local intensity maxima constrained to labels.
pub trait PeakFinder {
    /// Find peaks of `image` inside the non-zero labels of `labels`.
    fn find_peaks(&self, image: &Image, labels: &LabelMap, params: &PeakParams)
    -> Vec<PixelCoord>;
}

/// Default peak finder: windowed maximum test per label.
///
/// A pixel is a candidate when it equals the maximum of its label's
/// pixels inside a `(2 * min_distance + 1)` square window, is strictly
/// above the image minimum, and lies at least `min_distance` from the
/// border. Candidates are taken brightest first (raster order on ties)
/// and any candidate within `min_distance` of an accepted peak is
/// skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMaxPeakFinder;

impl PeakFinder for LocalMaxPeakFinder {
    fn find_peaks(
        &self,
        image: &Image,
        labels: &LabelMap,
        params: &PeakParams,
    ) -> Vec<PixelCoord> {
        let floor = image
            .pixels()
            .map(|p| p.0[0])
            .filter(|v| v.is_finite())
            .fold(f64::INFINITY, f64::min);

        let mut by_label: BTreeMap<u32, Vec<(u32, u32)>> = BTreeMap::new();
        for (x, y, px) in labels.enumerate_pixels() {
            if px.0[0] != 0 {
                by_label.entry(px.0[0]).or_default().push((x, y));
            }
        }

        let mut peaks: Vec<(PixelCoord, f64)> = Vec::new();
        for (&label, pixels) in &by_label {
            let mut candidates: Vec<(PixelCoord, f64)> = pixels
                .iter()
                .filter(|&&(x, y)| outside_border(image, x, y, params.min_distance))
                .filter_map(|&(x, y)| {
                    let v = image.get_pixel(x, y).0[0];
                    (v.is_finite()
                        && v > floor
                        && is_window_max(image, labels, label, x, y, params.min_distance))
                    .then_some((PixelCoord::new(y, x), v))
                })
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
            let kept = enforce_spacing(candidates, params.min_distance);
            peaks.extend(kept.into_iter().take(params.num_peaks_per_label));
        }

        if peaks.len() > params.num_peaks {
            peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
            peaks.truncate(params.num_peaks);
        }
        peaks.into_iter().map(|(p, _)| p).collect()
    }
}

fn outside_border(image: &Image, x: u32, y: u32, border: u32) -> bool {
    x >= border
        && y >= border
        && x + border < image.width()
        && y + border < image.height()
}

fn is_window_max(image: &Image, labels: &LabelMap, label: u32, x: u32, y: u32, r: u32) -> bool {
    let v = image.get_pixel(x, y).0[0];
    let (x0, y0) = (x.saturating_sub(r), y.saturating_sub(r));
    let x1 = (x + r).min(image.width() - 1);
    let y1 = (y + r).min(image.height() - 1);
    for ny in y0..=y1 {
        for nx in x0..=x1 {
            if labels.get_pixel(nx, ny).0[0] == label && image.get_pixel(nx, ny).0[0] > v {
                return false;
            }
        }
    }
    true
}

/// Greedily keep candidates (already sorted brightest first) that are
/// more than `min_distance` away from every kept peak.
fn enforce_spacing(candidates: Vec<(PixelCoord, f64)>, min_distance: u32) -> Vec<(PixelCoord, f64)> {
    let mut kept: Vec<(PixelCoord, f64)> = Vec::new();
    for (p, v) in candidates {
        let clear = kept.iter().all(|(q, _)| {
            let dr = p.row.abs_diff(q.row);
            let dc = p.col.abs_diff(q.col);
            dr.max(dc) > min_distance
        });
        if clear {
            kept.push((p, v));
        }
    }
    kept
}

/// Remove the label owning the peak farthest from `center`.
///
/// Returns the pruned map and the removed label. A peak sitting on
/// background removes nothing and yields `None`.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] if `peaks` is empty.
pub fn prune_farthest_peak(
    mut labels: LabelMap,
    peaks: &[PixelCoord],
    center: Point,
    metric: DistanceMetric,
) -> Result<(LabelMap, Option<u32>), GalmaskError> {
    let points: Vec<Point> = peaks.iter().map(|p| p.to_point()).collect();
    let index = farthest(&points, center, metric)?;
    let peak = peaks[index];
    let victim = labels.get_pixel(peak.col, peak.row).0[0];
    if victim == 0 {
        return Ok((labels, None));
    }
    for px in labels.pixels_mut() {
        if px.0[0] == victim {
            px.0[0] = 0;
        }
    }
    log::debug!(
        "pruned label {victim} (peak at row {}, col {})",
        peak.row,
        peak.col
    );
    Ok((labels, Some(victim)))
}

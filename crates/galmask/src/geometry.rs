//! Distance-based nearest/farthest queries over coordinate sets.
//!
//! Both queries scan the coordinates in order and keep the first
//! extreme they meet, so ties always resolve to the earliest entry.
//! [`closest`] returns a **1-based** index: callers compare it directly
//! against component labels, where label 0 is reserved for background
//! and the coordinate list starts at label 1.

use serde::{Deserialize, Serialize};

use crate::types::{GalmaskError, Point};

/// Distance metric for centre-distance queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Sum of absolute row and column offsets.
    #[default]
    Manhattan,
    /// Straight-line distance.
    Euclidean,
}

impl DistanceMetric {
    /// Distance between two points under this metric.
    #[must_use]
    pub fn distance(self, a: Point, b: Point) -> f64 {
        let dr = a.row - b.row;
        let dc = a.col - b.col;
        match self {
            Self::Manhattan => dr.abs() + dc.abs(),
            Self::Euclidean => dr.hypot(dc),
        }
    }
}

/// Index of the coordinate farthest from `reference`.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] if `coords` is empty.
///
/// # Examples
///
/// ```
/// use galmask::geometry::{farthest, DistanceMetric};
/// use galmask::Point;
///
/// let coords = [Point::new(50.0, 50.0), Point::new(10.0, 10.0)];
/// let idx = farthest(&coords, Point::new(100.0, 100.0), DistanceMetric::Manhattan).unwrap();
/// assert_eq!(idx, 1);
/// ```
pub fn farthest(
    coords: &[Point],
    reference: Point,
    metric: DistanceMetric,
) -> Result<usize, GalmaskError> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &p) in coords.iter().enumerate() {
        let dist = metric.distance(p, reference);
        if best.is_none_or(|(_, d)| dist > d) {
            best = Some((i, dist));
        }
    }
    best.map(|(i, _)| i).ok_or(GalmaskError::EmptyInput)
}

/// 1-based index of the coordinate closest to `reference`.
///
/// # Errors
///
/// Returns [`GalmaskError::EmptyInput`] if `coords` is empty.
pub fn closest(
    coords: &[Point],
    reference: Point,
    metric: DistanceMetric,
) -> Result<usize, GalmaskError> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &p) in coords.iter().enumerate() {
        let dist = metric.distance(p, reference);
        if best.is_none_or(|(_, d)| dist < d) {
            best = Some((i, dist));
        }
    }
    best.map(|(i, _)| i + 1).ok_or(GalmaskError::EmptyInput)
}

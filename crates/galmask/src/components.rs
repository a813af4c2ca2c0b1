//! Connected-component labelling and per-label region statistics.
//!
//! This module defines the [`ComponentLabeler`] capability trait, the
//! default [`ImageprocLabeler`] built on
//! [`imageproc::region_labelling::connected_components`], and the two
//! queries the selector needs:
//!
//! - [`label`] treats every non-zero pixel as foreground and groups
//!   foreground pixels regardless of their label value.
//! - [`largest_component`] groups pixels of *equal* label value, so two
//!   touching labels stay separate components.

use std::collections::HashMap;

use image::Luma;

use crate::types::{Connectivity, GalmaskError, LabelMap, Mask, Point};

/// Capability: group connected pixels of equal non-zero value.
///
/// `0` is background. Any non-zero values may be used for regions;
/// [`Components::from_labels`] renumbers them `1..=n` in raster order.
pub trait ComponentLabeler {
    /// Label the connected regions of `map`.
    fn label_regions(&self, map: &LabelMap, connectivity: Connectivity) -> LabelMap;
}

/// Default labeler backed by `imageproc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageprocLabeler;

impl ComponentLabeler for ImageprocLabeler {
    fn label_regions(&self, map: &LabelMap, connectivity: Connectivity) -> LabelMap {
        let raw = imageproc::region_labelling::connected_components(
            map,
            connectivity.to_imageproc(),
            Luma([0u32]),
        );
        renumber_in_raster_order(&raw)
    }
}

/// Relabel so labels appear as `1, 2, 3, ...` in raster scan order.
pub(crate) fn renumber_in_raster_order(labels: &LabelMap) -> LabelMap {
    let mut mapping: HashMap<u32, u32> = HashMap::new();
    let mut next = 1u32;
    let mut out = LabelMap::new(labels.width(), labels.height());
    for (x, y, px) in labels.enumerate_pixels() {
        let old = px.0[0];
        if old == 0 {
            continue;
        }
        let new = *mapping.entry(old).or_insert_with(|| {
            let assigned = next;
            next += 1;
            assigned
        });
        out.put_pixel(x, y, Luma([new]));
    }
    out
}

/// Connected components with per-label statistics.
///
/// `areas[i]` and `centroids[i]` describe label `i + 1`.
#[derive(Debug, Clone)]
pub struct Components {
    /// Relabelled map, `1..=count` on foreground and `0` elsewhere.
    pub labels: LabelMap,
    /// Pixel count of each label.
    pub areas: Vec<u64>,
    /// Mean `(row, col)` of each label.
    pub centroids: Vec<Point>,
}

impl Components {
    /// Compute statistics for a labelled map.
    ///
    /// Labels are first renumbered `1..=n` in raster order, so the
    /// statistics are sized by the labels present, not by their values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_labels(labels: LabelMap) -> Self {
        let labels = renumber_in_raster_order(&labels);
        let count = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0) as usize;
        let mut areas = vec![0u64; count];
        let mut row_sums = vec![0.0f64; count];
        let mut col_sums = vec![0.0f64; count];
        for (x, y, px) in labels.enumerate_pixels() {
            let label = px.0[0] as usize;
            if label == 0 {
                continue;
            }
            areas[label - 1] += 1;
            row_sums[label - 1] += f64::from(y);
            col_sums[label - 1] += f64::from(x);
        }
        let centroids = areas
            .iter()
            .zip(row_sums.iter().zip(&col_sums))
            .map(|(&area, (&r, &c))| {
                if area == 0 {
                    Point::new(f64::NAN, f64::NAN)
                } else {
                    Point::new(r / area as f64, c / area as f64)
                }
            })
            .collect();
        Self {
            labels,
            areas,
            centroids,
        }
    }

    /// Number of labels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.areas.len()
    }

    /// Label with the greatest area. The lowest label wins ties.
    #[must_use]
    pub fn largest_label(&self) -> Option<u32> {
        let mut best: Option<(usize, u64)> = None;
        for (i, &area) in self.areas.iter().enumerate() {
            if best.is_none_or(|(_, a)| area > a) {
                best = Some((i, area));
            }
        }
        best.and_then(|(i, _)| u32::try_from(i + 1).ok())
    }

    /// `{0, 1}` footprint of one label.
    #[must_use]
    pub fn mask_of(&self, label: u32) -> Mask {
        footprint(&self.labels, label)
    }
}

/// `{0, 1}` footprint of `label` within `labels`.
#[must_use]
pub fn footprint(labels: &LabelMap, label: u32) -> Mask {
    Mask::from_fn(labels.width(), labels.height(), |x, y| {
        if labels.get_pixel(x, y).0[0] == label {
            Luma([1.0])
        } else {
            Luma([0.0])
        }
    })
}

/// Label the foreground of `map` (any non-zero value) and compute
/// per-label area and centroid.
#[must_use]
pub fn label(map: &LabelMap, connectivity: Connectivity) -> Components {
    label_with(&ImageprocLabeler, map, connectivity)
}

/// [`label`] with a caller-supplied labeler.
#[must_use]
pub fn label_with(
    labeler: &dyn ComponentLabeler,
    map: &LabelMap,
    connectivity: Connectivity,
) -> Components {
    let binary = LabelMap::from_fn(map.width(), map.height(), |x, y| {
        Luma([u32::from(map.get_pixel(x, y).0[0] != 0)])
    });
    Components::from_labels(labeler.label_regions(&binary, connectivity))
}

/// Footprint of the largest 8-connected region of equal label value.
///
/// # Errors
///
/// Returns [`GalmaskError::NoComponent`] if `map` is entirely
/// background.
pub fn largest_component(map: &LabelMap) -> Result<Mask, GalmaskError> {
    largest_component_with(&ImageprocLabeler, map)
}

/// [`largest_component`] with a caller-supplied labeler.
///
/// # Errors
///
/// Returns [`GalmaskError::NoComponent`] if `map` is entirely
/// background.
pub fn largest_component_with(
    labeler: &dyn ComponentLabeler,
    map: &LabelMap,
) -> Result<Mask, GalmaskError> {
    let components = Components::from_labels(labeler.label_regions(map, Connectivity::Eight));
    let largest = components
        .largest_label()
        .ok_or(GalmaskError::NoComponent)?;
    Ok(components.mask_of(largest))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fill(map: &mut LabelMap, rows: std::ops::Range<u32>, cols: std::ops::Range<u32>, v: u32) {
        for y in rows {
            for x in cols.clone() {
                map.put_pixel(x, y, Luma([v]));
            }
        }
    }

    fn mask_sum(mask: &Mask) -> f64 {
        mask.pixels().map(|p| p.0[0]).sum()
    }

    #[test]
    fn largest_component_picks_bigger_blob() {
        let mut map = LabelMap::new(10, 10);
        fill(&mut map, 0..1, 0..3, 1); // 3 pixels
        fill(&mut map, 5..7, 3..8, 1); // 10 pixels
        let mask = largest_component(&map).unwrap();
        assert!((mask_sum(&mask) - 10.0).abs() < f64::EPSILON);
        assert!((mask.get_pixel(3, 5).0[0] - 1.0).abs() < f64::EPSILON);
        assert!(mask.get_pixel(0, 0).0[0].abs() < f64::EPSILON);
    }

    #[test]
    fn largest_component_on_background_fails() {
        let map = LabelMap::new(8, 8);
        assert!(matches!(
            largest_component(&map),
            Err(GalmaskError::NoComponent)
        ));
    }

    #[test]
    fn largest_component_keeps_touching_labels_apart() {
        // Two labels share an edge; equal-value grouping keeps them separate.
        let mut map = LabelMap::new(10, 4);
        fill(&mut map, 0..4, 0..4, 1); // 16 pixels
        fill(&mut map, 0..4, 4..10, 2); // 24 pixels
        let mask = largest_component(&map).unwrap();
        assert!((mask_sum(&mask) - 24.0).abs() < f64::EPSILON);
        assert!(mask.get_pixel(0, 0).0[0].abs() < f64::EPSILON);
    }

    #[test]
    fn largest_component_tie_goes_to_first_in_raster_order() {
        let mut map = LabelMap::new(10, 10);
        fill(&mut map, 0..2, 0..2, 5);
        fill(&mut map, 6..8, 6..8, 3);
        let mask = largest_component(&map).unwrap();
        assert!((mask.get_pixel(0, 0).0[0] - 1.0).abs() < f64::EPSILON);
        assert!(mask.get_pixel(6, 6).0[0].abs() < f64::EPSILON);
    }

    #[test]
    fn label_merges_touching_labels() {
        let mut map = LabelMap::new(10, 4);
        fill(&mut map, 0..4, 0..4, 1);
        fill(&mut map, 0..4, 4..10, 2);
        let comps = label(&map, Connectivity::Four);
        assert_eq!(comps.count(), 1);
        assert_eq!(comps.areas, vec![40]);
    }

    #[test]
    fn diagonal_neighbours_depend_on_connectivity() {
        let mut map = LabelMap::new(4, 4);
        map.put_pixel(0, 0, Luma([1]));
        map.put_pixel(1, 1, Luma([1]));
        assert_eq!(label(&map, Connectivity::Four).count(), 2);
        assert_eq!(label(&map, Connectivity::Eight).count(), 1);
    }

    #[test]
    fn label_reports_area_and_centroid() {
        let mut map = LabelMap::new(50, 50);
        fill(&mut map, 23..27, 23..27, 1);
        fill(&mut map, 35..48, 35..48, 2);
        let comps = label(&map, Connectivity::Four);
        assert_eq!(comps.count(), 2);
        assert_eq!(comps.areas, vec![16, 169]);
        assert_eq!(comps.centroids[0], Point::new(24.5, 24.5));
        assert_eq!(comps.centroids[1], Point::new(41.0, 41.0));
        assert_eq!(comps.largest_label(), Some(2));
    }

    #[test]
    fn labels_are_numbered_in_raster_order() {
        let mut map = LabelMap::new(6, 6);
        fill(&mut map, 4..6, 0..2, 9);
        fill(&mut map, 0..1, 4..6, 9);
        let comps = label(&map, Connectivity::Eight);
        assert_eq!(comps.labels.get_pixel(4, 0).0[0], 1);
        assert_eq!(comps.labels.get_pixel(0, 4).0[0], 2);
    }

    #[test]
    fn sparse_label_values_are_compacted() {
        let mut map = LabelMap::new(4, 3);
        map.put_pixel(3, 0, Luma([u32::MAX]));
        map.put_pixel(0, 2, Luma([7]));
        map.put_pixel(1, 2, Luma([7]));
        let components = Components::from_labels(map);
        assert_eq!(components.count(), 2);
        assert_eq!(components.areas, vec![1, 2]);
        assert_eq!(components.labels.get_pixel(3, 0).0[0], 1);
        assert_eq!(components.labels.get_pixel(1, 2).0[0], 2);
        assert_eq!(components.largest_label(), Some(2));
    }

    #[test]
    fn empty_map_has_no_components() {
        let comps = label(&LabelMap::new(3, 3), Connectivity::Eight);
        assert_eq!(comps.count(), 0);
        assert_eq!(comps.largest_label(), None);
    }
}

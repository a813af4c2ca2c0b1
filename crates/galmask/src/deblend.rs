//! Deblending: split merged detections into separate labels.
//!
//! Each label is handled on its own. Its pixels are thresholded at
//! `nlevels` levels between its faintest and brightest value, and the
//! connected groups at each level form a tree. Walking up the tree, a
//! marker that holds two or more groups at the next level is replaced
//! by those groups. Markers carrying less than `contrast` of the
//! source's flux are dropped; if two or more survive, they seed a
//! brightest-first flood over the source footprint.
//!
//! The first child (in raster order) keeps the parent label. Further
//! children get fresh labels above the largest label in the map, then
//! unused values below it once `u32::MAX` is reached, so deblending
//! only ever subdivides existing labels.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::components::{ComponentLabeler, ImageprocLabeler};
use crate::detect::remove_small_labels;
use crate::types::{Connectivity, Image, LabelMap};

/// Spacing of the deblending threshold levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeblendLevels {
    /// Geometric spacing between the source minimum and maximum.
    /// Falls back to [`Linear`](Self::Linear) when the minimum is not
    /// positive.
    #[default]
    Exponential,
    /// Even spacing between the source minimum and maximum.
    Linear,
}

impl DeblendLevels {
    /// `nlevels` thresholds strictly between `min` and `max`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn thresholds(self, min: f64, max: f64, nlevels: usize) -> Vec<f64> {
        let steps = (nlevels + 1) as f64;
        let exponential = matches!(self, Self::Exponential) && min > 0.0;
        (1..=nlevels)
            .map(|i| {
                let frac = i as f64 / steps;
                if exponential {
                    min * (max / min).powf(frac)
                } else {
                    (max - min).mul_add(frac, min)
                }
            })
            .collect()
    }
}

/// Deblending parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeblendParams {
    /// Minimum pixel count of a deblended child.
    pub npixels: usize,
    /// Number of threshold levels.
    pub nlevels: usize,
    /// Minimum flux fraction of a child.
    pub contrast: f64,
    /// Level spacing.
    pub levels: DeblendLevels,
}

/// Capability: subdivide the labels of a map.
pub trait Deblender {
    /// Deblend `labels` using the intensities of `smoothed`.
    ///
    /// The output keeps every background pixel at 0 and only splits
    /// existing labels.
    fn deblend(&self, smoothed: &Image, labels: LabelMap, params: &DeblendParams) -> LabelMap;
}

/// Default deblender: multi-threshold tree plus marker flood.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiThresholdDeblender;

impl Deblender for MultiThresholdDeblender {
    fn deblend(&self, smoothed: &Image, labels: LabelMap, params: &DeblendParams) -> LabelMap {
        let width = labels.width() as usize;
        let data = smoothed.as_raw();

        let mut sources: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, px) in labels.pixels().enumerate() {
            if px.0[0] != 0 {
                sources.entry(px.0[0]).or_default().push(i);
            }
        }
        let mut fresh = FreshLabels::new(&sources);

        let mut out = labels;
        let mut split = 0usize;
        let mut added = 0usize;
        for (label, pixels) in &sources {
            let children = split_source(data, width, pixels, params);
            if children.len() < 2 {
                continue;
            }
            split += 1;
            log::debug!("label {label} deblended into {} children", children.len());
            for child in children.iter().skip(1) {
                let Some(new_label) = fresh.allocate() else {
                    log::warn!("no free label left; child of label {label} keeps its parent");
                    continue;
                };
                for &i in child {
                    let (x, y) = (i % width, i / width);
                    #[allow(clippy::cast_possible_truncation)]
                    out.put_pixel(x as u32, y as u32, Luma([new_label]));
                }
                added += 1;
            }
        }
        log::debug!(
            "deblended {split} of {} labels, {} labels total",
            sources.len(),
            sources.len() + added
        );
        out
    }
}

/// Hands out labels absent from the input map.
///
/// Values above the largest input label come first; after `u32::MAX`
/// the unused values between 1 and that label are handed out.
struct FreshLabels<'a> {
    used: &'a BTreeMap<u32, Vec<usize>>,
    ceiling: u32,
    above: Option<u32>,
    gap: Option<u32>,
}

impl<'a> FreshLabels<'a> {
    fn new(used: &'a BTreeMap<u32, Vec<usize>>) -> Self {
        let ceiling = used.keys().next_back().copied().unwrap_or(0);
        Self {
            used,
            ceiling,
            above: ceiling.checked_add(1),
            gap: Some(1),
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if let Some(label) = self.above {
            self.above = label.checked_add(1);
            return Some(label);
        }
        while let Some(label) = self.gap.filter(|&l| l < self.ceiling) {
            self.gap = label.checked_add(1);
            if !self.used.contains_key(&label) {
                return Some(label);
            }
        }
        None
    }
}

/// Local bounding box of one source, with its footprint.
struct Footprint {
    x0: usize,
    y0: usize,
    width: usize,
    height: usize,
    inside: Vec<bool>,
    values: Vec<f64>,
}

impl Footprint {
    fn new(data: &[f64], image_width: usize, pixels: &[usize]) -> Self {
        let (mut x0, mut y0, mut x1, mut y1) = (usize::MAX, usize::MAX, 0, 0);
        for &i in pixels {
            let (x, y) = (i % image_width, i / image_width);
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let (width, height) = (x1 - x0 + 1, y1 - y0 + 1);
        let mut inside = vec![false; width * height];
        let mut values = vec![f64::NEG_INFINITY; width * height];
        for &i in pixels {
            let local = (i / image_width - y0) * width + (i % image_width - x0);
            inside[local] = true;
            if data[i].is_finite() {
                values[local] = data[i];
            }
        }
        Self {
            x0,
            y0,
            width,
            height,
            inside,
            values,
        }
    }

    const fn to_global(&self, local: usize, image_width: usize) -> usize {
        (self.y0 + local / self.width) * image_width + self.x0 + local % self.width
    }

    /// 8-connected groups above `threshold`, at least `npixels` large.
    #[allow(clippy::cast_possible_truncation)]
    fn segments_above(&self, threshold: f64, npixels: usize) -> LabelMap {
        let binary = LabelMap::from_fn(self.width as u32, self.height as u32, |x, y| {
            let i = y as usize * self.width + x as usize;
            Luma([u32::from(self.inside[i] && self.values[i] > threshold)])
        });
        remove_small_labels(
            ImageprocLabeler.label_regions(&binary, Connectivity::Eight),
            npixels,
        )
    }

    fn neighbours(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        let (x, y) = ((i % self.width).cast_signed(), (i / self.width).cast_signed());
        let (w, h) = (self.width.cast_signed(), self.height.cast_signed());
        [
            (-1, -1),
            (0, -1),
            (1, -1),
            (-1, 0),
            (1, 0),
            (-1, 1),
            (0, 1),
            (1, 1),
        ]
        .into_iter()
        .filter_map(move |(dx, dy)| {
            let (nx, ny) = (x + dx, y + dy);
            (nx >= 0 && ny >= 0 && nx < w && ny < h).then(|| (ny * w + nx).cast_unsigned())
        })
        .filter(move |&n| self.inside[n])
    }
}

/// Partition one source into children. Fewer than two entries means
/// the source stays whole.
fn split_source(
    data: &[f64],
    image_width: usize,
    pixels: &[usize],
    params: &DeblendParams,
) -> Vec<Vec<usize>> {
    if pixels.len() < params.npixels.max(2) {
        return Vec::new();
    }
    let fp = Footprint::new(data, image_width, pixels);
    let finite = fp.values.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if max <= min {
        return Vec::new();
    }

    let mut markers: Option<LabelMap> = None;
    for threshold in params.levels.thresholds(min, max, params.nlevels) {
        let segments = fp.segments_above(threshold, params.npixels);
        markers = Some(match markers {
            None => segments,
            Some(current) => refine_markers(&current, &segments),
        });
    }
    let Some(markers) = markers else {
        return Vec::new();
    };

    let marker_sets = apply_contrast(&fp, &markers, params.contrast);
    if marker_sets.len() < 2 {
        return Vec::new();
    }

    let assignment = flood_from_markers(&fp, &marker_sets);
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); marker_sets.len()];
    for (local, owner) in assignment.into_iter().enumerate() {
        if let Some(owner) = owner {
            children[owner].push(fp.to_global(local, image_width));
        }
    }
    children.retain(|c| !c.is_empty());
    children.sort_by_key(|c| c.iter().copied().min());
    children
}

/// Replace every marker that contains two or more `segments` by those
/// segments; keep the others unchanged.
fn refine_markers(markers: &LabelMap, segments: &LabelMap) -> LabelMap {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (m, s) in markers.pixels().zip(segments.pixels()) {
        let (m, s) = (m.0[0], s.0[0]);
        if m != 0 && s != 0 {
            let entry = children.entry(m).or_default();
            if !entry.contains(&s) {
                entry.push(s);
            }
        }
    }

    let mut out = LabelMap::new(markers.width(), markers.height());
    let mut next = 1u32;
    let mut remap_marker: BTreeMap<u32, u32> = BTreeMap::new();
    let mut remap_segment: BTreeMap<u32, u32> = BTreeMap::new();
    for (m, kids) in &children {
        if kids.len() >= 2 {
            for &s in kids {
                remap_segment.insert(s, next);
                next += 1;
            }
        } else {
            remap_marker.insert(*m, next);
            next += 1;
        }
    }
    // Markers with no child at this level stay as they are.
    for px in markers.pixels() {
        let m = px.0[0];
        if m != 0 && !children.contains_key(&m) && !remap_marker.contains_key(&m) {
            remap_marker.insert(m, next);
            next += 1;
        }
    }

    for (x, y, px) in out.enumerate_pixels_mut() {
        let m = markers.get_pixel(x, y).0[0];
        if m == 0 {
            continue;
        }
        let s = segments.get_pixel(x, y).0[0];
        if let Some(&new) = remap_marker.get(&m) {
            *px = Luma([new]);
        } else if let Some(&new) = remap_segment.get(&s) {
            *px = Luma([new]);
        }
    }
    out
}

/// Marker pixel sets whose flux reaches `contrast` of the source flux.
fn apply_contrast(fp: &Footprint, markers: &LabelMap, contrast: f64) -> Vec<Vec<usize>> {
    let total: f64 = fp.values.iter().filter(|v| v.is_finite()).sum();
    let mut sets: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (i, px) in markers.pixels().enumerate() {
        if px.0[0] != 0 {
            sets.entry(px.0[0]).or_default().push(i);
        }
    }
    sets.into_values()
        .filter(|set| {
            if total <= 0.0 {
                return true;
            }
            let flux: f64 = set.iter().map(|&i| fp.values[i]).sum();
            flux / total >= contrast
        })
        .collect()
}

/// Entry in the flood queue: brightest first, oldest first on ties.
struct FloodEntry {
    value: f64,
    seq: u64,
    local: usize,
}

impl PartialEq for FloodEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloodEntry {}

impl PartialOrd for FloodEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Assign every reachable footprint pixel to a marker, flooding from the
/// brightest frontier pixel outward.
fn flood_from_markers(fp: &Footprint, markers: &[Vec<usize>]) -> Vec<Option<usize>> {
    let mut owner: Vec<Option<usize>> = vec![None; fp.inside.len()];
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;
    for (m, set) in markers.iter().enumerate() {
        for &local in set {
            owner[local] = Some(m);
            heap.push(FloodEntry {
                value: fp.values[local],
                seq,
                local,
            });
            seq += 1;
        }
    }
    while let Some(entry) = heap.pop() {
        let Some(m) = owner[entry.local] else {
            continue;
        };
        for n in fp.neighbours(entry.local) {
            if owner[n].is_none() {
                owner[n] = Some(m);
                heap.push(FloodEntry {
                    value: fp.values[n],
                    seq,
                    local: n,
                });
                seq += 1;
            }
        }
    }
    owner
}

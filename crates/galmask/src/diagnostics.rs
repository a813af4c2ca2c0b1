//! Pipeline diagnostics: timing, label counts, and other metrics for
//! each stage.
//!
//! Every call to [`clean_staged`](crate::clean_staged) collects
//! diagnostics alongside the intermediate maps. They exist for
//! parameter tuning: seeing how many labels detection produced, how
//! many deblending added, and which label pruning removed usually
//! explains a bad mask.
//!
//! Timestamps are captured with the `web-time` crate, which uses
//! `performance.now()` on WASM and `std::time::Instant` on native.
//! Durations are serialized as fractional seconds (`f64`) since
//! `std::time::Duration` does not implement serde traits.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{LabelMap, Mask};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single cleaning run.
///
/// Stages that can be switched off in [`CleanConfig`](crate::CleanConfig)
/// are `None` when they did not run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: background subtraction and smoothing.
    pub smooth: StageDiagnostics,
    /// Stage 2: source detection (or adoption of a supplied map).
    pub detect: StageDiagnostics,
    /// Stage 3: deblending (only when `config.deblend == true`).
    pub deblend: Option<StageDiagnostics>,
    /// Stage 4: farthest-peak pruning (only when
    /// `config.remove_local_max == true`).
    pub prune: Option<StageDiagnostics>,
    /// Stage 5: central-object selection.
    pub select: StageDiagnostics,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Background subtraction and smoothing.
    Smooth {
        /// Scalar background level that was subtracted.
        background: f64,
        /// Kernel width in pixels.
        kernel_width: usize,
        /// Kernel height in pixels.
        kernel_height: usize,
        /// Sum of the kernel weights before normalisation.
        kernel_sum: f64,
    },
    /// Source detection.
    Detect {
        /// Whether the map came from the caller instead of the detector.
        supplied: bool,
        /// Distinct non-zero labels in the detection map.
        label_count: usize,
        /// Pixels covered by any label.
        foreground_pixels: u64,
    },
    /// Deblending.
    Deblend {
        /// Labels going in.
        labels_before: usize,
        /// Labels coming out.
        labels_after: usize,
    },
    /// Farthest-peak pruning.
    Prune {
        /// Peaks found.
        peak_count: usize,
        /// The label that was removed, if any.
        removed_label: Option<u32>,
        /// Labels remaining after pruning.
        labels_after: usize,
    },
    /// Central-object selection.
    Select {
        /// Selection mode code (`"0"`, `"1"` or `"2"`).
        mode: String,
        /// Pixels in the final mask.
        mask_pixels: u64,
    },
}

/// High-level summary for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Image width in pixels.
    pub image_width: u32,
    /// Image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Labels in the detection map.
    pub detected_labels: usize,
    /// Pixels in the final mask.
    pub mask_pixels: u64,
    /// Number of warnings raised.
    pub warning_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Galmask Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages: Vec<(&str, &StageDiagnostics)> =
            vec![("Smooth", &self.smooth), ("Detect", &self.detect)];
        if let Some(ref d) = self.deblend {
            stages.push(("Deblend", d));
        }
        if let Some(ref p) = self.prune {
            stages.push(("Prune", p));
        }
        stages.push(("Select", &self.select));

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Detected labels: {}  |  Mask pixels: {}  |  Warnings: {}",
            self.summary.detected_labels, self.summary.mask_pixels, self.summary.warning_count,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Smooth {
            background,
            kernel_width,
            kernel_height,
            kernel_sum,
        } => format!("bkg={background:.4} kernel={kernel_width}x{kernel_height} sum={kernel_sum:.4}"),
        StageMetrics::Detect {
            supplied,
            label_count,
            foreground_pixels,
        } => {
            let source = if *supplied { "supplied" } else { "detected" };
            format!("{label_count} labels {source}, {foreground_pixels} px")
        }
        StageMetrics::Deblend {
            labels_before,
            labels_after,
        } => format!("{labels_before}->{labels_after} labels"),
        StageMetrics::Prune {
            peak_count,
            removed_label,
            labels_after,
        } => {
            let removed = removed_label.map_or_else(|| "none".to_string(), |l| l.to_string());
            format!("{peak_count} peaks, removed={removed}, {labels_after} labels left")
        }
        StageMetrics::Select { mode, mask_pixels } => {
            format!("mode={mode} mask={mask_pixels} px")
        }
    }
}

/// Number of distinct non-zero labels.
pub(crate) fn count_labels(labels: &LabelMap) -> usize {
    labels
        .pixels()
        .map(|p| p.0[0])
        .filter(|&l| l != 0)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Number of labelled (non-zero) pixels.
pub(crate) fn count_foreground(labels: &LabelMap) -> u64 {
    labels.pixels().map(|p| u64::from(p.0[0] != 0)).sum()
}

/// Number of set pixels in a `{0, 1}` mask.
pub(crate) fn count_mask_pixels(mask: &Mask) -> u64 {
    mask.pixels().map(|p| u64::from(p.0[0] > 0.5)).sum()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;

    fn sample() -> PipelineDiagnostics {
        PipelineDiagnostics {
            smooth: StageDiagnostics {
                duration: Duration::from_millis(4),
                metrics: StageMetrics::Smooth {
                    background: 0.5,
                    kernel_width: 3,
                    kernel_height: 3,
                    kernel_sum: 1.0,
                },
            },
            detect: StageDiagnostics {
                duration: Duration::from_millis(6),
                metrics: StageMetrics::Detect {
                    supplied: false,
                    label_count: 3,
                    foreground_pixels: 420,
                },
            },
            deblend: Some(StageDiagnostics {
                duration: Duration::from_millis(20),
                metrics: StageMetrics::Deblend {
                    labels_before: 3,
                    labels_after: 4,
                },
            }),
            prune: None,
            select: StageDiagnostics {
                duration: Duration::from_millis(2),
                metrics: StageMetrics::Select {
                    mode: "1".to_string(),
                    mask_pixels: 300,
                },
            },
            total_duration: Duration::from_millis(32),
            summary: PipelineSummary {
                image_width: 64,
                image_height: 48,
                pixel_count: 3072,
                detected_labels: 3,
                mask_pixels: 300,
                warning_count: 0,
            },
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        assert!((duration_ms(d) - 1234.0).abs() < 0.01);
    }

    #[test]
    fn report_lists_run_stages_only() {
        let report = sample().report();
        assert!(report.contains("Galmask Diagnostics Report"));
        assert!(report.contains("64x48"));
        assert!(report.contains("Deblend"));
        assert!(report.contains("3->4 labels"));
        assert!(!report.contains("Prune"));
    }

    #[test]
    fn diagnostics_serialize_durations_as_seconds() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!((json["total_duration"].as_f64().unwrap() - 0.032).abs() < 1e-9);
        let back: PipelineDiagnostics = serde_json::from_value(json).unwrap();
        assert!((back.total_duration.as_secs_f64() - 0.032).abs() < 1e-9);
        assert_eq!(back.select.metrics, sample().select.metrics);
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["total_duration"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<PipelineDiagnostics>(json).is_err());
    }

    #[test]
    fn label_counts() {
        let mut labels = LabelMap::new(4, 4);
        labels.put_pixel(0, 0, Luma([3]));
        labels.put_pixel(1, 0, Luma([3]));
        labels.put_pixel(3, 3, Luma([9]));
        assert_eq!(count_labels(&labels), 2);
        assert_eq!(count_foreground(&labels), 3);

        let mut mask = Mask::new(4, 4);
        mask.put_pixel(2, 2, Luma([1.0]));
        assert_eq!(count_mask_pixels(&mask), 1);
    }
}

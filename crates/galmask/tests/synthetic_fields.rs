//! Integration tests: run synthetic galaxy fields through the full
//! cleaning pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use galmask::{
    CleanConfig, CleanWarning, GalmaskError, Image, Kernel, LabelMap, SelectionMode, clean,
    clean_staged,
};
use image::Luma;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const SIZE: u32 = 64;

/// One circular Gaussian source: `(row, col, amplitude, sigma)`.
type Source = (f64, f64, f64, f64);

/// A galaxy at the centre and a compact star towards the top right.
const GALAXY_AND_STAR: [Source; 2] = [(32.0, 32.0, 100.0, 4.0), (10.0, 52.0, 60.0, 1.5)];

/// A noisy field of Gaussian sources over a constant sky level.
fn field(sources: &[Source], sky: f64, noise: f64, seed: u64) -> Image {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, noise).unwrap();
    Image::from_fn(SIZE, SIZE, |x, y| {
        let (fx, fy) = (f64::from(x), f64::from(y));
        let signal: f64 = sources
            .iter()
            .map(|&(r, c, amp, sigma)| {
                let d2 = (fx - c).powi(2) + (fy - r).powi(2);
                amp * (-d2 / (2.0 * sigma * sigma)).exp()
            })
            .sum();
        Luma([sky + signal + normal.sample(&mut rng)])
    })
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn on(mask: &Image, row: u32, col: u32) -> bool {
    mask.get_pixel(col, row).0[0] > 0.5
}

#[test]
fn isolated_star_is_removed() {
    init_logging();
    let img = field(&GALAXY_AND_STAR, 20.0, 1.0, 7);
    let (staged, diagnostics) = clean_staged(&img, None, &CleanConfig::default()).unwrap();
    eprintln!("{}", diagnostics.report());

    assert!(on(&staged.mask, 32, 32));
    assert!(!on(&staged.mask, 10, 52));
    assert!(staged.warnings.is_empty());

    // The star's label is the one that got pruned.
    let star_label = staged.deblended.get_pixel(52, 10).0[0];
    assert_ne!(star_label, 0);
    assert_eq!(staged.pruned_label, Some(star_label));

    // Sky level is recovered from the sigma-clipped median.
    assert!((staged.background - 20.0).abs() < 0.5, "background {}", staged.background);

    for (x, y, m) in staged.mask.enumerate_pixels() {
        let expected = m.0[0] * img.get_pixel(x, y).0[0];
        assert!((staged.masked.get_pixel(x, y).0[0] - expected).abs() < 1e-12);
    }
}

#[test]
fn blended_neighbour_is_split_off() {
    init_logging();
    let img = field(
        &[(32.0, 32.0, 100.0, 3.0), (32.0, 46.0, 60.0, 3.0)],
        0.0,
        1.0,
        11,
    );
    let (staged, _) = clean_staged(&img, None, &CleanConfig::default()).unwrap();

    // Detection sees one blended source; deblending separates the two.
    let merged = staged.detection.get_pixel(32, 32).0[0];
    assert_ne!(merged, 0);
    assert_eq!(staged.detection.get_pixel(46, 32).0[0], merged);
    let galaxy = staged.deblended.get_pixel(32, 32).0[0];
    let neighbour = staged.deblended.get_pixel(46, 32).0[0];
    assert_ne!(galaxy, neighbour);

    assert_eq!(staged.pruned_label, Some(neighbour));
    assert!(on(&staged.mask, 32, 32));
    assert!(!on(&staged.mask, 32, 46));
}

#[test]
fn lone_source_is_pruned_away() {
    // With a single label the farthest peak belongs to the galaxy itself.
    let img = field(&[(32.0, 32.0, 100.0, 4.0)], 0.0, 1.0, 13);
    let result = clean(&img, None, &CleanConfig::default());
    assert!(matches!(result, Err(GalmaskError::NoComponent)));

    let config = CleanConfig {
        remove_local_max: false,
        ..CleanConfig::default()
    };
    let result = clean(&img, None, &config).unwrap();
    assert!(on(&result.mask, 32, 32));
}

#[test]
fn pure_noise_has_no_detection() {
    init_logging();
    let img = field(&[], 5.0, 1.0, 3);
    let result = clean(&img, None, &CleanConfig::default());
    assert!(matches!(result, Err(GalmaskError::NoDetection)));
}

#[test]
fn degenerate_kernel_is_rejected() {
    let img = field(&[(32.0, 32.0, 100.0, 4.0)], 0.0, 1.0, 5);
    let config = CleanConfig {
        kernel: Some(Kernel::new(vec![1e-12; 9], 3, 3).unwrap()),
        ..CleanConfig::default()
    };
    let result = clean(&img, None, &config);
    assert!(matches!(result, Err(GalmaskError::DegenerateKernel { .. })));
}

#[test]
fn unnormalised_kernel_warns_but_still_cleans() {
    init_logging();
    let img = field(&GALAXY_AND_STAR, 0.0, 1.0, 5);
    let config = CleanConfig {
        kernel: Some(Kernel::new(vec![0.5 / 9.0; 9], 3, 3).unwrap()),
        ..CleanConfig::default()
    };
    let result = clean(&img, None, &config).unwrap();
    assert_eq!(result.warnings.len(), 1);
    assert!(matches!(
        result.warnings[0],
        CleanWarning::KernelNotNormalized { sum } if (sum - 0.5).abs() < 1e-9
    ));
    assert!(on(&result.mask, 32, 32));
}

/// Segmentation map with a 20x20 block around the centre (label 1) and
/// a 10x10 block near a corner (label 2).
fn two_block_segmap() -> LabelMap {
    LabelMap::from_fn(SIZE, SIZE, |x, y| {
        let v = if (22..42).contains(&x) && (22..42).contains(&y) {
            1
        } else if (4..14).contains(&x) && (4..14).contains(&y) {
            2
        } else {
            0
        };
        Luma([v])
    })
}

#[test]
fn supplied_segmap_works_in_every_mode() {
    init_logging();
    let img = field(&[(32.0, 32.0, 100.0, 4.0)], 0.0, 1.0, 21);
    let seg = two_block_segmap();
    for mode in SelectionMode::ALL {
        let config = CleanConfig {
            mode,
            deblend: false,
            ..CleanConfig::default()
        };
        let result = clean(&img, Some(&seg), &config).unwrap();
        let kept = result.mask.pixels().filter(|p| p.0[0] > 0.5).count();
        assert_eq!(kept, 400, "mode {mode}");
        assert!(on(&result.mask, 32, 32), "mode {mode}");
        assert!(!on(&result.mask, 8, 8), "mode {mode}");
    }
}

#[test]
fn supplied_segmap_skips_detection_on_pure_noise() {
    let img = field(&[], 0.0, 1.0, 4);
    let seg = two_block_segmap();
    let config = CleanConfig {
        deblend: false,
        remove_local_max: false,
        ..CleanConfig::default()
    };
    let result = clean(&img, Some(&seg), &config).unwrap();
    assert!(on(&result.mask, 32, 32));
}

#[test]
fn mismatched_segmap_is_rejected() {
    let img = field(&[(32.0, 32.0, 100.0, 4.0)], 0.0, 1.0, 5);
    let seg = LabelMap::new(SIZE, SIZE / 2);
    let result = clean(&img, Some(&seg), &CleanConfig::default());
    assert!(matches!(result, Err(GalmaskError::ShapeMismatch { .. })));
}

#[test]
fn invalid_connectivity_is_rejected() {
    let img = field(&[(32.0, 32.0, 100.0, 4.0)], 0.0, 1.0, 5);
    let config = CleanConfig {
        connectivity: 5,
        ..CleanConfig::default()
    };
    let result = clean(&img, None, &config);
    assert!(matches!(result, Err(GalmaskError::InvalidConnectivity(5))));
}

#[test]
fn config_loads_from_json() {
    let config: CleanConfig =
        serde_json::from_str(r#"{"mode": "2", "deblend": false, "nsigma": 4.0}"#).unwrap();
    assert_eq!(config.mode, SelectionMode::LargestPruned);
    assert_eq!(config.npixels, CleanConfig::default().npixels);

    let img = field(&GALAXY_AND_STAR, 0.0, 1.0, 9);
    let result = clean(&img, None, &config).unwrap();
    assert!(on(&result.mask, 32, 32));
}

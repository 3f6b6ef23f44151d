//! End-to-end indexing tests: predict a pattern from a randomly oriented
//! crystal, index it, and check that the recovered lattice explains the peaks.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::{Matrix3, Vector2, Vector3};
use pinkindexer::{
    AngleResolution, ConcurrencyStrategy, ConsideredPeaksCount, IndexerConfig, Lattice, Peak,
    PinkIndexer, RefinementType,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use synthetic_pattern::*;

fn fast_config(refinement_type: RefinementType) -> IndexerConfig {
    IndexerConfig {
        considered_peaks_count: ConsideredPeaksCount::VeryFew,
        angle_resolution: AngleResolution::ExtremelyLoose,
        refinement_type,
        multi_seed_restarts: Some(4),
        ..Default::default()
    }
}

#[test]
fn test_index_synthetic_pattern() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(1234);

    // ── Step 1: Synthetic pattern of a rotated crystal ──
    let rotation = random_rotation(&mut rng);
    let true_lattice = prototype.rotated(&rotation);
    let peaks = synthetic_peaks(&settings, &true_lattice, &mut rng, 0.0);
    println!("Synthetic pattern: {} peaks", peaks.len());
    assert!(peaks.len() >= 20, "too few predicted peaks: {}", peaks.len());

    // ── Step 2: Index ──
    let mut indexer = PinkIndexer::new(
        settings,
        fast_config(RefinementType::FirstFixedThenVariableLatticeParameters),
    )
    .unwrap();
    let result = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::ParallelPerPeak { threads: 4 })
        .unwrap();

    // ── Step 3: Verify ──
    println!(
        "Indexed {}/{} peaks, lattice:\n{}",
        result.fitted_peaks_count,
        peaks.len(),
        result.lattice.basis()
    );
    assert_eq!(result.fitted_peaks.len(), peaks.len());
    assert!(
        result.fitted_peaks_count as f64 >= 0.8 * peaks.len() as f64,
        "only {} of {} peaks indexed",
        result.fitted_peaks_count,
        peaks.len()
    );
    assert!(is_same_lattice(&true_lattice, &result.lattice, 0.1));

    // Reduced and ordered like the prototype: lengths match.
    let norms = result.lattice.basis_vector_norms();
    let expected = indexer.prototype().basis_vector_norms();
    assert!((norms - expected).abs().max() < 0.02 * expected.max());
}

#[test]
fn test_serial_and_parallel_agree() {
    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(99);
    let true_lattice = prototype.rotated(&random_rotation(&mut rng));
    let peaks = synthetic_peaks(&settings, &true_lattice, &mut rng, 0.0);

    let config = fast_config(RefinementType::FixedLatticeParameters);
    let mut indexer = PinkIndexer::new(settings, config).unwrap();
    let serial = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::Serial)
        .unwrap();
    let double_buffered = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::DoubleBuffered { threads: 3 })
        .unwrap();

    assert_eq!(serial.fitted_peaks, double_buffered.fitted_peaks);
    assert_eq!(serial.lattice, double_buffered.lattice);
}

#[test]
fn test_index_with_position_noise() {
    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(7);
    let true_lattice = prototype.rotated(&random_rotation(&mut rng));
    // 75 µm pixels: half a pixel of noise.
    let peaks = synthetic_peaks(&settings, &true_lattice, &mut rng, 37e-6);

    let mut indexer = PinkIndexer::new(
        settings,
        fast_config(RefinementType::FirstFixedThenVariableLatticeParameters),
    )
    .unwrap();
    let result = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::from_thread_count(4))
        .unwrap();
    assert!(result.fitted_peaks_count as f64 >= 0.7 * peaks.len() as f64);
    assert!(is_same_lattice(&true_lattice, &result.lattice, 0.15));
}

#[test]
fn test_index_reciprocal_peaks() {
    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(2024);
    let true_lattice = prototype.rotated(&random_rotation(&mut rng));
    let peaks = synthetic_peaks(&settings, &true_lattice, &mut rng, 0.0);
    let reciprocal_peaks = mean_reciprocal_peaks(&settings, &peaks);
    let intensities: Vec<f64> = peaks.iter().map(|p| p.intensity).collect();

    let mut indexer = PinkIndexer::new(
        settings,
        fast_config(RefinementType::FirstFixedThenVariableLatticeParameters),
    )
    .unwrap();
    let result = indexer
        .index_reciprocal_peaks(&reciprocal_peaks, &intensities, ConcurrencyStrategy::Serial)
        .unwrap();
    assert!(result.fitted_peaks_count as f64 >= 0.8 * peaks.len() as f64);
}

#[test]
fn test_multi_seed_refinement() {
    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(5);
    let true_lattice = prototype.rotated(&random_rotation(&mut rng));
    let peaks = synthetic_peaks(&settings, &true_lattice, &mut rng, 0.0);

    let mut indexer = PinkIndexer::new(
        settings,
        fast_config(RefinementType::FirstFixedThenVariableLatticeParametersMultiSeed),
    )
    .unwrap();
    let result = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::ParallelPerPeak { threads: 2 })
        .unwrap();
    assert!(result.fitted_peaks_count as f64 >= 0.8 * peaks.len() as f64);
    assert_eq!(result.center_shift_m, Vector2::zeros());
}

#[test]
fn test_center_adjustment() {
    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(31);
    let true_lattice = prototype.rotated(&random_rotation(&mut rng));
    let offset = Vector2::new(6e-5, -4e-5);
    let peaks: Vec<Peak> = synthetic_peaks(&settings, &true_lattice, &mut rng, 0.0)
        .into_iter()
        .map(|p| Peak::new(p.x + offset.x, p.y + offset.y, p.intensity))
        .collect();

    let mut config =
        fast_config(RefinementType::FirstFixedThenVariableLatticeParametersCenterAdjustmentMultiSeed);
    config.max_center_shift_m = 1e-4;
    config.multi_seed_restarts = Some(16);
    let mut indexer = PinkIndexer::new(settings, config).unwrap();
    let result = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::ParallelPerPeak { threads: 2 })
        .unwrap();

    let center_error = (result.center_shift_m - offset).norm();
    println!(
        "Center shift: {:?} (true {:?}, error {:.2e})",
        result.center_shift_m, offset, center_error
    );
    assert!(result.fitted_peaks_count as f64 >= 0.7 * peaks.len() as f64);
    assert!(
        center_error < 0.25 * offset.norm(),
        "center shift {:?} is {:.2e} m from the true offset",
        result.center_shift_m,
        center_error
    );
}

#[test]
fn test_degenerate_inputs() {
    let settings = experiment(orthorhombic_reciprocal());
    let mut indexer =
        PinkIndexer::new(settings, fast_config(RefinementType::FixedLatticeParameters)).unwrap();

    let empty = indexer.index_pattern(&[], ConcurrencyStrategy::Serial).unwrap();
    assert_eq!(empty.fitted_peaks_count, 0);
    assert!(empty.fitted_peaks.is_empty());

    let single = indexer
        .index_pattern(&[Peak::new(0.02, -0.01, 50.0)], ConcurrencyStrategy::Serial)
        .unwrap();
    assert_eq!(single.fitted_peaks_count, 0);
    assert_eq!(single.fitted_peaks, vec![false]);
}

#[test]
fn test_progress_is_reported() {
    let prototype = orthorhombic_reciprocal();
    let settings = experiment(prototype.clone());
    let mut rng = StdRng::seed_from_u64(11);
    let peaks = synthetic_peaks(&settings, &prototype.rotated(&random_rotation(&mut rng)), &mut rng, 0.0);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut indexer = PinkIndexer::new(settings, fast_config(RefinementType::None))
        .unwrap()
        .with_progress(move |stage: &str, fraction: f64| {
            assert_eq!(stage, "sinogram");
            assert!(fraction > 0.0 && fraction <= 1.0);
            counter.fetch_add(1, Ordering::Relaxed);
        });
    indexer
        .index_pattern(&peaks, ConcurrencyStrategy::Serial)
        .unwrap();

    // One report per peak entering the sinogram.
    let expected = peaks.len().min(ConsideredPeaksCount::VeryFew.peak_count());
    assert_eq!(calls.load(Ordering::Relaxed), expected);
}

#[test]
fn test_pseudo_degenerate_cell() {
    // a ≈ b within 3%: the reflection search must tolerate the mismatch.
    let prototype = Lattice::new(Matrix3::from_diagonal(&Vector3::new(0.1, 0.103, 0.08)));
    let settings = experiment(prototype.clone());
    assert_eq!(
        settings
            .different_reciprocal_lattice_vector_lengths_1_per_a()
            .unwrap()
            .len(),
        2
    );
    assert!(settings.reciprocal_length_degeneracy_tolerance().unwrap() > 0.01);

    let mut rng = StdRng::seed_from_u64(17);
    let true_lattice = prototype.rotated(&random_rotation(&mut rng));
    let peaks = synthetic_peaks(&settings, &true_lattice, &mut rng, 0.0);
    let mut indexer = PinkIndexer::new(
        settings,
        fast_config(RefinementType::FirstFixedThenVariableLatticeParameters),
    )
    .unwrap();
    let result = indexer
        .index_pattern(&peaks, ConcurrencyStrategy::from_thread_count(2))
        .unwrap();
    assert!(result.fitted_peaks_count as f64 >= 0.8 * peaks.len() as f64);
}

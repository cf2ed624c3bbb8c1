use kpca_anomaly::{Kernel, KpcaAnomalyError, KpcaReconConfig, ReconErrorKpca};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

fn gaussian_cluster(n_rows: usize, n_cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((n_rows, n_cols), |_| normal.sample(&mut rng))
}

#[test]
fn single_far_outlier_is_the_only_prediction() {
    // One Gaussian cluster with one row pushed 10 standard deviations out in
    // every feature; contamination 0.01 sizes the anomaly set to exactly 1.
    let mut data = gaussian_cluster(100, 5, 2018);
    let outlier_row = 23;
    data.row_mut(outlier_row).mapv_inplace(|v| v + 10.0);

    let detector = ReconErrorKpca::new(KpcaReconConfig::default()).unwrap();

    let scores = detector.score(&data).unwrap();
    assert_eq!(scores.len(), 100);
    assert!(scores.iter().all(|s| s.is_finite() && *s >= 0.0));

    let labels = detector.predict(&data).unwrap();
    assert_eq!(labels.iter().map(|&l| l as usize).sum::<usize>(), 1);
    assert_eq!(labels[outlier_row], 1);
    assert_eq!(detector.anomaly_indices(&data).unwrap(), vec![outlier_row]);
}

#[test]
fn zero_contamination_labels_every_row_normal() {
    let mut data = gaussian_cluster(40, 3, 7);
    data.row_mut(5).mapv_inplace(|v| v + 10.0);

    let config = KpcaReconConfig {
        contamination: 0.0,
        ..KpcaReconConfig::default()
    };
    let detector = ReconErrorKpca::new(config).unwrap();

    let labels = detector.predict(&data).unwrap();
    assert_eq!(labels, Array1::<u8>::zeros(40));
}

#[test]
fn zero_variance_column_fails_before_scoring() {
    let mut data = gaussian_cluster(30, 3, 11);
    data.column_mut(2).fill(1.5);

    let detector = ReconErrorKpca::new(KpcaReconConfig::default()).unwrap();
    assert!(matches!(
        detector.score(&data),
        Err(KpcaAnomalyError::InvalidInput(_))
    ));
}

#[test]
fn perfectly_correlated_columns_trigger_degenerate_reconstruction() {
    // Every column is an affine image of the same vector, so the dataset has
    // rank 1 and every rank-k reconstruction collapses onto the rank-1 one.
    let base = gaussian_cluster(20, 1, 13);
    let mut data = Array2::<f64>::zeros((20, 3));
    for j in 0..3 {
        let scale = (j + 1) as f64;
        let offset = j as f64 * 0.5;
        for i in 0..20 {
            data[[i, j]] = scale * base[[i, 0]] + offset;
        }
    }

    let config = KpcaReconConfig {
        kernel: Kernel::Linear,
        ..KpcaReconConfig::default()
    };
    let detector = ReconErrorKpca::new(config).unwrap();

    assert!(matches!(
        detector.predict(&data),
        Err(KpcaAnomalyError::DegenerateReconstruction(_))
    ));
}

#[test]
fn predictions_are_idempotent_for_a_fixed_configuration() {
    let data = gaussian_cluster(60, 4, 23);
    let config = KpcaReconConfig {
        contamination: 0.05,
        ..KpcaReconConfig::default()
    };
    let detector = ReconErrorKpca::new(config).unwrap();

    let first = detector.predict(&data).unwrap();
    let second = detector.predict(&data).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.iter().map(|&l| l as usize).sum::<usize>(), 3);
}

#[test]
fn label_count_matches_the_contamination_ceiling() {
    let data = gaussian_cluster(50, 3, 31);
    for (contamination, expected) in [(0.02, 1), (0.1, 5), (0.33, 17), (0.5, 25)] {
        let config = KpcaReconConfig {
            contamination,
            ..KpcaReconConfig::default()
        };
        let detector = ReconErrorKpca::new(config).unwrap();
        let labels = detector.predict(&data).unwrap();
        assert_eq!(
            labels.iter().map(|&l| l as usize).sum::<usize>(),
            expected,
            "contamination {contamination}"
        );
    }
}

#[test]
fn perfectly_average_row_scores_in_the_lower_half() {
    let mut data = gaussian_cluster(80, 4, 37);
    let means = data.sum_axis(Axis(0)) / 80.0;
    data.row_mut(0).assign(&means);

    let config = KpcaReconConfig {
        contamination: 0.05,
        ..KpcaReconConfig::default()
    };
    let detector = ReconErrorKpca::new(config).unwrap();

    let scores = detector.score(&data).unwrap();
    let mut sorted: Vec<f64> = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = sorted[sorted.len() / 2];
    assert!(
        scores[0] <= median,
        "average row scored {} above the median {median}",
        scores[0]
    );

    let labels = detector.predict(&data).unwrap();
    assert_eq!(labels[0], 0);
}

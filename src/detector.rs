//! Reconstruction-error anomaly detection pipeline.
//!
//! The pipeline is an explicit sequence of value-passing stages: standardize
//! the input, estimate the cumulative explained-variance ratio from the full
//! Gram spectrum, build one kernel-PCA reconstruction per retained rank,
//! aggregate the weighted residual norms into a per-row score, and finally
//! rank rows against the contamination quantile. Every stage's output is
//! computed once per request; nothing is memoized across requests.

use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crate::error::{KpcaAnomalyError, Result};
use crate::kernel::Kernel;
use crate::kpca::KernelPca;

/// Columns whose population standard deviation falls below this are rejected
/// as zero-variance rather than silently zero-filled.
const ZERO_VARIANCE_THRESHOLD: f64 = 1e-9;
/// Two reconstructions whose largest element-wise difference stays below
/// this are considered numerically identical.
const RECONSTRUCTION_DISTINCT_TOLERANCE: f64 = 1e-12;

/// Runtime configuration for [`ReconErrorKpca`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KpcaReconConfig {
    /// Assumed fraction of anomalous rows, in [0, 0.5]. Sizes the anomaly
    /// set as ceil(n * contamination).
    pub contamination: f64,
    /// Kernel for both the spectrum estimate and the per-rank
    /// reconstructions.
    pub kernel: Kernel,
    /// Kernel coefficient for poly, rbf and sigmoid. `None` resolves to
    /// 1 / n_features at scoring time. Must be finite and positive when set.
    pub gamma: Option<f64>,
    /// Seed for the reconstruction-series sanity check's pair selection.
    pub random_seed: u64,
    /// Emit an `info!` progress line after every this many completed rank
    /// reconstructions. `None` disables progress reporting.
    pub progress_interval: Option<usize>,
}

impl Default for KpcaReconConfig {
    fn default() -> Self {
        Self {
            contamination: 0.01,
            kernel: Kernel::Rbf,
            gamma: None,
            random_seed: 2018,
            progress_interval: None,
        }
    }
}

// --- Typed intermediate data products ---

/// The input matrix after per-column standardization. Read-only once built.
#[derive(Debug)]
pub struct StandardizedMatrix {
    /// Shape: (n_rows, n_cols); every column has mean 0 and unit population
    /// variance.
    pub data: Array2<f64>,
}

impl StandardizedMatrix {
    pub fn num_rows(&self) -> usize {
        self.data.nrows()
    }
    pub fn num_cols(&self) -> usize {
        self.data.ncols()
    }
}

/// Cumulative explained-variance ratio of the top-d Gram eigenvalues.
#[derive(Debug)]
pub struct CumulativeVarianceRatio {
    /// Length d; non-decreasing; values in (0, 1]; last element 1.
    pub ratios: Array1<f64>,
}

/// Ordered sequence of rank-k reconstructions, index k-1 <-> rank k.
#[derive(Debug)]
pub struct ReconstructionSeries {
    /// Each matrix has the shape of the standardized input.
    pub matrices: Vec<Array2<f64>>,
}

impl ReconstructionSeries {
    pub fn len(&self) -> usize {
        self.matrices.len()
    }
    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }
}

/// Standardizes each column of `matrix` to zero mean and unit population
/// variance (ddof = 0, matching the conventional scaler).
///
/// # Errors
/// `InvalidInput` if the matrix has fewer than 2 rows or no columns,
/// contains non-finite values, or has a column with (near-)zero variance.
pub fn standardize_columns(matrix: &Array2<f64>) -> Result<StandardizedMatrix> {
    let n = matrix.nrows();
    let d = matrix.ncols();
    if n < 2 {
        return Err(KpcaAnomalyError::InvalidInput(format!(
            "need at least 2 rows to standardize, got {n}"
        )));
    }
    if d < 1 {
        return Err(KpcaAnomalyError::InvalidInput(
            "matrix has no feature columns".to_string(),
        ));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(KpcaAnomalyError::InvalidInput(
            "matrix contains non-finite values".to_string(),
        ));
    }

    let means = matrix.sum_axis(Axis(0)) / n as f64;
    let std_devs = matrix.map_axis(Axis(0), |column| column.std(0.0));
    if let Some((idx, _)) = std_devs
        .iter()
        .enumerate()
        .find(|(_, s)| s.abs() < ZERO_VARIANCE_THRESHOLD)
    {
        return Err(KpcaAnomalyError::InvalidInput(format!(
            "column {idx} has zero variance"
        )));
    }

    let data = (matrix - &means) / &std_devs;
    Ok(StandardizedMatrix { data })
}

/// Kernel-PCA reconstruction-error anomaly detector.
///
/// Construct once from a validated configuration, then call
/// [`score`](Self::score) or [`predict`](Self::predict) per dataset. A run
/// owns all of its derived artifacts; two runs never share state, so
/// concurrent detectors with different configurations cannot interfere.
#[derive(Clone, Debug)]
pub struct ReconErrorKpca {
    config: KpcaReconConfig,
}

impl ReconErrorKpca {
    /// Validates the configuration and builds a detector.
    ///
    /// # Errors
    /// `InvalidParameter` if contamination is outside [0, 0.5] or gamma is
    /// set but not finite and positive.
    pub fn new(config: KpcaReconConfig) -> Result<Self> {
        validate_contamination(config.contamination)?;
        if let Some(gamma) = config.gamma {
            if !gamma.is_finite() || gamma <= 0.0 {
                return Err(KpcaAnomalyError::InvalidParameter(format!(
                    "gamma must be finite and positive, got {gamma}"
                )));
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &KpcaReconConfig {
        &self.config
    }

    /// Scores every row of `matrix` for anomalousness; higher is more
    /// anomalous.
    pub fn score(&self, matrix: &Array2<f64>) -> Result<Array1<f64>> {
        self.score_impl(matrix, None)
    }

    /// As [`score`](Self::score), polling `cancel` between rank
    /// reconstructions. Once the flag is set the run fails with `Cancelled`;
    /// already-computed ranks are discarded.
    pub fn score_with_cancel(
        &self,
        matrix: &Array2<f64>,
        cancel: &AtomicBool,
    ) -> Result<Array1<f64>> {
        self.score_impl(matrix, Some(cancel))
    }

    /// Labels every row: 1 for the ceil(n * contamination) highest-scoring
    /// rows, 0 otherwise.
    pub fn predict(&self, matrix: &Array2<f64>) -> Result<Array1<u8>> {
        let scores = self.score(matrix)?;
        let indices = rank_by_score(&scores, self.config.contamination)?;
        Ok(labels_from_indices(scores.len(), &indices))
    }

    /// As [`predict`](Self::predict), with best-effort cancellation.
    pub fn predict_with_cancel(
        &self,
        matrix: &Array2<f64>,
        cancel: &AtomicBool,
    ) -> Result<Array1<u8>> {
        let scores = self.score_with_cancel(matrix, cancel)?;
        let indices = rank_by_score(&scores, self.config.contamination)?;
        Ok(labels_from_indices(scores.len(), &indices))
    }

    /// Indices of the anomalous rows, highest score first.
    pub fn anomaly_indices(&self, matrix: &Array2<f64>) -> Result<Vec<usize>> {
        let scores = self.score(matrix)?;
        rank_by_score(&scores, self.config.contamination)
    }

    fn score_impl(&self, matrix: &Array2<f64>, cancel: Option<&AtomicBool>) -> Result<Array1<f64>> {
        if self.config.kernel == Kernel::Precomputed {
            return Err(KpcaAnomalyError::InvalidParameter(
                "scoring requires an inverse transform, which is undefined for a \
                 precomputed kernel"
                    .to_string(),
            ));
        }

        let overall_start = Instant::now();
        let standardized = standardize_columns(matrix)?;
        let (n, d) = (standardized.num_rows(), standardized.num_cols());
        if d > n {
            return Err(KpcaAnomalyError::InvalidInput(format!(
                "need at least as many rows as columns for a full rank sweep, got {n}x{d}"
            )));
        }
        let gamma = self.resolve_gamma(d);
        info!(
            "scoring {n}x{d} matrix with kernel={}, gamma={gamma:.6}",
            self.config.kernel
        );

        let ratio = self.cumulative_variance_ratio(&standardized, gamma)?;
        let series = self.build_reconstruction_series(&standardized, gamma, cancel)?;
        let scores = aggregate_scores(&standardized, &ratio, &series);

        info!(
            "scored {n} rows across {d} ranks in {:?}",
            overall_start.elapsed()
        );
        Ok(scores)
    }

    fn resolve_gamma(&self, num_features: usize) -> f64 {
        self.config.gamma.unwrap_or(1.0 / num_features as f64)
    }

    /// Estimates the cumulative explained-variance ratio from the full Gram
    /// spectrum: element k is the eigenvalue mass of the top k+1 components
    /// over the mass of the top d.
    pub(crate) fn cumulative_variance_ratio(
        &self,
        x: &StandardizedMatrix,
        gamma: f64,
    ) -> Result<CumulativeVarianceRatio> {
        let d = x.num_cols();
        let model = KernelPca::fit(&x.data.view(), self.config.kernel, gamma, None, false)?;
        let lambdas = model.eigenvalues();

        let total: f64 = lambdas.iter().take(d).sum();
        if total <= 0.0 {
            return Err(KpcaAnomalyError::Decomposition(
                "top-d eigenvalue spectrum has no positive mass".to_string(),
            ));
        }

        let mut ratios = Array1::<f64>::zeros(d);
        let mut running = 0.0;
        for (k, lambda) in lambdas.iter().take(d).enumerate() {
            running += lambda;
            ratios[k] = running / total;
        }
        debug!(
            "variance ratio: rank 1 explains {:.4}, rank {d} explains {:.4}",
            ratios[0],
            ratios[d - 1]
        );
        Ok(CumulativeVarianceRatio { ratios })
    }

    /// Builds the rank-k reconstruction for every k in 1..=d. The d fits are
    /// independent pure computations and run on the rayon pool; results are
    /// collected back into rank order.
    pub(crate) fn build_reconstruction_series(
        &self,
        x: &StandardizedMatrix,
        gamma: f64,
        cancel: Option<&AtomicBool>,
    ) -> Result<ReconstructionSeries> {
        let d = x.num_cols();
        let start = Instant::now();
        let completed = AtomicUsize::new(0);

        let results: Vec<Result<Array2<f64>>> = (1..=d)
            .into_par_iter()
            .map(|rank| {
                if let Some(flag) = cancel {
                    if flag.load(Ordering::Relaxed) {
                        return Err(KpcaAnomalyError::Cancelled);
                    }
                }
                let model =
                    KernelPca::fit(&x.data.view(), self.config.kernel, gamma, Some(rank), true)?;
                let reconstruction = model.reconstruct()?;
                debug_assert_eq!(reconstruction.dim(), x.data.dim());

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(interval) = self.config.progress_interval {
                    if interval > 0 && (done % interval == 0 || done == d) {
                        info!(
                            "{done} of {d} rank reconstructions complete ({:?} elapsed)",
                            start.elapsed()
                        );
                    }
                }
                Ok(reconstruction)
            })
            .collect();

        let mut matrices = Vec::with_capacity(d);
        for result in results {
            matrices.push(result?);
        }

        let series = ReconstructionSeries { matrices };
        self.check_series_distinct(&series)?;
        debug!("reconstruction series complete in {:?}", start.elapsed());
        Ok(series)
    }

    /// Verifies that two series entries, picked by the seeded RNG, actually
    /// differ. A kernel/hyperparameter combination that makes all ranks
    /// equivalent is a misconfiguration, not a dataset property.
    pub(crate) fn check_series_distinct(&self, series: &ReconstructionSeries) -> Result<()> {
        let count = series.len();
        if count < 2 {
            return Ok(());
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_seed);
        let picked = rand::seq::index::sample(&mut rng, count, 2).into_vec();
        let first = &series.matrices[picked[0]];
        let second = &series.matrices[picked[1]];

        let max_diff = first
            .iter()
            .zip(second.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        if max_diff <= RECONSTRUCTION_DISTINCT_TOLERANCE {
            return Err(KpcaAnomalyError::DegenerateReconstruction(format!(
                "reconstructions at ranks {} and {} are numerically identical \
                 (max |diff| = {max_diff:.3e})",
                picked[0] + 1,
                picked[1] + 1
            )));
        }
        Ok(())
    }
}

/// Aggregates the weighted residual norms:
/// score[i] = sum_k ratio[k] * ||standardized[i] - reconstruction_k[i]||_2.
pub(crate) fn aggregate_scores(
    x: &StandardizedMatrix,
    ratio: &CumulativeVarianceRatio,
    series: &ReconstructionSeries,
) -> Array1<f64> {
    let n = x.num_rows();
    let mut scores = Array1::<f64>::zeros(n);

    for (k, reconstruction) in series.matrices.iter().enumerate() {
        let weight = ratio.ratios[k];
        for (i, (row, recon_row)) in x
            .data
            .axis_iter(Axis(0))
            .zip(reconstruction.axis_iter(Axis(0)))
            .enumerate()
        {
            let mut squared = 0.0;
            for (a, b) in row.iter().zip(recon_row.iter()) {
                let diff = a - b;
                squared += diff * diff;
            }
            scores[i] += weight * squared.sqrt();
        }
    }
    scores
}

/// Row indices of the ceil(n * contamination) highest scores, descending by
/// score with ties broken by ascending row index.
pub(crate) fn rank_by_score(scores: &Array1<f64>, contamination: f64) -> Result<Vec<usize>> {
    validate_contamination(contamination)?;
    let n = scores.len();
    let anomaly_count = (n as f64 * contamination).ceil() as usize;

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(anomaly_count);
    Ok(order)
}

pub(crate) fn labels_from_indices(n: usize, indices: &[usize]) -> Array1<u8> {
    let mut labels = Array1::<u8>::zeros(n);
    for &idx in indices {
        labels[idx] = 1;
    }
    labels
}

fn validate_contamination(contamination: f64) -> Result<()> {
    if !contamination.is_finite() || !(0.0..=0.5).contains(&contamination) {
        return Err(KpcaAnomalyError::InvalidParameter(format!(
            "contamination must be in [0, 0.5], got {contamination}"
        )));
    }
    Ok(())
}

//! Kernel-PCA decomposition engine.
//!
//! Fits an eigendecomposition of the centered Gram matrix and, on request, a
//! kernel-ridge regression from the embedding back to the input space. The
//! engine is a pure collaborator for the detection pipeline: one fit per
//! requested rank, no shared mutable state, deterministic for a given input
//! (the dense symmetric eigensolver involves no randomness).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};

use crate::error::{KpcaAnomalyError, Result};
use crate::kernel::{gram_matrix, Kernel};

/// Ridge penalty for the approximate inverse transform.
const RIDGE_ALPHA: f64 = 1.0;
/// Eigenvalues below this fraction of the leading eigenvalue are treated as
/// zero rank: their embedding columns stay exactly zero, so truncations past
/// the numerical rank reproduce the same reconstruction.
const EIGENVALUE_RANK_TOLERANCE: f64 = 1e-12;
/// Floor for the ridge-system eigenvalues before inversion.
const RIDGE_SINGULARITY_FLOOR: f64 = 1e-12;

/// Learned kernel-ridge map from embedding space back to the input space.
#[derive(Debug)]
struct InverseTransform {
    /// Gram matrix of the embedding rows under the fit kernel, without the
    /// ridge term. Shape: (n, n).
    embedding_gram: Array2<f64>,
    /// Dual coefficients of the ridge regression. Shape: (n, d).
    dual_coef: Array2<f64>,
}

/// A fitted kernel-PCA model.
///
/// `n_components = None` requests the full Gram spectrum (all n eigenvalues);
/// `Some(k)` truncates the embedding to the top k principal directions.
#[derive(Debug)]
pub struct KernelPca {
    /// Retained eigenvalues of the centered Gram matrix, descending and
    /// clamped to be non-negative. Length: number of retained components.
    eigenvalues: Array1<f64>,
    /// Embedding of the training rows. Shape: (n, num_components). Columns
    /// past the numerical rank are exactly zero.
    embedding: Array2<f64>,
    inverse: Option<InverseTransform>,
}

impl KernelPca {
    /// Fits the decomposition to the rows of `x`.
    ///
    /// * `x` - input matrix, shape (n, d); for [`Kernel::Precomputed`] this
    ///   is the n×n Gram matrix itself.
    /// * `n_components` - `None` for the full spectrum, `Some(k)` with
    ///   1 <= k <= n for a truncated fit.
    /// * `fit_inverse` - additionally learn the kernel-ridge inverse map so
    ///   [`KernelPca::reconstruct`] becomes available. Not supported for
    ///   precomputed kernels.
    ///
    /// # Errors
    /// `Decomposition` when the eigensolver fails or the centered Gram matrix
    /// carries no positive eigenvalue mass; `InvalidParameter` for an
    /// out-of-range component count or an inverse fit on a precomputed
    /// kernel; `InvalidInput` for a non-square precomputed Gram matrix.
    pub fn fit(
        x: &ArrayView2<f64>,
        kernel: Kernel,
        gamma: f64,
        n_components: Option<usize>,
        fit_inverse: bool,
    ) -> Result<Self> {
        let n = x.nrows();
        if n == 0 {
            return Err(KpcaAnomalyError::InvalidInput(
                "cannot decompose an empty matrix".to_string(),
            ));
        }
        if fit_inverse && kernel == Kernel::Precomputed {
            return Err(KpcaAnomalyError::InvalidParameter(
                "inverse transform is undefined for a precomputed kernel".to_string(),
            ));
        }
        let num_components = n_components.unwrap_or(n);
        if num_components == 0 || num_components > n {
            return Err(KpcaAnomalyError::InvalidParameter(format!(
                "n_components must be in 1..={n}, got {num_components}"
            )));
        }

        let gram = gram_matrix(x, kernel, gamma)?;
        let centered = center_gram(&gram);

        let (raw_eigenvalues, eigenvectors) = centered.eigh(UPLO::Upper).map_err(|e| {
            KpcaAnomalyError::Decomposition(format!(
                "symmetric eigendecomposition of the centered Gram matrix failed: {e}"
            ))
        })?;

        // LAPACK returns the spectrum ascending; reorder descending.
        let mut eig_pairs: Vec<(f64, Array1<f64>)> = raw_eigenvalues
            .into_iter()
            .zip(eigenvectors.columns().into_iter().map(|col| col.to_owned()))
            .collect();
        eig_pairs.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let leading = eig_pairs.first().map_or(0.0, |(value, _)| *value);
        if leading <= 0.0 {
            return Err(KpcaAnomalyError::Decomposition(
                "centered Gram matrix has no positive eigenvalue mass".to_string(),
            ));
        }
        let rank_floor = leading * EIGENVALUE_RANK_TOLERANCE;

        let mut eigenvalues = Array1::<f64>::zeros(num_components);
        let mut embedding = Array2::<f64>::zeros((n, num_components));
        for (idx, (value, vector)) in eig_pairs.iter().take(num_components).enumerate() {
            let clamped = value.max(0.0);
            eigenvalues[idx] = clamped;
            if clamped > rank_floor {
                let scale = clamped.sqrt();
                let mut column = embedding.column_mut(idx);
                column.assign(vector);
                column.mapv_inplace(|v| v * scale);
            }
        }

        let inverse = if fit_inverse {
            Some(fit_kernel_ridge(&embedding.view(), x, kernel, gamma)?)
        } else {
            None
        };

        Ok(Self {
            eigenvalues,
            embedding,
            inverse,
        })
    }

    /// Retained eigenvalues, descending and non-negative.
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Embedding of the training rows, shape (n, num_components).
    pub fn embedding(&self) -> &Array2<f64> {
        &self.embedding
    }

    pub fn num_components(&self) -> usize {
        self.embedding.ncols()
    }

    /// Reconstructs the training matrix from the retained embedding through
    /// the kernel-ridge inverse map. Shape of the result: (n, d).
    ///
    /// # Errors
    /// `Decomposition` if the model was fitted with `fit_inverse = false`.
    pub fn reconstruct(&self) -> Result<Array2<f64>> {
        let inverse = self.inverse.as_ref().ok_or_else(|| {
            KpcaAnomalyError::Decomposition(
                "model was fitted without inverse transform support".to_string(),
            )
        })?;
        Ok(inverse.embedding_gram.dot(&inverse.dual_coef))
    }
}

/// Double-centers a Gram matrix: K - 1K/n - K1/n + 1K1/n².
fn center_gram(gram: &Array2<f64>) -> Array2<f64> {
    let n = gram.nrows() as f64;
    let row_means = gram.sum_axis(Axis(1)) / n;
    let col_means = gram.sum_axis(Axis(0)) / n;
    let total_mean = row_means.sum() / n;

    gram.to_owned() - &row_means.insert_axis(Axis(1)) - &col_means.insert_axis(Axis(0))
        + total_mean
}

/// Learns dual coefficients mapping the embedding back to `x` by kernel
/// ridge regression, solved through the eigendecomposition of the ridged
/// embedding Gram matrix.
fn fit_kernel_ridge(
    embedding: &ArrayView2<f64>,
    x: &ArrayView2<f64>,
    kernel: Kernel,
    gamma: f64,
) -> Result<InverseTransform> {
    let embedding_gram = gram_matrix(embedding, kernel, gamma)?;
    let n = embedding_gram.nrows();

    let mut ridged = embedding_gram.clone();
    for i in 0..n {
        ridged[[i, i]] += RIDGE_ALPHA;
    }

    let (ridge_eigenvalues, ridge_eigenvectors) = ridged.eigh(UPLO::Upper).map_err(|e| {
        KpcaAnomalyError::Decomposition(format!(
            "eigendecomposition of the ridge system failed: {e}"
        ))
    })?;
    if ridge_eigenvalues
        .iter()
        .any(|v| v.abs() < RIDGE_SINGULARITY_FLOOR)
    {
        return Err(KpcaAnomalyError::Decomposition(
            "ridge system for the inverse transform is numerically singular".to_string(),
        ));
    }

    // dual = V diag(1/w) V^T x, with w the ridged eigenvalues.
    let mut projected = ridge_eigenvectors.t().dot(x);
    for (mut row, &w) in projected.axis_iter_mut(Axis(0)).zip(ridge_eigenvalues.iter()) {
        row.mapv_inplace(|v| v / w);
    }
    let dual_coef = ridge_eigenvectors.dot(&projected);

    Ok(InverseTransform {
        embedding_gram,
        dual_coef,
    })
}

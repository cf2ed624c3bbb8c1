//! Error types for the reconstruction-error detector.

use std::fmt;

/// Errors surfaced by the detection pipeline.
///
/// Every variant is unrecoverable for the request that produced it: the
/// pipeline propagates the first failure immediately and returns no partial
/// results.
#[derive(Debug)]
pub enum KpcaAnomalyError {
    /// The input matrix is malformed or degenerate: fewer than 2 rows, zero
    /// columns, non-finite values, a zero-variance column, or a non-square
    /// precomputed Gram matrix.
    InvalidInput(String),

    /// A runtime parameter is outside its domain: contamination not in
    /// [0, 0.5], an unknown kernel name, or a non-positive gamma.
    InvalidParameter(String),

    /// The kernel decomposition engine could not factor the Gram matrix, or
    /// the spectrum carries no positive eigenvalue mass.
    Decomposition(String),

    /// All sampled rank-k reconstructions are numerically identical. This
    /// signals a trivial kernel or rank-deficient dataset rather than a
    /// normal-path failure.
    DegenerateReconstruction(String),

    /// The caller's cancellation flag was observed before the reconstruction
    /// series completed. Already-computed ranks are discarded.
    Cancelled,
}

impl fmt::Display for KpcaAnomalyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KpcaAnomalyError::InvalidInput(msg) => write!(f, "invalid input matrix: {msg}"),
            KpcaAnomalyError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            KpcaAnomalyError::Decomposition(msg) => {
                write!(f, "kernel decomposition failed: {msg}")
            }
            KpcaAnomalyError::DegenerateReconstruction(msg) => {
                write!(f, "degenerate reconstruction series: {msg}")
            }
            KpcaAnomalyError::Cancelled => write!(f, "reconstruction batch cancelled"),
        }
    }
}

impl std::error::Error for KpcaAnomalyError {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KpcaAnomalyError>;

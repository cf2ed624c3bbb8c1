//! Kernel functions and Gram-matrix construction.
//!
//! The Gram matrix is the only input the decomposition engine sees, so the
//! kernel zoo lives here: the six kernels of the configuration surface plus
//! the row-pair evaluation rules. Gram construction is parallelized over
//! output rows with rayon.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{KpcaAnomalyError, Result};

/// Fixed polynomial degree for [`Kernel::Poly`].
const POLY_DEGREE: i32 = 3;
/// Additive constant for [`Kernel::Poly`] and [`Kernel::Sigmoid`].
const KERNEL_COEF0: f64 = 1.0;
/// A cosine row with norm below this is treated as orthogonal to everything.
const COSINE_NORM_FLOOR: f64 = 1e-12;

/// Kernel selection for the decomposition engine.
///
/// `gamma` scales `Poly`, `Rbf` and `Sigmoid`; `Linear` and `Cosine` ignore
/// it. `Precomputed` treats the input matrix itself as the Gram matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    Linear,
    Poly,
    Rbf,
    Sigmoid,
    Cosine,
    Precomputed,
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::Rbf
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kernel::Linear => "linear",
            Kernel::Poly => "poly",
            Kernel::Rbf => "rbf",
            Kernel::Sigmoid => "sigmoid",
            Kernel::Cosine => "cosine",
            Kernel::Precomputed => "precomputed",
        };
        f.write_str(name)
    }
}

impl FromStr for Kernel {
    type Err = KpcaAnomalyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Kernel::Linear),
            "poly" => Ok(Kernel::Poly),
            "rbf" => Ok(Kernel::Rbf),
            "sigmoid" => Ok(Kernel::Sigmoid),
            "cosine" => Ok(Kernel::Cosine),
            "precomputed" => Ok(Kernel::Precomputed),
            other => Err(KpcaAnomalyError::InvalidParameter(format!(
                "unknown kernel name '{other}', expected one of \
                 linear | poly | rbf | sigmoid | cosine | precomputed"
            ))),
        }
    }
}

/// Evaluates the kernel for a single pair of rows.
fn kernel_value(kernel: Kernel, gamma: f64, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    match kernel {
        Kernel::Linear => a.dot(&b),
        Kernel::Poly => (gamma * a.dot(&b) + KERNEL_COEF0).powi(POLY_DEGREE),
        Kernel::Rbf => {
            let mut squared_dist = 0.0;
            for (x, y) in a.iter().zip(b.iter()) {
                let diff = x - y;
                squared_dist += diff * diff;
            }
            (-gamma * squared_dist).exp()
        }
        Kernel::Sigmoid => (gamma * a.dot(&b) + KERNEL_COEF0).tanh(),
        Kernel::Cosine => unreachable!("cosine pairs are evaluated with cached norms"),
        Kernel::Precomputed => unreachable!("precomputed kernels never evaluate pairs"),
    }
}

/// Builds the n×n Gram matrix of the rows of `x` under the given kernel.
///
/// For [`Kernel::Precomputed`] the input is validated to be square and
/// returned as-is. All other kernels evaluate every row pair; output rows are
/// filled in parallel.
pub fn gram_matrix(x: &ArrayView2<f64>, kernel: Kernel, gamma: f64) -> Result<Array2<f64>> {
    let n = x.nrows();

    if kernel == Kernel::Precomputed {
        if x.ncols() != n {
            return Err(KpcaAnomalyError::InvalidInput(format!(
                "precomputed Gram matrix must be square, got {}x{}",
                n,
                x.ncols()
            )));
        }
        return Ok(x.to_owned());
    }

    // Cosine normalizes by row norms; compute them once up front.
    let row_norms: Option<Array1<f64>> = match kernel {
        Kernel::Cosine => Some(x.map_axis(Axis(1), |row| row.dot(&row).sqrt())),
        _ => None,
    };

    let mut gram = Array2::<f64>::zeros((n, n));
    gram.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut gram_row)| {
            let row_i = x.row(i);
            for j in 0..n {
                let value = match (&row_norms, kernel) {
                    (Some(norms), Kernel::Cosine) => {
                        let norm_product = norms[i] * norms[j];
                        if norm_product > COSINE_NORM_FLOOR {
                            row_i.dot(&x.row(j)) / norm_product
                        } else {
                            0.0
                        }
                    }
                    _ => kernel_value(kernel, gamma, row_i, x.row(j)),
                };
                gram_row[j] = value;
            }
        });

    Ok(gram)
}

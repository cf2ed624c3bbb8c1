// Kernel-PCA reconstruction-error anomaly detection

#![doc = include_str!("../README.md")]

pub mod detector;
pub mod error;
pub mod kernel;
pub mod kpca;


pub use detector::{
    standardize_columns, CumulativeVarianceRatio, KpcaReconConfig, ReconErrorKpca,
    ReconstructionSeries, StandardizedMatrix,
};
pub use error::{KpcaAnomalyError, Result};
pub use kernel::Kernel;
pub use kpca::KernelPca;

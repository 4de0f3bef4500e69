//! Shared statistical utilities.

pub mod descriptive;
pub mod fdr;
pub mod regression;
pub mod reliability;

pub use fdr::{benjamini_hochberg, FdrResult};
pub use regression::{
    effect_size_r, ClusteredFit, DesignBuilder, Estimate, Inference, RegressionConfig,
};
pub use reliability::{icc_2_1, omega_pca, OmegaPca};

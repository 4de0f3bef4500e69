//! Agreement and internal-structure statistics.

use std::cmp::Ordering;

use nalgebra::linalg::SymmetricEigen;
use nalgebra::DMatrix;
use serde::Serialize;

use crate::error::{AnalysisError, Result};
use crate::stats::descriptive;

/// Minimum complete participant pairs for ICC(2,1).
pub const ICC_MIN_PAIRS: usize = 3;
/// Minimum complete rows for the one-factor approximation.
pub const OMEGA_MIN_ROWS: usize = 5;
/// Minimum items for the one-factor approximation.
pub const OMEGA_MIN_ITEMS: usize = 3;

/// ICC(2,1): two-way random effects, absolute agreement, single rater.
///
/// Uses rows where both ratings are present; `NaN` below
/// [`ICC_MIN_PAIRS`] such rows.
pub fn icc_2_1(r1: &[f64], r2: &[f64]) -> f64 {
    let rows: Vec<[f64; 2]> = r1
        .iter()
        .zip(r2)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| [*a, *b])
        .collect();
    let n = rows.len();
    if n < ICC_MIN_PAIRS {
        return f64::NAN;
    }
    let k = 2.0;
    let nf = n as f64;
    let grand = rows.iter().map(|r| r[0] + r[1]).sum::<f64>() / (nf * k);
    let target_means: Vec<f64> = rows.iter().map(|r| (r[0] + r[1]) / k).collect();
    let rater_means = [
        rows.iter().map(|r| r[0]).sum::<f64>() / nf,
        rows.iter().map(|r| r[1]).sum::<f64>() / nf,
    ];

    let msr = k * target_means.iter().map(|m| (m - grand).powi(2)).sum::<f64>() / (nf - 1.0);
    let msc = nf * rater_means.iter().map(|m| (m - grand).powi(2)).sum::<f64>() / (k - 1.0);
    let sse: f64 = rows
        .iter()
        .zip(&target_means)
        .map(|(r, tm)| {
            (0..2)
                .map(|j| (r[j] - tm - rater_means[j] + grand).powi(2))
                .sum::<f64>()
        })
        .sum();
    let mse = sse / ((k - 1.0) * (nf - 1.0));

    (msr - mse) / (msr + (k - 1.0) * mse + k * (msc - mse) / nf)
}

/// Eigen-decomposition of a symmetric matrix, sorted by descending
/// eigenvalue. Column `i` of the returned matrix pairs with value `i`.
pub fn principal_axes(sym: DMatrix<f64>) -> (Vec<f64>, DMatrix<f64>) {
    let eig = SymmetricEigen::new(sym);
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(Ordering::Equal)
    });
    let values = order.iter().map(|&i| eig.eigenvalues[i]).collect();
    let vectors = DMatrix::from_fn(eig.eigenvectors.nrows(), order.len(), |r, c| {
        eig.eigenvectors[(r, order[c])]
    });
    (values, vectors)
}

/// One-factor reliability and dimensionality of an item set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OmegaPca {
    pub omega_total: f64,
    /// Percent of variance on the first component.
    pub pc1_pct: f64,
    pub pc2_pct: f64,
    pub n_complete: usize,
    pub n_items: usize,
}

/// McDonald's ω_total approximated from first-component PCA loadings on
/// z-scored items, plus the variance shares of the first two components.
///
/// Items are z-scored (sample SD) over their present values, then only rows
/// complete on every item are used.
pub fn omega_pca(items: &[Vec<f64>]) -> Result<OmegaPca> {
    let p = items.len();
    if p < OMEGA_MIN_ITEMS {
        return Err(AnalysisError::InsufficientData {
            context: "omega items".to_string(),
            needed: OMEGA_MIN_ITEMS,
            got: p,
        });
    }
    let z: Vec<Vec<f64>> = items.iter().map(|c| descriptive::zscore(c)).collect();
    let n_rows = z.iter().map(Vec::len).min().unwrap_or(0);
    let complete: Vec<usize> = (0..n_rows)
        .filter(|&r| z.iter().all(|c| c[r].is_finite()))
        .collect();
    let n = complete.len();
    if n < OMEGA_MIN_ROWS {
        return Err(AnalysisError::InsufficientData {
            context: "omega complete rows".to_string(),
            needed: OMEGA_MIN_ROWS,
            got: n,
        });
    }

    let mut x = DMatrix::from_fn(n, p, |r, c| z[c][complete[r]]);
    for c in 0..p {
        let m = x.column(c).mean();
        x.column_mut(c).add_scalar_mut(-m);
    }
    let cov = (x.transpose() * &x) / (n as f64 - 1.0);
    let (values, vectors) = principal_axes(cov);

    let total: f64 = values.iter().sum();
    let ev1 = values[0].max(0.0);
    let loadings: Vec<f64> = vectors.column(0).iter().map(|v| v * ev1.sqrt()).collect();
    let sum_l: f64 = loadings.iter().sum();
    let uniqueness: f64 = loadings.iter().map(|l| 1.0 - l * l).sum();
    let omega_total = sum_l * sum_l / (sum_l * sum_l + uniqueness);

    let pct = |i: usize| {
        values
            .get(i)
            .map_or(f64::NAN, |v| if total > 0.0 { v / total * 100.0 } else { f64::NAN })
    };
    Ok(OmegaPca {
        omega_total,
        pc1_pct: pct(0),
        pc2_pct: pct(1),
        n_complete: n,
        n_items: p,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icc_of_identical_ratings_is_one() {
        let x = [10.0, 35.0, 50.0, 72.0, 90.0];
        assert!((icc_2_1(&x, &x) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn icc_needs_three_complete_pairs() {
        let x = [10.0, 20.0, f64::NAN, 40.0];
        let y = [12.0, f64::NAN, 30.0, 41.0];
        assert!(icc_2_1(&x, &y).is_nan());
    }

    #[test]
    fn icc_penalises_systematic_offset() {
        let x = [10.0, 30.0, 50.0, 70.0, 90.0];
        let shifted: Vec<f64> = x.iter().map(|v| v + 20.0).collect();
        let icc = icc_2_1(&x, &shifted);
        assert!(icc < 1.0 && icc > 0.5, "{icc}");
    }

    #[test]
    fn principal_axes_are_sorted() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 3.0]);
        let (values, vectors) = principal_axes(m);
        assert_eq!(values, vec![3.0, 1.0]);
        assert!((vectors[(1, 0)].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn omega_is_high_for_a_single_factor() {
        let factor: Vec<f64> = (0..30).map(|i| ((i * 13) % 29) as f64).collect();
        let items: Vec<Vec<f64>> = (0..4)
            .map(|j| {
                factor
                    .iter()
                    .enumerate()
                    .map(|(i, f)| f + ((i + j * 7) % 5) as f64 * 0.5)
                    .collect()
            })
            .collect();
        let res = omega_pca(&items).unwrap();
        assert_eq!(res.n_complete, 30);
        assert!(res.omega_total > 0.9, "{}", res.omega_total);
        assert!(res.pc1_pct > 80.0);
        assert!(res.pc1_pct + res.pc2_pct <= 100.0 + 1e-9);
    }

    #[test]
    fn omega_requires_rows_and_items() {
        let two_items = vec![vec![1.0, 2.0, 3.0, 4.0, 5.0]; 2];
        assert!(omega_pca(&two_items).is_err());
        let few_rows = vec![vec![1.0, 2.0, 3.0, 4.0]; 3];
        assert!(omega_pca(&few_rows).unwrap_err().is_underdetermined());
    }
}

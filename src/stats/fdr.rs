//! Benjamini–Hochberg false-discovery-rate control.

use std::cmp::Ordering;

use serde::Serialize;

use crate::error::{AnalysisError, Result};

/// Nominal FDR level used for the rejection flag.
pub const FDR_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FdrResult {
    /// Step-up adjusted q-values, in input order. Capped at 1.
    pub q: Vec<f64>,
    /// `p <= rank / m * alpha`.
    pub rejected: Vec<bool>,
}

/// BH over a declared family of `m` tests (`m >= p.len()`).
///
/// Missing p-values take no rank: their q is `NaN` and they are never
/// rejected. `m` is not reduced for them.
///
/// q-values are capped at 1: the step-up running minimum of `p * m / rank`
/// is clipped, so a large `p` in a wide family reports `q = 1` rather than
/// a value above 1. The rejection flag is computed from the raw `p` and is
/// unaffected by the cap.
pub fn benjamini_hochberg(p: &[f64], m: usize) -> Result<FdrResult> {
    if m < p.len() {
        return Err(AnalysisError::invalid_config(format!(
            "FDR family size {m} is smaller than the {} p-values supplied",
            p.len()
        )));
    }
    let mut order: Vec<usize> = (0..p.len()).filter(|&i| p[i].is_finite()).collect();
    order.sort_by(|&a, &b| p[a].partial_cmp(&p[b]).unwrap_or(Ordering::Equal));

    let m = m as f64;
    let mut q = vec![f64::NAN; p.len()];
    let mut rejected = vec![false; p.len()];
    let mut running = f64::INFINITY;
    for (pos, &idx) in order.iter().enumerate().rev() {
        let rank = (pos + 1) as f64;
        running = running.min(p[idx] * m / rank);
        q[idx] = running.min(1.0);
        rejected[idx] = p[idx] <= rank / m * FDR_ALPHA;
    }
    Ok(FdrResult { q, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textbook_step_up() {
        let res = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.20, 0.50], 5).unwrap();
        let expected = [0.05, 0.04 * 5.0 / 3.0, 0.04 * 5.0 / 3.0, 0.25, 0.50];
        for (q, e) in res.q.iter().zip(expected) {
            assert!((q - e).abs() < 1e-12, "{q} vs {e}");
        }
        assert_eq!(res.rejected, vec![true, false, false, false, false]);
    }

    #[test]
    fn declared_family_can_exceed_supplied_p_values() {
        let res = benjamini_hochberg(&[0.01, 0.02], 10).unwrap();
        assert!((res.q[0] - 0.1).abs() < 1e-12);
        assert!((res.q[1] - 0.1).abs() < 1e-12);
        assert!(benjamini_hochberg(&[0.01, 0.02], 1).is_err());
    }

    #[test]
    fn missing_p_values_stay_missing() {
        let res = benjamini_hochberg(&[f64::NAN, 0.01], 5).unwrap();
        assert!(res.q[0].is_nan());
        assert!(!res.rejected[0]);
        assert!((res.q[1] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn q_values_are_capped_at_one() {
        let res = benjamini_hochberg(&[0.9], 5).unwrap();
        assert_eq!(res.q[0], 1.0);

        // Uncapped these would be 1.5 and 1.25.
        let res = benjamini_hochberg(&[0.9, 0.5, 0.01], 5).unwrap();
        assert_eq!(res.q[0], 1.0);
        assert_eq!(res.q[1], 1.0);
        assert!((res.q[2] - 0.05).abs() < 1e-12);
        assert!(res.q.iter().all(|q| *q <= 1.0));
    }
}

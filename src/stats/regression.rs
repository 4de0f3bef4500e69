//! OLS with participant-clustered (CR1) standard errors.
//!
//! Designs are assembled with [`DesignBuilder`]: an intercept, numeric
//! predictors, drop-first indicator blocks and indicator-by-numeric
//! interactions. Rows with a missing response or predictor are dropped before
//! indicator levels are enumerated, so a level that only occurs on dropped
//! rows never produces an all-zero column.
//!
//! Variance: `V = c (X'X)^-1 [sum_g X_g' u_g u_g' X_g] (X'X)^-1` with
//! `c = G/(G-1) * (N-1)/(N-K)`. `X'X` is inverted through Cholesky, falling
//! back to an eigen pseudo-inverse for rank-deficient designs.

use std::collections::{BTreeSet, HashMap};

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, Normal, StudentsT};

use crate::error::{AnalysisError, Result};

pub const INTERCEPT: &str = "const";

/// Relative eigenvalue cutoff for the pseudo-inverse.
const PINV_RCOND: f64 = 1e-12;

/// Reference distribution for Wald tests on clustered estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inference {
    /// Standard normal, the usual large-cluster approximation.
    Normal,
    /// Student t with `G - 1` degrees of freedom.
    StudentT,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    pub inference: Inference,
    /// Two-sided confidence level for intervals.
    pub confidence: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            inference: Inference::Normal,
            confidence: 0.95,
        }
    }
}

enum Term {
    Intercept,
    Numeric {
        name: String,
        values: Vec<f64>,
    },
    Indicators {
        prefix: String,
        levels: Vec<String>,
        order: Option<Vec<String>>,
    },
    IndicatorInteraction {
        prefix: String,
        with: String,
    },
}

/// Builder for a regression design with cluster labels.
pub struct DesignBuilder {
    label: String,
    y: Vec<f64>,
    groups: Vec<String>,
    terms: Vec<Term>,
}

impl DesignBuilder {
    pub fn new(label: impl Into<String>, y: Vec<f64>, groups: Vec<String>) -> Self {
        Self {
            label: label.into(),
            y,
            groups,
            terms: Vec::new(),
        }
    }

    pub fn intercept(mut self) -> Self {
        self.terms.push(Term::Intercept);
        self
    }

    pub fn numeric(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.terms.push(Term::Numeric {
            name: name.into(),
            values,
        });
        self
    }

    /// Drop-first indicators; levels sorted, the smallest is the reference.
    pub fn indicators(mut self, prefix: impl Into<String>, levels: Vec<String>) -> Self {
        self.terms.push(Term::Indicators {
            prefix: prefix.into(),
            levels,
            order: None,
        });
        self
    }

    /// Drop-first indicators in the given level order; the first level
    /// present in the data is the reference. Levels missing from `order`
    /// follow in sorted order.
    pub fn indicators_ordered(
        mut self,
        prefix: impl Into<String>,
        levels: Vec<String>,
        order: &[String],
    ) -> Self {
        self.terms.push(Term::Indicators {
            prefix: prefix.into(),
            levels,
            order: Some(order.to_vec()),
        });
        self
    }

    /// Product of every indicator of `prefix` with the numeric column
    /// `with`, named `<indicator>:<with>`.
    pub fn interact(mut self, prefix: impl Into<String>, with: impl Into<String>) -> Self {
        self.terms.push(Term::IndicatorInteraction {
            prefix: prefix.into(),
            with: with.into(),
        });
        self
    }

    pub fn build(&self) -> Result<Design> {
        let n_raw = self.y.len();
        if self.groups.len() != n_raw {
            return Err(self.shape_error("cluster labels"));
        }
        let mut keep: Vec<bool> = self
            .y
            .iter()
            .zip(&self.groups)
            .map(|(y, g)| y.is_finite() && !g.is_empty())
            .collect();
        for term in &self.terms {
            match term {
                Term::Numeric { name, values } => {
                    if values.len() != n_raw {
                        return Err(self.shape_error(name));
                    }
                    for (k, v) in keep.iter_mut().zip(values) {
                        *k &= v.is_finite();
                    }
                }
                Term::Indicators { prefix, levels, .. } => {
                    if levels.len() != n_raw {
                        return Err(self.shape_error(prefix));
                    }
                    for (k, l) in keep.iter_mut().zip(levels) {
                        *k &= !l.is_empty();
                    }
                }
                _ => {}
            }
        }
        let rows: Vec<usize> = (0..n_raw).filter(|&i| keep[i]).collect();

        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut dummies: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut references = Vec::new();

        for term in &self.terms {
            match term {
                Term::Intercept => {
                    names.push(INTERCEPT.to_string());
                    columns.push(vec![1.0; rows.len()]);
                }
                Term::Numeric { name, values } => {
                    names.push(name.clone());
                    columns.push(rows.iter().map(|&i| values[i]).collect());
                }
                Term::Indicators {
                    prefix,
                    levels,
                    order,
                } => {
                    let present: BTreeSet<&str> = rows.iter().map(|&i| levels[i].as_str()).collect();
                    let mut ordered: Vec<&str> = match order {
                        Some(order) => order
                            .iter()
                            .map(String::as_str)
                            .filter(|l| present.contains(l))
                            .collect(),
                        None => Vec::new(),
                    };
                    for l in &present {
                        if !ordered.contains(l) {
                            ordered.push(*l);
                        }
                    }
                    let Some((reference, rest)) = ordered.split_first() else {
                        dummies.insert(prefix.as_str(), Vec::new());
                        continue;
                    };
                    references.push((prefix.clone(), reference.to_string()));
                    let mut idxs = Vec::with_capacity(rest.len());
                    for level in rest {
                        idxs.push(names.len());
                        names.push(format!("{prefix}_{level}"));
                        columns.push(
                            rows.iter()
                                .map(|&i| if levels[i] == *level { 1.0 } else { 0.0 })
                                .collect(),
                        );
                    }
                    dummies.insert(prefix.as_str(), idxs);
                }
                Term::IndicatorInteraction { prefix, with } => {
                    let base = names.iter().position(|n| n == with).ok_or_else(|| {
                        AnalysisError::invalid_config(format!(
                            "{}: interaction refers to undeclared column {with}",
                            self.label
                        ))
                    })?;
                    let idxs = dummies.get(prefix.as_str()).cloned().ok_or_else(|| {
                        AnalysisError::invalid_config(format!(
                            "{}: interaction refers to undeclared indicators {prefix}",
                            self.label
                        ))
                    })?;
                    for d in idxs {
                        let values: Vec<f64> = columns[d]
                            .iter()
                            .zip(&columns[base])
                            .map(|(a, b)| a * b)
                            .collect();
                        names.push(format!("{}:{with}", names[d]));
                        columns.push(values);
                    }
                }
            }
        }

        let mut group_ids: HashMap<&str, usize> = HashMap::new();
        let groups: Vec<usize> = rows
            .iter()
            .map(|&i| {
                let next = group_ids.len();
                *group_ids.entry(self.groups[i].as_str()).or_insert(next)
            })
            .collect();

        let x = DMatrix::from_fn(rows.len(), names.len(), |r, c| columns[c][r]);
        let y = DVector::from_iterator(rows.len(), rows.iter().map(|&i| self.y[i]));
        Ok(Design {
            label: self.label.clone(),
            names,
            x,
            y,
            groups,
            n_groups: group_ids.len(),
            references,
        })
    }

    pub fn fit(&self, cfg: &RegressionConfig) -> Result<ClusteredFit> {
        self.build()?.fit(cfg)
    }

    fn shape_error(&self, what: &str) -> AnalysisError {
        AnalysisError::invalid_config(format!(
            "{}: {what} length does not match the response",
            self.label
        ))
    }
}

/// Materialised design matrix over complete rows.
#[derive(Debug, Clone)]
pub struct Design {
    pub label: String,
    pub names: Vec<String>,
    pub x: DMatrix<f64>,
    pub y: DVector<f64>,
    pub groups: Vec<usize>,
    pub n_groups: usize,
    /// `(prefix, reference level)` for each indicator block.
    pub references: Vec<(String, String)>,
}

impl Design {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn fit(&self, cfg: &RegressionConfig) -> Result<ClusteredFit> {
        let n = self.n_obs();
        let k = self.names.len();
        if k == 0 || n <= k {
            return Err(AnalysisError::Underdetermined {
                context: self.label.clone(),
                observations: n,
                parameters: k,
            });
        }
        if self.n_groups < 2 {
            return Err(AnalysisError::InsufficientData {
                context: format!("{}: clusters", self.label),
                needed: 2,
                got: self.n_groups,
            });
        }

        let xt = self.x.transpose();
        let xtx = &xt * &self.x;
        let (bread, rank) = invert_symmetric(xtx);
        if rank >= n {
            return Err(AnalysisError::Underdetermined {
                context: self.label.clone(),
                observations: n,
                parameters: rank,
            });
        }
        let params = &bread * (&xt * &self.y);
        let resid = &self.y - &self.x * &params;

        let mut scores = vec![DVector::<f64>::zeros(k); self.n_groups];
        for (i, &g) in self.groups.iter().enumerate() {
            let u = resid[i];
            for j in 0..k {
                scores[g][j] += self.x[(i, j)] * u;
            }
        }
        let mut meat = DMatrix::<f64>::zeros(k, k);
        for s in &scores {
            meat += s * s.transpose();
        }

        let g = self.n_groups as f64;
        let df_resid = (n - rank) as f64;
        let correction = g / (g - 1.0) * (n as f64 - 1.0) / df_resid;
        let cov = (&bread * meat * &bread) * correction;

        Ok(ClusteredFit {
            names: self.names.clone(),
            params,
            cov,
            n_obs: n,
            n_groups: self.n_groups,
            df_resid,
            inference: cfg.inference,
            confidence: cfg.confidence,
        })
    }
}

/// Inverse of a symmetric PSD matrix and its numerical rank.
fn invert_symmetric(m: DMatrix<f64>) -> (DMatrix<f64>, usize) {
    let dim = m.nrows();
    if let Some(chol) = Cholesky::new(m.clone()) {
        let pivots = chol.l_dirty().diagonal();
        let max_pivot = pivots.iter().fold(0.0_f64, |acc, v| acc.max(v * v));
        let min_pivot = pivots.iter().fold(f64::INFINITY, |acc, v| acc.min(v * v));
        if min_pivot > max_pivot * PINV_RCOND * dim as f64 {
            return (chol.inverse(), dim);
        }
    }
    let eig = SymmetricEigen::new(m);
    let max_ev = eig
        .eigenvalues
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let tol = max_ev * PINV_RCOND * dim as f64;
    let mut rank = 0;
    let mut inv = DMatrix::<f64>::zeros(dim, dim);
    for (idx, &ev) in eig.eigenvalues.iter().enumerate() {
        if ev > tol {
            rank += 1;
            let v = eig.eigenvectors.column(idx);
            inv += (v * v.transpose()) / ev;
        }
    }
    (inv, rank)
}

/// Point estimate with clustered inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub estimate: f64,
    pub se: f64,
    /// Wald statistic `estimate / se`.
    pub stat: f64,
    pub p: f64,
    pub ci_lo: f64,
    pub ci_hi: f64,
    pub df_resid: f64,
}

impl Estimate {
    pub fn undefined() -> Self {
        Self {
            estimate: f64::NAN,
            se: f64::NAN,
            stat: f64::NAN,
            p: f64::NAN,
            ci_lo: f64::NAN,
            ci_hi: f64::NAN,
            df_resid: f64::NAN,
        }
    }

    pub fn effect_size_r(&self) -> f64 {
        effect_size_r(self.stat, self.df_resid)
    }
}

/// Fitted model: coefficients and their clustered covariance.
#[derive(Debug, Clone)]
pub struct ClusteredFit {
    pub names: Vec<String>,
    pub params: DVector<f64>,
    pub cov: DMatrix<f64>,
    pub n_obs: usize,
    pub n_groups: usize,
    pub df_resid: f64,
    pub inference: Inference,
    pub confidence: f64,
}

impl ClusteredFit {
    pub fn has_term(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| AnalysisError::MissingTerm {
                term: name.to_string(),
            })
    }

    pub fn coefficient(&self, name: &str) -> Result<Estimate> {
        self.linear_combination(&[(name, 1.0)])
    }

    /// `sum_i w_i * beta_i`, with variance `w' V w` from the full covariance.
    pub fn linear_combination(&self, weights: &[(&str, f64)]) -> Result<Estimate> {
        let mut w = DVector::<f64>::zeros(self.names.len());
        for (name, weight) in weights {
            w[self.index(name)?] += weight;
        }
        let estimate = w.dot(&self.params);
        let var = (w.transpose() * &self.cov * &w)[(0, 0)];
        let se = if var > 0.0 { var.sqrt() } else { f64::NAN };
        Ok(self.wald(estimate, se))
    }

    /// Joint Wald test that every coefficient in `terms` is zero.
    ///
    /// Chi-square with `q` df under [`Inference::Normal`], `W / q` against
    /// `F(q, G - 1)` under [`Inference::StudentT`]. `NaN` when the covariance
    /// block is singular.
    pub fn joint_test(&self, terms: &[&str]) -> Result<f64> {
        let idx = terms
            .iter()
            .map(|t| self.index(t))
            .collect::<Result<Vec<usize>>>()?;
        let q = idx.len();
        if q == 0 {
            return Ok(f64::NAN);
        }
        let b = DVector::from_iterator(q, idx.iter().map(|&i| self.params[i]));
        let v = DMatrix::from_fn(q, q, |r, c| self.cov[(idx[r], idx[c])]);
        let Some(inv) = v.try_inverse() else {
            return Ok(f64::NAN);
        };
        let w = (b.transpose() * inv * &b)[(0, 0)];
        if !w.is_finite() || w < 0.0 {
            return Ok(f64::NAN);
        }
        let p = match self.inference {
            Inference::Normal => ChiSquared::new(q as f64).map(|d| 1.0 - d.cdf(w)),
            Inference::StudentT => FisherSnedecor::new(q as f64, self.n_groups as f64 - 1.0)
                .map(|d| 1.0 - d.cdf(w / q as f64)),
        };
        Ok(p.unwrap_or(f64::NAN))
    }

    fn wald(&self, estimate: f64, se: f64) -> Estimate {
        let stat = if se.is_finite() && se > 0.0 {
            estimate / se
        } else {
            f64::NAN
        };
        let alpha = 1.0 - self.confidence;
        let (p, crit) = match self.inference {
            Inference::Normal => match Normal::new(0.0, 1.0) {
                Ok(d) => (2.0 * (1.0 - d.cdf(stat.abs())), d.inverse_cdf(1.0 - alpha / 2.0)),
                Err(_) => (f64::NAN, f64::NAN),
            },
            Inference::StudentT => match StudentsT::new(0.0, 1.0, self.n_groups as f64 - 1.0) {
                Ok(d) => (2.0 * (1.0 - d.cdf(stat.abs())), d.inverse_cdf(1.0 - alpha / 2.0)),
                Err(_) => (f64::NAN, f64::NAN),
            },
        };
        let p = if stat.is_finite() { p } else { f64::NAN };
        Estimate {
            estimate,
            se,
            stat,
            p,
            ci_lo: estimate - crit * se,
            ci_hi: estimate + crit * se,
            df_resid: self.df_resid,
        }
    }
}

/// Correlation-scale effect size `sign(t) * sqrt(t^2 / (t^2 + df))`.
pub fn effect_size_r(t: f64, df: f64) -> f64 {
    if !t.is_finite() || !df.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    let r = (t * t / (t * t + df)).sqrt();
    r.copysign(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(n: usize, per: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{}", i / per)).collect()
    }

    #[test]
    fn exact_line_recovers_coefficients() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 + 0.5 * v).collect();
        let fit = DesignBuilder::new("line", y, groups(20, 2))
            .intercept()
            .numeric("x", x)
            .fit(&RegressionConfig::default())
            .unwrap();
        assert!((fit.coefficient("x").unwrap().estimate - 0.5).abs() < 1e-10);
        assert!((fit.coefficient(INTERCEPT).unwrap().estimate - 3.0).abs() < 1e-9);
        assert_eq!(fit.n_groups, 10);
        assert_eq!(fit.df_resid, 18.0);
    }

    #[test]
    fn clustered_se_matches_hand_computation() {
        // Intercept-only model: V = c * sum_g (sum_i u_i)^2 / N^2.
        let y = vec![1.0, 3.0, 2.0, 6.0, 4.0, 8.0];
        let g = groups(6, 2);
        let fit = DesignBuilder::new("mean", y.clone(), g)
            .intercept()
            .fit(&RegressionConfig::default())
            .unwrap();
        let mean = 4.0;
        let sums = [1.0 + 3.0 - 2.0 * mean, 2.0 + 6.0 - 2.0 * mean, 4.0 + 8.0 - 2.0 * mean];
        let meat: f64 = sums.iter().map(|s| s * s).sum();
        let c = 3.0 / 2.0 * 5.0 / 5.0;
        let expected = (c * meat / 36.0).sqrt();
        let est = fit.coefficient(INTERCEPT).unwrap();
        assert!((est.estimate - mean).abs() < 1e-12);
        assert!((est.se - expected).abs() < 1e-12);
        assert!((est.ci_hi - est.estimate - 1.959963984540054 * est.se).abs() < 1e-9);
    }

    #[test]
    fn indicators_drop_first_and_interactions_are_named() {
        let n = 40;
        let x: Vec<f64> = (0..n).map(|i| (i * 7 % 11) as f64).collect();
        let block: Vec<String> = (0..n).map(|i| ["B2", "B1", "B3"][i % 3].to_string()).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| x[i] * if block[i] == "B2" { 2.0 } else { 1.0 } + (i % 5) as f64 * 0.1)
            .collect();
        let order = vec!["B2".to_string(), "B1".to_string(), "B3".to_string()];
        let design = DesignBuilder::new("ctx", y, groups(n, 4))
            .intercept()
            .numeric("x", x)
            .indicators_ordered("block", block, &order)
            .interact("block", "x")
            .build()
            .unwrap();
        assert_eq!(
            design.names,
            vec!["const", "x", "block_B1", "block_B3", "block_B1:x", "block_B3:x"]
        );
        assert_eq!(design.references, vec![("block".to_string(), "B2".to_string())]);

        let fit = design.fit(&RegressionConfig::default()).unwrap();
        let slope_b1 = fit
            .linear_combination(&[("x", 1.0), ("block_B1:x", 1.0)])
            .unwrap();
        assert!((fit.coefficient("x").unwrap().estimate - 2.0).abs() < 0.1);
        assert!((slope_b1.estimate - 1.0).abs() < 0.1);
        assert!(matches!(
            fit.coefficient("block_B9:x"),
            Err(AnalysisError::MissingTerm { .. })
        ));
    }

    #[test]
    fn missing_rows_are_dropped_before_levels() {
        let y = vec![1.0, 2.0, f64::NAN, 4.0, 5.0, 7.0];
        let pair: Vec<String> = ["a", "a", "z", "b", "b", "a"].iter().map(|s| s.to_string()).collect();
        let design = DesignBuilder::new("fe", y, groups(6, 1))
            .intercept()
            .indicators("pair", pair)
            .build()
            .unwrap();
        assert_eq!(design.names, vec!["const", "pair_b"]);
        assert_eq!(design.n_obs(), 5);
    }

    #[test]
    fn too_few_rows_or_clusters_is_underdetermined() {
        let err = DesignBuilder::new("tiny", vec![1.0, 2.0], groups(2, 1))
            .intercept()
            .numeric("x", vec![1.0, 2.0])
            .fit(&RegressionConfig::default())
            .unwrap_err();
        assert!(err.is_underdetermined());

        let err = DesignBuilder::new("one cluster", vec![1.0, 2.0, 4.0], groups(3, 3))
            .intercept()
            .numeric("x", vec![1.0, 2.0, 3.0])
            .fit(&RegressionConfig::default())
            .unwrap_err();
        assert!(err.is_underdetermined());
    }

    #[test]
    fn collinear_design_falls_back_to_pseudo_inverse() {
        let x: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let x2 = x.iter().map(|v| 2.0 * v).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 + v).collect();
        let fit = DesignBuilder::new("collinear", y, groups(12, 2))
            .intercept()
            .numeric("x", x)
            .numeric("x2", x2)
            .fit(&RegressionConfig::default())
            .unwrap();
        assert_eq!(fit.df_resid, 10.0);
        let combined = fit.coefficient("x").unwrap().estimate + 2.0 * fit.coefficient("x2").unwrap().estimate;
        assert!((combined - 1.0).abs() < 1e-8);
    }

    #[test]
    fn effect_size_r_keeps_sign_and_rejects_bad_df() {
        assert!((effect_size_r(3.0, 16.0) - 0.6).abs() < 1e-12);
        assert!((effect_size_r(-3.0, 16.0) + 0.6).abs() < 1e-12);
        assert!(effect_size_r(1.0, 0.0).is_nan());
        assert!(effect_size_r(f64::NAN, 10.0).is_nan());
    }
}

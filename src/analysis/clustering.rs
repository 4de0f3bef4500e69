//! Participant clustering on per-person echo slopes.
//!
//! Features are the simple `PhaseII ~ PhaseI` slope over all of a
//! participant's rows plus one per block. Per-person fits ignore pair and
//! block fixed effects: with fifteen points per block there is not enough
//! data to estimate them, so this asymmetry with the pooled models is
//! intended.
//!
//! Complete feature rows are standardised and fitted with diagonal-covariance
//! Gaussian mixtures for each candidate `k`; the lowest BIC wins. Stability
//! is the mean Jaccard overlap between each full-data cluster and its
//! Hungarian-matched counterpart across subsample refits.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AnalysisError, Result};
use crate::panel::{Panel, PARTICIPANT};
use crate::report::{Cell, ReportTable, PRECISION_STRUCTURE};
use crate::stats::descriptive;
use crate::table::{NumericFrame, ReadOptions, Table};

pub const OVERALL_FEATURE: &str = "Overall";
pub const CLUSTER_COLUMN: &str = "cluster";

// ---------------------------------------------------------------------
//  Config
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Smallest component count tried.
    pub k_min: usize,
    /// Largest component count tried.
    pub k_max: usize,
    /// Seed for the full-data mixture fits.
    pub gmm_seed: u64,
    /// Master seed from which per-resample seeds are drawn.
    pub bootstrap_seed: u64,
    pub bootstrap_resamples: usize,
    /// Subsample size as a fraction of participants (drawn without replacement).
    pub subsample_fraction: f64,
    pub max_iter: usize,
    /// EM stops when the mean log-likelihood changes by less than this.
    pub tol: f64,
    /// Added to every variance to keep components non-degenerate.
    pub reg_covar: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            k_min: 1,
            k_max: 4,
            gmm_seed: 1337,
            bootstrap_seed: 2025,
            bootstrap_resamples: 200,
            subsample_fraction: 0.9,
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k_min == 0 || self.k_max < self.k_min {
            return Err(AnalysisError::invalid_config(format!(
                "invalid component range {}..={}",
                self.k_min, self.k_max
            )));
        }
        if !(self.subsample_fraction > 0.0 && self.subsample_fraction <= 1.0) {
            return Err(AnalysisError::invalid_config(
                "subsample_fraction must lie in (0, 1]",
            ));
        }
        if self.max_iter == 0 || self.tol <= 0.0 || self.reg_covar < 0.0 {
            return Err(AnalysisError::invalid_config("invalid EM settings"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
//  Features
// ---------------------------------------------------------------------

/// Per-participant slope vectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlopeFeatures {
    pub ids: Vec<String>,
    pub names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl SlopeFeatures {
    /// Participants with every feature defined.
    pub fn complete(&self) -> SlopeFeatures {
        let keep: Vec<usize> = (0..self.rows.len())
            .filter(|&i| self.rows[i].iter().all(|v| v.is_finite()))
            .collect();
        SlopeFeatures {
            ids: keep.iter().map(|&i| self.ids[i].clone()).collect(),
            names: self.names.clone(),
            rows: keep.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    pub fn to_frame(&self) -> Result<NumericFrame> {
        let columns = (0..self.names.len())
            .map(|j| self.rows.iter().map(|r| r[j]).collect())
            .collect();
        NumericFrame::new(self.ids.clone(), self.names.clone(), columns)
    }
}

/// Overall slope plus one slope per block in `blocks`, for every participant
/// in the panel.
pub fn slope_features(panel: &Panel, blocks: &[String]) -> SlopeFeatures {
    let ids = panel.participants();
    let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut points: Vec<Vec<(&str, f64, f64)>> = vec![Vec::new(); ids.len()];
    for r in panel.rows() {
        points[position[r.participant_id.as_str()]].push((r.block.as_str(), r.phase1, r.phase2));
    }

    let mut names = vec![OVERALL_FEATURE.to_string()];
    names.extend(blocks.iter().cloned());
    let rows = points
        .iter()
        .map(|pts| {
            let mut row = Vec::with_capacity(names.len());
            let (x, y): (Vec<f64>, Vec<f64>) = pts.iter().map(|p| (p.1, p.2)).unzip();
            row.push(descriptive::simple_slope(&x, &y));
            for block in blocks {
                let (x, y): (Vec<f64>, Vec<f64>) = pts
                    .iter()
                    .filter(|p| p.0 == block)
                    .map(|p| (p.1, p.2))
                    .unzip();
                row.push(descriptive::simple_slope(&x, &y));
            }
            row
        })
        .collect();
    SlopeFeatures { ids, names, rows }
}

/// Column-wise `(x - mean) / sd` with population SD; a constant column is
/// centred only.
pub fn standardize(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let Some(d) = rows.first().map(Vec::len) else {
        return Vec::new();
    };
    let mut out = rows.to_vec();
    for j in 0..d {
        let col: Vec<f64> = rows.iter().map(|r| r[j]).collect();
        let m = descriptive::mean(&col);
        let sd = descriptive::std_dev(&col, 0);
        let scale = if sd > 0.0 { sd } else { 1.0 };
        for r in out.iter_mut() {
            r[j] = (r[j] - m) / scale;
        }
    }
    out
}

// ---------------------------------------------------------------------
//  Gaussian mixture
// ---------------------------------------------------------------------

/// Gaussian mixture with diagonal covariances, fitted by EM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagonalGmm {
    pub weights: Vec<f64>,
    pub means: Vec<Vec<f64>>,
    pub variances: Vec<Vec<f64>>,
    pub n_iter: usize,
    pub converged: bool,
}

impl DiagonalGmm {
    pub fn k(&self) -> usize {
        self.weights.len()
    }

    /// k-means initialisation followed by EM.
    pub fn fit(x: &[Vec<f64>], k: usize, cfg: &ClusteringConfig, seed: u64) -> Result<Self> {
        let n = x.len();
        if k == 0 || n < k {
            return Err(AnalysisError::InsufficientData {
                context: format!("mixture with {k} components"),
                needed: k.max(1),
                got: n,
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let labels = kmeans(x, k, cfg.max_iter, &mut rng);
        let mut resp = vec![vec![0.0; k]; n];
        for (r, &l) in resp.iter_mut().zip(&labels) {
            r[l] = 1.0;
        }
        let mut gmm = Self::m_step(x, &resp, cfg.reg_covar);

        let mut lower_bound = f64::NEG_INFINITY;
        for iter in 1..=cfg.max_iter {
            let prev = lower_bound;
            let (norm, log_resp) = gmm.e_step(x);
            for (r, lr) in resp.iter_mut().zip(&log_resp) {
                for (v, l) in r.iter_mut().zip(lr) {
                    *v = l.exp();
                }
            }
            let (weights, means, variances) = {
                let next = Self::m_step(x, &resp, cfg.reg_covar);
                (next.weights, next.means, next.variances)
            };
            gmm.weights = weights;
            gmm.means = means;
            gmm.variances = variances;
            gmm.n_iter = iter;
            lower_bound = norm.iter().sum::<f64>() / n as f64;
            if (lower_bound - prev).abs() < cfg.tol {
                gmm.converged = true;
                break;
            }
        }
        if !gmm.converged {
            warn!(k, iterations = gmm.n_iter, "mixture did not converge");
        }
        Ok(gmm)
    }

    fn m_step(x: &[Vec<f64>], resp: &[Vec<f64>], reg_covar: f64) -> Self {
        let n = x.len();
        let k = resp.first().map_or(0, Vec::len);
        let d = x.first().map_or(0, Vec::len);
        let mut nk = vec![10.0 * f64::EPSILON; k];
        let mut means = vec![vec![0.0; d]; k];
        for (row, r) in x.iter().zip(resp) {
            for c in 0..k {
                nk[c] += r[c];
                for j in 0..d {
                    means[c][j] += r[c] * row[j];
                }
            }
        }
        for c in 0..k {
            for j in 0..d {
                means[c][j] /= nk[c];
            }
        }
        let mut variances = vec![vec![0.0; d]; k];
        for (row, r) in x.iter().zip(resp) {
            for c in 0..k {
                for j in 0..d {
                    variances[c][j] += r[c] * (row[j] - means[c][j]).powi(2);
                }
            }
        }
        for c in 0..k {
            for j in 0..d {
                variances[c][j] = variances[c][j] / nk[c] + reg_covar;
            }
        }
        Self {
            weights: nk.iter().map(|v| v / n as f64).collect(),
            means,
            variances,
            n_iter: 0,
            converged: false,
        }
    }

    /// `log w_c + log N(x | c)` per component.
    fn weighted_log_prob(&self, row: &[f64]) -> Vec<f64> {
        let d = row.len() as f64;
        (0..self.k())
            .map(|c| {
                let mut acc = d * (2.0 * PI).ln();
                for (j, v) in row.iter().enumerate() {
                    let var = self.variances[c][j];
                    acc += var.ln() + (v - self.means[c][j]).powi(2) / var;
                }
                self.weights[c].ln() - 0.5 * acc
            })
            .collect()
    }

    /// Per-row log normaliser and log responsibilities.
    fn e_step(&self, x: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
        x.iter()
            .map(|row| {
                let lp = self.weighted_log_prob(row);
                let norm = log_sum_exp(&lp);
                let resp = lp.iter().map(|v| v - norm).collect();
                (norm, resp)
            })
            .unzip()
    }

    pub fn log_likelihood(&self, x: &[Vec<f64>]) -> f64 {
        x.iter().map(|row| log_sum_exp(&self.weighted_log_prob(row))).sum()
    }

    pub fn n_parameters(&self) -> usize {
        let k = self.k();
        let d = self.means.first().map_or(0, Vec::len);
        2 * k * d + k - 1
    }

    pub fn bic(&self, x: &[Vec<f64>]) -> f64 {
        -2.0 * self.log_likelihood(x) + self.n_parameters() as f64 * (x.len() as f64).ln()
    }

    /// Hard labels by maximum posterior.
    pub fn predict(&self, x: &[Vec<f64>]) -> Vec<usize> {
        x.iter()
            .map(|row| argmax(&self.weighted_log_prob(row)))
            .collect()
    }
}

fn log_sum_exp(v: &[f64]) -> f64 {
    let m = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    m + v.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

fn argmax(v: &[f64]) -> usize {
    let mut best = 0;
    for (i, x) in v.iter().enumerate() {
        if *x > v[best] {
            best = i;
        }
    }
    best
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Lloyd's k-means from a k-means++ seeding; returns labels.
fn kmeans(x: &[Vec<f64>], k: usize, max_iter: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = x.len();
    let mut centers: Vec<Vec<f64>> = vec![x[rng.gen_range(0..n)].clone()];
    while centers.len() < k {
        let d2: Vec<f64> = x
            .iter()
            .map(|row| {
                centers
                    .iter()
                    .map(|c| sq_dist(row, c))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = d2.iter().sum();
        let next = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut pick = n - 1;
            for (i, w) in d2.iter().enumerate() {
                if target < *w {
                    pick = i;
                    break;
                }
                target -= w;
            }
            pick
        } else {
            rng.gen_range(0..n)
        };
        centers.push(x[next].clone());
    }

    let mut labels = vec![0usize; n];
    for _ in 0..max_iter {
        let mut changed = false;
        for (i, row) in x.iter().enumerate() {
            let dists: Vec<f64> = centers.iter().map(|c| -sq_dist(row, c)).collect();
            let best = argmax(&dists);
            if best != labels[i] {
                labels[i] = best;
                changed = true;
            }
        }
        for (c, center) in centers.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = x.iter().zip(&labels).filter(|(_, l)| **l == c).map(|(r, _)| r).collect();
            if members.is_empty() {
                continue;
            }
            for j in 0..center.len() {
                center[j] = members.iter().map(|m| m[j]).sum::<f64>() / members.len() as f64;
            }
        }
        if !changed {
            break;
        }
    }
    labels
}

// ---------------------------------------------------------------------
//  Validation metrics
// ---------------------------------------------------------------------

/// Mean silhouette (Euclidean). `NaN` unless `2 <= distinct labels < n`;
/// members of singleton clusters score 0.
pub fn silhouette(x: &[Vec<f64>], labels: &[usize]) -> f64 {
    let n = x.len();
    let mut distinct: Vec<usize> = labels.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < 2 || distinct.len() >= n {
        return f64::NAN;
    }
    let mut total = 0.0;
    for i in 0..n {
        let mut sums: HashMap<usize, (f64, usize)> = HashMap::new();
        for j in 0..n {
            if i == j {
                continue;
            }
            let e = sums.entry(labels[j]).or_insert((0.0, 0));
            e.0 += sq_dist(&x[i], &x[j]).sqrt();
            e.1 += 1;
        }
        let own = sums.get(&labels[i]).copied();
        let Some((a_sum, a_n)) = own.filter(|(_, c)| *c > 0) else {
            continue;
        };
        let a = a_sum / a_n as f64;
        let b = sums
            .iter()
            .filter(|(l, _)| **l != labels[i])
            .map(|(_, (s, c))| s / *c as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    total / n as f64
}

/// Minimum-cost assignment for a square cost matrix; `result[row] = col`.
pub fn hungarian(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    // 1-based potentials formulation.
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];
    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }
    let mut assignment = vec![0usize; n];
    for j in 1..=n {
        if p[j] > 0 {
            assignment[p[j] - 1] = j - 1;
        }
    }
    assignment
}

/// Jaccard overlap of each base cluster with its matched subsample cluster.
fn matched_jaccard(base: &[usize], sub: &[usize], k: usize) -> Vec<f64> {
    let mut conf = vec![vec![0usize; k]; k];
    for (&b, &s) in base.iter().zip(sub) {
        if b < k && s < k {
            conf[b][s] += 1;
        }
    }
    let max = conf.iter().flatten().copied().max().unwrap_or(0);
    let cost: Vec<Vec<f64>> = conf
        .iter()
        .map(|r| r.iter().map(|&c| (max - c) as f64).collect())
        .collect();
    let assignment = hungarian(&cost);
    (0..k)
        .map(|i| {
            let j = assignment[i];
            let inter = conf[i][j];
            let base_size: usize = conf[i].iter().sum();
            let sub_size: usize = conf.iter().map(|r| r[j]).sum();
            let union = base_size + sub_size - inter;
            if union > 0 {
                inter as f64 / union as f64
            } else {
                0.0
            }
        })
        .collect()
}

/// Mean matched Jaccard per base cluster across subsample refits.
pub fn bootstrap_jaccard(x: &[Vec<f64>], base: &[usize], k: usize, cfg: &ClusteringConfig) -> Vec<f64> {
    let n = x.len();
    let m = (n as f64 * cfg.subsample_fraction).floor() as usize;
    if m < k.max(2) || cfg.bootstrap_resamples == 0 {
        warn!(n, subsample = m, k, "subsample too small for stability estimate");
        return vec![f64::NAN; k];
    }
    let mut master = StdRng::seed_from_u64(cfg.bootstrap_seed);
    let seeds: Vec<u64> = (0..cfg.bootstrap_resamples).map(|_| master.gen()).collect();

    let runs: Vec<Option<Vec<f64>>> = seeds
        .into_par_iter()
        .map(|seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let idx = index::sample(&mut rng, n, m).into_vec();
            let sub: Vec<Vec<f64>> = idx.iter().map(|&i| x[i].clone()).collect();
            let gmm = DiagonalGmm::fit(&sub, k, cfg, rng.gen()).ok()?;
            let sub_labels = gmm.predict(&sub);
            let base_labels: Vec<usize> = idx.iter().map(|&i| base[i]).collect();
            Some(matched_jaccard(&base_labels, &sub_labels, k))
        })
        .collect();

    let ok: Vec<&Vec<f64>> = runs.iter().flatten().collect();
    if ok.len() < runs.len() {
        warn!(failed = runs.len() - ok.len(), "some stability refits failed");
    }
    (0..k)
        .map(|c| {
            if ok.is_empty() {
                f64::NAN
            } else {
                ok.iter().map(|r| r[c]).sum::<f64>() / ok.len() as f64
            }
        })
        .collect()
}

// ---------------------------------------------------------------------
//  Stage
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ClusterResult {
    pub features: SlopeFeatures,
    pub excluded: usize,
    pub k: usize,
    /// `(k, BIC)` for every candidate; `NaN` when `k` exceeded the sample.
    pub bic: Vec<(usize, f64)>,
    pub labels: Vec<usize>,
    pub sizes: Vec<usize>,
    pub silhouette: f64,
    pub jaccard: Vec<f64>,
}

pub fn cluster_participants(panel: &Panel, blocks: &[String], cfg: &ClusteringConfig) -> Result<ClusterResult> {
    cfg.validate()?;
    let all = slope_features(panel, blocks);
    let features = all.complete();
    let excluded = all.ids.len() - features.ids.len();
    if excluded > 0 {
        warn!(excluded, "participants without a full slope profile left out of clustering");
    }
    let n = features.rows.len();
    if n < 2 {
        return Err(AnalysisError::InsufficientData {
            context: "clustering participants".to_string(),
            needed: 2,
            got: n,
        });
    }
    let z = standardize(&features.rows);

    let mut bic = Vec::new();
    let mut best: Option<(f64, DiagonalGmm)> = None;
    for k in cfg.k_min..=cfg.k_max {
        if k > n {
            warn!(k, n, "more components than participants; skipped");
            bic.push((k, f64::NAN));
            continue;
        }
        let gmm = DiagonalGmm::fit(&z, k, cfg, cfg.gmm_seed)?;
        let score = gmm.bic(&z);
        bic.push((k, score));
        if best.as_ref().map_or(true, |(b, _)| score < *b) {
            best = Some((score, gmm));
        }
    }
    let Some((_, gmm)) = best else {
        return Err(AnalysisError::InsufficientData {
            context: "clustering components".to_string(),
            needed: cfg.k_min,
            got: n,
        });
    };
    let k = gmm.k();
    let labels = gmm.predict(&z);
    let mut sizes = vec![0usize; k];
    for &l in &labels {
        sizes[l] += 1;
    }
    let silhouette = if k > 1 { silhouette(&z, &labels) } else { f64::NAN };
    let jaccard = bootstrap_jaccard(&z, &labels, k, cfg);

    info!(
        participants = n,
        excluded,
        k,
        silhouette,
        sizes = ?sizes,
        "clustering finished"
    );
    Ok(ClusterResult {
        features,
        excluded,
        k,
        bic,
        labels,
        sizes,
        silhouette,
        jaccard,
    })
}

impl ClusterResult {
    pub fn assignments(&self) -> ClusterAssignments {
        ClusterAssignments {
            ids: self.features.ids.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut headers = vec!["$k$".to_string()];
        headers.extend(self.bic.iter().map(|(k, _)| format!("BIC($k$={k})")));
        headers.push("Silhouette".into());
        for c in 0..self.k {
            headers.push(format!("Cluster {c} size"));
        }
        for c in 0..self.k {
            headers.push(format!("Jaccard C{c}"));
        }
        let refs: Vec<&str> = headers.iter().map(String::as_str).collect();
        let mut t = ReportTable::new(caption, label, PRECISION_STRUCTURE, &refs);

        let mut row = vec![Cell::count(self.k)];
        row.extend(self.bic.iter().map(|(_, b)| Cell::from(*b)));
        row.push(self.silhouette.into());
        row.extend(self.sizes.iter().map(|s| Cell::count(*s)));
        row.extend(self.jaccard.iter().map(|j| Cell::from(*j)));
        t.push_row(row);
        t
    }
}

/// `participant_id -> cluster` labels shared with the moderation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignments {
    pub ids: Vec<String>,
    pub labels: Vec<usize>,
}

impl ClusterAssignments {
    pub fn lookup(&self) -> HashMap<&str, usize> {
        self.ids.iter().map(String::as_str).zip(self.labels.iter().copied()).collect()
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let labels = self.labels.iter().map(|&l| l as f64).collect();
        NumericFrame::new(self.ids.clone(), vec![CLUSTER_COLUMN.to_string()], vec![labels])?
            .write_csv(path, PARTICIPANT)
    }

    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self> {
        let table = Table::read(path, &ReadOptions::default())?;
        let id = table.column_index(PARTICIPANT)?;
        let cluster = table.column_index(CLUSTER_COLUMN)?;
        let mut ids = Vec::with_capacity(table.len());
        let mut labels = Vec::with_capacity(table.len());
        for row in table.rows() {
            let label = row[cluster].trim().parse::<usize>().map_err(|_| {
                AnalysisError::invalid_config(format!("bad cluster label {:?}", row[cluster]))
            })?;
            ids.push(row[id].trim().to_string());
            labels.push(label);
        }
        Ok(Self { ids, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f64>> {
        let mut x = Vec::new();
        for i in 0..30 {
            let jitter = ((i * 7) % 11) as f64 / 11.0 - 0.5;
            let centre = if i < 15 { -4.0 } else { 4.0 };
            x.push(vec![centre + jitter, centre - 0.3 * jitter]);
        }
        x
    }

    #[test]
    fn hungarian_finds_minimum_assignment() {
        let cost = vec![vec![4.0, 1.0, 3.0], vec![2.0, 0.0, 5.0], vec![3.0, 2.0, 2.0]];
        let a = hungarian(&cost);
        let total: f64 = a.iter().enumerate().map(|(r, &c)| cost[r][c]).sum();
        assert_eq!(total, 5.0);
        let mut cols = a.clone();
        cols.sort_unstable();
        assert_eq!(cols, vec![0, 1, 2]);
    }

    #[test]
    fn matched_jaccard_ignores_label_permutation() {
        let base = vec![0, 0, 1, 1, 1];
        let swapped = vec![1, 1, 0, 0, 0];
        assert_eq!(matched_jaccard(&base, &swapped, 2), vec![1.0, 1.0]);
    }

    #[test]
    fn bic_prefers_two_components_for_two_blobs() {
        let x = two_blobs();
        let cfg = ClusteringConfig::default();
        let one = DiagonalGmm::fit(&x, 1, &cfg, 1).unwrap();
        let two = DiagonalGmm::fit(&x, 2, &cfg, 1).unwrap();
        assert!(two.bic(&x) < one.bic(&x));
        assert_eq!(two.n_parameters(), 9);
        let labels = two.predict(&x);
        assert!(labels[..15].iter().all(|l| *l == labels[0]));
        assert!(labels[15..].iter().all(|l| *l != labels[0]));
        assert!(silhouette(&x, &labels) > 0.8);
    }

    #[test]
    fn silhouette_is_undefined_for_one_cluster() {
        let x = two_blobs();
        assert!(silhouette(&x, &vec![0; x.len()]).is_nan());
    }

    #[test]
    fn bootstrap_is_stable_and_deterministic() {
        let x = two_blobs();
        let labels: Vec<usize> = (0..30).map(|i| usize::from(i >= 15)).collect();
        let cfg = ClusteringConfig {
            bootstrap_resamples: 20,
            ..ClusteringConfig::default()
        };
        let a = bootstrap_jaccard(&x, &labels, 2, &cfg);
        let b = bootstrap_jaccard(&x, &labels, 2, &cfg);
        assert_eq!(a, b);
        assert!(a.iter().all(|j| *j > 0.95), "{a:?}");
    }

    #[test]
    fn standardize_centres_constant_columns() {
        let z = standardize(&[vec![1.0, 5.0], vec![3.0, 5.0]]);
        assert_eq!(z, vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
    }
}

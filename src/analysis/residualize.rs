//! Response-style correction: residualise every multi-block item on the
//! first principal component of the item set, then re-fit the echo model.

use std::collections::HashMap;
use std::path::Path;

use nalgebra::DMatrix;
use tracing::{info, warn};

use crate::analysis::echo::{echo_by_block, EchoTable};
use crate::catalog::Catalog;
use crate::config::BlockMap;
use crate::error::{AnalysisError, Result};
use crate::panel::{BaselineTable, Panel, PARTICIPANT};
use crate::stats::descriptive;
use crate::stats::reliability::principal_axes;
use crate::stats::RegressionConfig;
use crate::table::{NumericFrame, ReadOptions, Table};

pub const PC1_COLUMN: &str = "PC1";

/// Minimum present values for an item to be residualised.
pub const MIN_ITEM_OBSERVATIONS: usize = 3;

/// First-component score per participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Pc1Scores {
    pub ids: Vec<String>,
    pub scores: Vec<f64>,
}

impl Pc1Scores {
    /// Scores from the z-scored, mean-imputed items: projection on the
    /// leading eigenvector of their correlation matrix, oriented so the
    /// loadings sum to a non-negative value.
    pub fn compute(frame: &NumericFrame, items: &[String]) -> Result<Self> {
        let n = frame.len();
        let z: Vec<Vec<f64>> = items
            .iter()
            .filter_map(|name| frame.column(name))
            .map(|c| {
                descriptive::zscore(c)
                    .into_iter()
                    .map(|v| if v.is_finite() { v } else { 0.0 })
                    .collect::<Vec<f64>>()
            })
            .filter(|c| c.iter().any(|v| *v != 0.0))
            .collect();
        if n < 2 || z.is_empty() {
            return Err(AnalysisError::InsufficientData {
                context: "PC1 scores".to_string(),
                needed: 2,
                got: n.min(z.len()),
            });
        }

        let x = DMatrix::from_fn(n, z.len(), |r, c| z[c][r]);
        let corr = (x.transpose() * &x) / (n as f64 - 1.0);
        let (_, vectors) = principal_axes(corr);
        let mut v1 = vectors.column(0).into_owned();
        if v1.sum() < 0.0 {
            v1.neg_mut();
        }
        let scores = (&x * v1).iter().copied().collect();
        Ok(Self {
            ids: frame.ids().to_vec(),
            scores,
        })
    }

    /// Read `participant_id,PC1` (the id column may also carry the study's
    /// participant column name).
    pub fn read_csv(path: impl AsRef<Path>, participant_column: &str) -> Result<Self> {
        let table = Table::read(path, &ReadOptions::default())?;
        let id = table
            .find_column(PARTICIPANT)
            .or_else(|| table.find_column(participant_column))
            .ok_or_else(|| AnalysisError::missing_column(PARTICIPANT))?;
        let pc1 = table.column_index(PC1_COLUMN)?;
        Ok(Self {
            ids: table.text(id).map(|s| s.trim().to_string()).collect(),
            scores: table.numeric(pc1),
        })
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        NumericFrame::new(
            self.ids.clone(),
            vec![PC1_COLUMN.to_string()],
            vec![self.scores.clone()],
        )?
        .write_csv(path, PARTICIPANT)
    }
}

/// Replace each item by its residual from `item ~ 1 + PC1`.
///
/// Participants are inner-joined with `pc1` by id. Each item is fitted on
/// its own present rows; an item with fewer than
/// [`MIN_ITEM_OBSERVATIONS`] becomes entirely missing.
pub fn residualize(frame: &NumericFrame, items: &[String], pc1: &Pc1Scores) -> Result<NumericFrame> {
    let lookup: HashMap<&str, f64> = pc1
        .ids
        .iter()
        .map(String::as_str)
        .zip(pc1.scores.iter().copied())
        .filter(|(_, s)| s.is_finite())
        .collect();
    let joined: Vec<usize> = (0..frame.len())
        .filter(|&r| lookup.contains_key(frame.ids()[r].as_str()))
        .collect();
    if joined.len() < frame.len() {
        warn!(
            dropped = frame.len() - joined.len(),
            "participants without a PC1 score left out of residualisation"
        );
    }
    let frame = frame.select_rows(&joined);
    let x: Vec<f64> = frame.ids().iter().map(|id| lookup[id.as_str()]).collect();

    let mut columns = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    for name in items {
        let y = frame.require(name)?;
        let present: Vec<usize> = (0..y.len()).filter(|&i| y[i].is_finite()).collect();
        if present.len() < MIN_ITEM_OBSERVATIONS {
            warn!(item = %name, present = present.len(), "too few values to residualise");
            skipped += 1;
            columns.push(vec![f64::NAN; y.len()]);
            continue;
        }
        let xs: Vec<f64> = present.iter().map(|&i| x[i]).collect();
        let ys: Vec<f64> = present.iter().map(|&i| y[i]).collect();
        let (intercept, slope) = line_fit(&xs, &ys);
        columns.push(
            y.iter()
                .zip(&x)
                .map(|(yi, xi)| yi - (intercept + slope * xi))
                .collect(),
        );
    }
    info!(items = items.len(), skipped, participants = frame.len(), "items residualised");
    frame.with_columns(items.to_vec(), columns)
}

/// Least-squares line; a constant predictor gives slope 0.
fn line_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|v| (v - mx).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let slope = if sxx > f64::EPSILON { sxy / sxx } else { 0.0 };
    (my - slope * mx, slope)
}

/// Artifacts of the residualised re-fit.
#[derive(Debug, Clone)]
pub struct ResidualOutcome {
    pub pc1: Pc1Scores,
    pub residuals: NumericFrame,
    pub panel: Panel,
    pub echo: EchoTable,
}

/// Residualise every column of `items` on PC1 and re-fit the per-block echo
/// model on the mapped subset.
///
/// `items` carries the full detected multi-block item set, so PC1 does not
/// depend on how much of it the block map covers.
pub fn residualized_echo(
    items: &NumericFrame,
    pc1: Option<Pc1Scores>,
    baseline: &BaselineTable,
    blocks: &BlockMap,
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<ResidualOutcome> {
    let names = items.names().to_vec();
    let pc1 = match pc1 {
        Some(p) => p,
        None => Pc1Scores::compute(items, &names)?,
    };
    let residuals = residualize(items, &names, &pc1)?;
    let panel = Panel::build(&residuals, baseline, blocks, catalog);
    let echo = echo_by_block(&panel, &blocks.block_ids(), catalog, cfg)?;
    Ok(ResidualOutcome {
        pc1,
        residuals,
        panel,
        echo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> NumericFrame {
        let ids: Vec<String> = (0..12).map(|i| format!("p{i}")).collect();
        let style: Vec<f64> = (0..12).map(|i| ((i * 5) % 12) as f64 - 5.5).collect();
        let a: Vec<f64> = style
            .iter()
            .enumerate()
            .map(|(i, s)| 50.0 + 3.0 * s + (i % 3) as f64)
            .collect();
        let mut b: Vec<f64> = style
            .iter()
            .enumerate()
            .map(|(i, s)| 40.0 + 2.0 * s - (i % 4) as f64)
            .collect();
        b[3] = f64::NAN;
        let sparse = vec![f64::NAN; 12];
        NumericFrame::new(
            ids,
            vec!["a".into(), "b".into(), "sparse".into()],
            vec![a, b, sparse],
        )
        .unwrap()
    }

    #[test]
    fn residuals_are_uncorrelated_with_pc1() {
        let f = frame();
        let items: Vec<String> = f.names().to_vec();
        let pc1 = Pc1Scores::compute(&f, &items).unwrap();
        let res = residualize(&f, &items, &pc1).unwrap();

        let a = res.column("a").unwrap();
        assert!(descriptive::covariance(a, &pc1.scores).abs() < 1e-9);

        let b = res.column("b").unwrap();
        assert!(b[3].is_nan());
        let present: Vec<usize> = (0..12).filter(|&i| i != 3).collect();
        let bx: Vec<f64> = present.iter().map(|&i| b[i]).collect();
        let px: Vec<f64> = present.iter().map(|&i| pc1.scores[i]).collect();
        assert!(descriptive::covariance(&bx, &px).abs() < 1e-9);

        assert!(res.column("sparse").unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn pc1_is_oriented_with_the_items() {
        let f = frame();
        let pc1 = Pc1Scores::compute(&f, &["a".to_string(), "b".to_string()]).unwrap();
        let a = f.column("a").unwrap();
        assert!(descriptive::covariance(a, &pc1.scores) > 0.0);
    }

    #[test]
    fn participants_without_scores_are_left_out() {
        let f = frame();
        let pc1 = Pc1Scores {
            ids: vec!["p0".into(), "p1".into(), "p2".into(), "p5".into()],
            scores: vec![1.0, -1.0, 0.5, f64::NAN],
        };
        let res = residualize(&f, &["a".to_string()], &pc1).unwrap();
        assert_eq!(res.ids(), &["p0".to_string(), "p1".to_string(), "p2".to_string()]);
    }
}

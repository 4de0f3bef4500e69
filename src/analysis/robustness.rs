//! Leave-one-block-out and leave-one-pair-out re-estimation of the pooled
//! echo slope (pair and block fixed effects).

use serde::Serialize;
use tracing::info;

use crate::analysis::echo::{fit_echo, EchoEffects};
use crate::analysis::{skip_underdetermined, FitStatus};
use crate::catalog::Catalog;
use crate::error::Result;
use crate::panel::{Panel, PanelRow, PHASE_I};
use crate::report::{Cell, ReportTable, PRECISION_SLOPES};
use crate::stats::{Estimate, RegressionConfig};

#[derive(Debug, Clone, Serialize)]
pub struct OmissionRow {
    pub omitted: String,
    pub slope: Estimate,
    /// Change from the full-panel slope.
    pub delta: f64,
    pub n_obs: usize,
    pub status: FitStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveOneOut {
    pub unit: &'static str,
    pub full: Estimate,
    pub rows: Vec<OmissionRow>,
}

impl LeaveOneOut {
    pub fn max_abs_delta(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.delta.abs())
            .filter(|d| d.is_finite())
            .fold(0.0, f64::max)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OmissionRow> {
        self.rows.iter().filter(|r| !r.status.is_ok())
    }

    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let header = format!("Omitted {}", self.unit);
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_SLOPES,
            &[header.as_str(), "$\\beta$", "CI lo", "CI hi", "$p$", "$\\Delta\\beta$", "Status"],
        );
        for row in &self.rows {
            t.push_row(vec![
                Cell::text(&row.omitted),
                row.slope.estimate.into(),
                row.slope.ci_lo.into(),
                row.slope.ci_hi.into(),
                row.slope.p.into(),
                row.delta.into(),
                Cell::text(row.status.label()),
            ]);
        }
        t
    }
}

/// Pooled slope on the whole panel.
pub fn overall_slope(panel: &Panel, catalog: &Catalog, cfg: &RegressionConfig) -> Result<Estimate> {
    fit_echo(panel, "overall echo", EchoEffects::PAIR_AND_BLOCK, catalog, cfg)?.coefficient(PHASE_I)
}

fn leave_one_out(
    panel: &Panel,
    unit: &'static str,
    units: Vec<String>,
    key: impl Fn(&PanelRow) -> String,
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<LeaveOneOut> {
    let full = overall_slope(panel, catalog, cfg)?;
    let mut rows = Vec::with_capacity(units.len());
    for omitted in units {
        let sub = panel.filter(|r| key(r) != omitted && r.is_complete());
        let label = format!("omit {unit} {omitted}");
        let fit = fit_echo(&sub, &label, EchoEffects::PAIR_AND_BLOCK, catalog, cfg)
            .and_then(|f| f.coefficient(PHASE_I));
        let (slope, status) = match skip_underdetermined(fit, &label)? {
            Ok(est) => (est, FitStatus::Ok),
            Err(status) => (Estimate::undefined(), status),
        };
        rows.push(OmissionRow {
            omitted,
            delta: slope.estimate - full.estimate,
            slope,
            n_obs: sub.len(),
            status,
        });
    }
    let out = LeaveOneOut { unit, full, rows };
    info!(
        unit,
        refits = out.rows.len(),
        failed = out.failures().count(),
        max_abs_delta = out.max_abs_delta(),
        "leave-one-out finished"
    );
    Ok(out)
}

/// Refit omitting each block in turn (sorted block ids).
pub fn leave_one_block_out(panel: &Panel, catalog: &Catalog, cfg: &RegressionConfig) -> Result<LeaveOneOut> {
    let mut blocks = panel.blocks();
    blocks.sort();
    leave_one_out(panel, "block", blocks, |r| r.block.clone(), catalog, cfg)
}

/// Refit omitting each pair in turn (sorted pair names).
pub fn leave_one_pair_out(panel: &Panel, catalog: &Catalog, cfg: &RegressionConfig) -> Result<LeaveOneOut> {
    let mut pairs: Vec<String> = panel.pairs().into_iter().map(|p| catalog.pair_name(p)).collect();
    pairs.sort();
    leave_one_out(panel, "pair", pairs, |r| catalog.pair_name(r.pair), catalog, cfg)
}

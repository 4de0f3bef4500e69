//! The echo model: block rating regressed on the baseline rating.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use crate::analysis::{skip_underdetermined, FitStatus};
use crate::catalog::Catalog;
use crate::error::Result;
use crate::panel::{Panel, PHASE_I};
use crate::report::{Cell, ReportTable, PRECISION_SLOPES};
use crate::stats::{benjamini_hochberg, ClusteredFit, DesignBuilder, Estimate, RegressionConfig};

/// Fixed effects added to `PhaseII ~ PhaseI`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoEffects {
    pub pair: bool,
    pub block: bool,
}

impl EchoEffects {
    pub const PAIR: Self = Self {
        pair: true,
        block: false,
    };
    pub const PAIR_AND_BLOCK: Self = Self {
        pair: true,
        block: true,
    };
}

/// Fit `PhaseII ~ PhaseI (+ FE)` with participant-clustered SEs.
pub fn fit_echo(
    panel: &Panel,
    label: &str,
    effects: EchoEffects,
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<ClusteredFit> {
    let rows = panel.rows();
    let y = rows.iter().map(|r| r.phase2).collect();
    let groups = rows.iter().map(|r| r.participant_id.clone()).collect();
    let mut builder = DesignBuilder::new(label, y, groups)
        .intercept()
        .numeric(PHASE_I, rows.iter().map(|r| r.phase1).collect());
    if effects.pair {
        builder = builder.indicators("pair", rows.iter().map(|r| catalog.pair_name(r.pair)).collect());
    }
    if effects.block {
        builder = builder.indicators("block", rows.iter().map(|r| r.block.clone()).collect());
    }
    builder.fit(cfg)
}

#[derive(Debug, Clone, Serialize)]
pub struct EchoRow {
    pub block: String,
    pub slope: Estimate,
    pub q: f64,
    pub rejected: bool,
    pub r: f64,
    pub n_obs: usize,
    pub n_participants: usize,
    pub status: FitStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct EchoTable {
    pub rows: Vec<EchoRow>,
}

/// Per-block echo slope with pair fixed effects, BH-adjusted over the
/// configured block family.
pub fn echo_by_block(
    panel: &Panel,
    blocks: &[String],
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<EchoTable> {
    let mut rows = Vec::with_capacity(blocks.len());
    for block in blocks {
        let sub = panel.block(block).filter(|r| r.is_complete());
        let n_participants = sub
            .rows()
            .iter()
            .map(|r| r.participant_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let fit = fit_echo(&sub, &format!("echo {block}"), EchoEffects::PAIR, catalog, cfg)
            .and_then(|f| f.coefficient(PHASE_I));
        let (slope, status) = match skip_underdetermined(fit, block)? {
            Ok(est) => (est, FitStatus::Ok),
            Err(status) => (Estimate::undefined(), status),
        };
        rows.push(EchoRow {
            block: block.clone(),
            r: slope.effect_size_r(),
            slope,
            q: f64::NAN,
            rejected: false,
            n_obs: sub.len(),
            n_participants,
            status,
        });
    }

    let p: Vec<f64> = rows.iter().map(|r| r.slope.p).collect();
    let fdr = benjamini_hochberg(&p, blocks.len())?;
    for (row, (q, rej)) in rows.iter_mut().zip(fdr.q.into_iter().zip(fdr.rejected)) {
        row.q = q;
        row.rejected = rej;
    }
    info!(
        blocks = rows.len(),
        fitted = rows.iter().filter(|r| r.status.is_ok()).count(),
        "echo slopes estimated"
    );
    Ok(EchoTable { rows })
}

impl EchoTable {
    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_SLOPES,
            &["Block", "$\\beta$", "SE", "CI lo", "CI hi", "$p$", "BH $q$", "$r$", "$N$"],
        );
        for row in &self.rows {
            t.push_row(vec![
                Cell::text(&row.block),
                row.slope.estimate.into(),
                row.slope.se.into(),
                row.slope.ci_lo.into(),
                row.slope.ci_hi.into(),
                row.slope.p.into(),
                row.q.into(),
                row.r.into(),
                Cell::count(row.n_obs),
            ]);
        }
        t
    }
}

//! Context moderation: one pooled model with `PhaseI x block` interactions
//! and pair fixed effects; simple slopes per block.

use serde::Serialize;
use tracing::info;

use crate::catalog::Catalog;
use crate::error::{AnalysisError, Result};
use crate::panel::{Panel, PHASE_I};
use crate::report::{Cell, ReportTable, PRECISION_SLOPES};
use crate::stats::{benjamini_hochberg, ClusteredFit, DesignBuilder, Estimate, RegressionConfig};

#[derive(Debug, Clone, Serialize)]
pub struct SimpleSlope {
    pub block: String,
    pub slope: Estimate,
    pub q: f64,
    pub rejected: bool,
    pub r: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextTable {
    pub reference: String,
    pub n_obs: usize,
    pub n_participants: usize,
    pub rows: Vec<SimpleSlope>,
}

/// Interaction term for `block` in the context model.
pub fn interaction_term(block: &str) -> String {
    format!("block_{block}:{PHASE_I}")
}

/// Fit `PhaseII ~ PhaseI + block + block:PhaseI + pair`, with the first
/// entry of `blocks` as reference level.
pub fn fit_context_model(
    panel: &Panel,
    blocks: &[String],
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<ClusteredFit> {
    let reference = blocks
        .first()
        .ok_or_else(|| AnalysisError::invalid_config("context model needs at least one block"))?;
    let rows = panel.rows();
    let design = DesignBuilder::new(
        "context interaction",
        rows.iter().map(|r| r.phase2).collect(),
        rows.iter().map(|r| r.participant_id.clone()).collect(),
    )
    .intercept()
    .numeric(PHASE_I, rows.iter().map(|r| r.phase1).collect())
    .indicators_ordered("block", rows.iter().map(|r| r.block.clone()).collect(), blocks)
    .interact("block", PHASE_I)
    .indicators("pair", rows.iter().map(|r| catalog.pair_name(r.pair)).collect())
    .build()?;

    let actual = design
        .references
        .iter()
        .find(|(prefix, _)| prefix == "block")
        .map(|(_, level)| level.as_str());
    if actual != Some(reference.as_str()) {
        return Err(AnalysisError::UnknownBlock {
            block: reference.clone(),
        });
    }
    design.fit(cfg)
}

/// Simple slope of `PhaseI` in every configured block, BH-adjusted across
/// the block family.
pub fn context_slopes(
    panel: &Panel,
    blocks: &[String],
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<ContextTable> {
    let fit = fit_context_model(panel, blocks, catalog, cfg)?;
    let mut rows = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        let slope = if i == 0 {
            fit.coefficient(PHASE_I)?
        } else {
            let term = interaction_term(block);
            fit.linear_combination(&[(PHASE_I, 1.0), (term.as_str(), 1.0)])?
        };
        rows.push(SimpleSlope {
            block: block.clone(),
            r: slope.effect_size_r(),
            slope,
            q: f64::NAN,
            rejected: false,
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
        n_obs = fit.n_obs,
        participants = fit.n_groups,
        "context simple slopes estimated"
    );
    Ok(ContextTable {
        reference: blocks[0].clone(),
        n_obs: fit.n_obs,
        n_participants: fit.n_groups,
        rows,
    })
}

impl ContextTable {
    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_SLOPES,
            &["Block", "$\\beta$", "SE", "CI lo", "CI hi", "$p$", "BH $q$", "$r$"],
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
            ]);
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSpec;
    use crate::panel::PanelRow;

    fn panel(catalog: &Catalog, slopes: &[(&str, f64)]) -> Panel {
        let mut rows = Vec::new();
        for p in 0..20 {
            for (k, &pair) in catalog.pairs().iter().take(5).enumerate() {
                for (b, (block, slope)) in slopes.iter().enumerate() {
                    let phase1 = ((p * 31 + k * 17 + b * 3) % 85) as f64 + 5.0;
                    let noise = (((p * 3 + k + b * 2) % 5) as f64 - 2.0) * 0.4;
                    rows.push(PanelRow {
                        participant_id: format!("p{p}"),
                        pair,
                        block: block.to_string(),
                        phase1,
                        phase2: 20.0 + slope * phase1 + k as f64 + noise,
                    });
                }
            }
        }
        Panel::new(rows)
    }

    #[test]
    fn simple_slopes_follow_planted_contexts() {
        let catalog = Catalog::from_spec(&CatalogSpec::default()).unwrap();
        let panel = panel(&catalog, &[("QH2", 0.8), ("QH1", 0.5), ("QH3", 0.2)]);
        let blocks: Vec<String> = ["QH1", "QH2", "QH3"].iter().map(|s| s.to_string()).collect();
        let res = context_slopes(&panel, &blocks, &catalog, &RegressionConfig::default()).unwrap();
        assert_eq!(res.reference, "QH1");
        let got: Vec<f64> = res.rows.iter().map(|r| r.slope.estimate).collect();
        for (g, want) in got.iter().zip([0.5, 0.8, 0.2]) {
            assert!((g - want).abs() < 0.02, "{g} vs {want}");
        }
        assert!(res.rows.iter().all(|r| r.q.is_finite()));
        assert_eq!(res.n_participants, 20);
    }

    #[test]
    fn missing_context_is_a_configuration_error() {
        let catalog = Catalog::from_spec(&CatalogSpec::default()).unwrap();
        let panel = panel(&catalog, &[("QH1", 0.5), ("QH2", 0.5)]);
        let blocks: Vec<String> = ["QH1", "QH2", "QH5"].iter().map(|s| s.to_string()).collect();
        let err = context_slopes(&panel, &blocks, &catalog, &RegressionConfig::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingTerm { .. }));
        assert!(err.is_configuration());

        let shifted: Vec<String> = ["QH9", "QH1"].iter().map(|s| s.to_string()).collect();
        let err = context_slopes(&panel, &shifted, &catalog, &RegressionConfig::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownBlock { .. }));
    }
}

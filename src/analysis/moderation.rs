//! Cluster moderation of the echo: per block,
//! `PhaseII ~ PhaseI + C + C:PhaseI + pair` with the lowest cluster label as
//! reference.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::clustering::ClusterAssignments;
use crate::analysis::{skip_underdetermined, FitStatus};
use crate::catalog::Catalog;
use crate::error::Result;
use crate::panel::{Panel, PHASE_I};
use crate::report::{Cell, ReportTable, PRECISION_SLOPES};
use crate::stats::{benjamini_hochberg, ClusteredFit, DesignBuilder, Estimate, RegressionConfig};

pub const CLUSTER_PREFIX: &str = "C";

/// Interaction column for `cluster` in the moderation model.
pub fn interaction_term(cluster: usize) -> String {
    format!("{CLUSTER_PREFIX}_{cluster}:{PHASE_I}")
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSlope {
    pub cluster: usize,
    pub slope: Estimate,
    pub r: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationRow {
    pub block: String,
    pub slopes: Vec<ClusterSlope>,
    /// Test that every `C_c:PhaseI` term is zero.
    pub p_interaction: f64,
    pub q: f64,
    pub rejected: bool,
    pub n_obs: usize,
    pub n_participants: usize,
    pub status: FitStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationTable {
    pub clusters: Vec<usize>,
    pub rows: Vec<ModerationRow>,
}

struct BlockFit {
    fit: ClusteredFit,
    reference: Option<usize>,
}

fn fit_block(panel: &Panel, block: &str, order: &[String], catalog: &Catalog, cfg: &RegressionConfig, labels: &[String]) -> Result<BlockFit> {
    let rows = panel.rows();
    let design = DesignBuilder::new(
        format!("cluster moderation {block}"),
        rows.iter().map(|r| r.phase2).collect(),
        rows.iter().map(|r| r.participant_id.clone()).collect(),
    )
    .intercept()
    .numeric(PHASE_I, rows.iter().map(|r| r.phase1).collect())
    .indicators_ordered(CLUSTER_PREFIX, labels.to_vec(), order)
    .interact(CLUSTER_PREFIX, PHASE_I)
    .indicators("pair", rows.iter().map(|r| catalog.pair_name(r.pair)).collect())
    .build()?;
    let reference = design
        .references
        .iter()
        .find(|(prefix, _)| prefix == CLUSTER_PREFIX)
        .and_then(|(_, level)| level.parse().ok());
    Ok(BlockFit {
        fit: design.fit(cfg)?,
        reference,
    })
}

/// Per-cluster echo slopes in every block of `blocks`, with the moderation
/// test BH-adjusted across the block family. Panel rows of participants
/// without a cluster label are left out.
pub fn cluster_moderation(
    panel: &Panel,
    assignments: &ClusterAssignments,
    blocks: &[String],
    catalog: &Catalog,
    cfg: &RegressionConfig,
) -> Result<ModerationTable> {
    let lookup = assignments.lookup();
    let joined = panel.filter(|r| r.is_complete() && lookup.contains_key(r.participant_id.as_str()));
    let unlabelled = panel
        .participants()
        .iter()
        .filter(|id| !lookup.contains_key(id.as_str()))
        .count();
    if unlabelled > 0 {
        warn!(participants = unlabelled, "panel participants without a cluster label left out");
    }
    let clusters: Vec<usize> = assignments.labels.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if clusters.len() < 2 {
        warn!(clusters = clusters.len(), "a single cluster cannot moderate; interaction tests undefined");
    }
    let order: Vec<String> = clusters.iter().map(usize::to_string).collect();

    let mut rows = Vec::with_capacity(blocks.len());
    for block in blocks {
        let sub = joined.block(block);
        let labels: Vec<String> = sub
            .rows()
            .iter()
            .map(|r| lookup[r.participant_id.as_str()].to_string())
            .collect();
        let n_participants = sub
            .rows()
            .iter()
            .map(|r| r.participant_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        let result = fit_block(&sub, block, &order, catalog, cfg, &labels).and_then(|bf| {
            let mut slopes = Vec::with_capacity(clusters.len());
            let mut interactions = Vec::new();
            for &c in &clusters {
                let term = interaction_term(c);
                let slope = if bf.reference == Some(c) {
                    bf.fit.coefficient(PHASE_I)?
                } else if bf.fit.has_term(&term) {
                    interactions.push(term.clone());
                    bf.fit.linear_combination(&[(PHASE_I, 1.0), (term.as_str(), 1.0)])?
                } else {
                    Estimate::undefined()
                };
                slopes.push(ClusterSlope {
                    cluster: c,
                    r: slope.effect_size_r(),
                    slope,
                });
            }
            let p = match interactions.len() {
                0 => f64::NAN,
                1 => bf.fit.coefficient(&interactions[0])?.p,
                _ => {
                    let terms: Vec<&str> = interactions.iter().map(String::as_str).collect();
                    bf.fit.joint_test(&terms)?
                }
            };
            Ok((slopes, p))
        });

        let (slopes, p_interaction, status) = match skip_underdetermined(result, block)? {
            Ok((slopes, p)) => (slopes, p, FitStatus::Ok),
            Err(status) => (
                clusters
                    .iter()
                    .map(|&c| ClusterSlope {
                        cluster: c,
                        slope: Estimate::undefined(),
                        r: f64::NAN,
                    })
                    .collect(),
                f64::NAN,
                status,
            ),
        };
        rows.push(ModerationRow {
            block: block.clone(),
            slopes,
            p_interaction,
            q: f64::NAN,
            rejected: false,
            n_obs: sub.len(),
            n_participants,
            status,
        });
    }

    let p: Vec<f64> = rows.iter().map(|r| r.p_interaction).collect();
    let fdr = benjamini_hochberg(&p, blocks.len())?;
    for (row, (q, rej)) in rows.iter_mut().zip(fdr.q.into_iter().zip(fdr.rejected)) {
        row.q = q;
        row.rejected = rej;
    }
    info!(
        blocks = rows.len(),
        clusters = clusters.len(),
        fitted = rows.iter().filter(|r| r.status.is_ok()).count(),
        "cluster moderation estimated"
    );
    Ok(ModerationTable { clusters, rows })
}

impl ModerationTable {
    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut headers = vec!["Block".to_string()];
        for c in &self.clusters {
            headers.push(format!("$\\beta$ C{c}"));
            headers.push(format!("CI C{c} lo"));
            headers.push(format!("CI C{c} hi"));
            headers.push(format!("$r$ C{c}"));
        }
        headers.push("$p$ (interaction)".into());
        headers.push("BH $q$".into());
        let refs: Vec<&str> = headers.iter().map(String::as_str).collect();
        let mut t = ReportTable::new(caption, label, PRECISION_SLOPES, &refs);
        for row in &self.rows {
            let mut cells = vec![Cell::text(&row.block)];
            for s in &row.slopes {
                cells.push(s.slope.estimate.into());
                cells.push(s.slope.ci_lo.into());
                cells.push(s.slope.ci_hi.into());
                cells.push(s.r.into());
            }
            cells.push(row.p_interaction.into());
            cells.push(row.q.into());
            t.push_row(cells);
        }
        t
    }
}

//! Stage runners: load a study's configuration and artifacts, run one
//! analysis, write its tables.
//!
//! Every stage reads and writes files only, so stages can be re-run on their
//! own. [`run_all`] chains them into one output directory:
//!
//! ```text
//! export -> clean -> panel -> echo, residualize, robustness, icc,
//!                             structure, context, cluster -> moderation,
//!                             profiles
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::agreement::{pair_agreement, AgreementTable};
use crate::analysis::clustering::{cluster_participants, ClusterAssignments, ClusterResult};
use crate::analysis::context::{context_slopes, ContextTable};
use crate::analysis::echo::{echo_by_block, EchoTable};
use crate::analysis::moderation::{cluster_moderation, ModerationTable};
use crate::analysis::profiles::{theory_profiles, ProfileAnalysis};
use crate::analysis::residualize::{residualized_echo, Pc1Scores, ResidualOutcome};
use crate::analysis::robustness::{leave_one_block_out, leave_one_pair_out, LeaveOneOut};
use crate::analysis::structure::{block_structure, StructureTable};
use crate::catalog::{Catalog, PairId};
use crate::config::{load_pairs, BlockMap, StudyConfig};
use crate::error::{AnalysisError, Result};
use crate::ingest::{
    clean_file, write_clean_artifacts, write_json, CleanArtifacts, CleanOutcome, CleanSummary, SliderSchema,
};
use crate::panel::{block_frame, BaselineTable, Panel, PARTICIPANT};
use crate::report::ReportTable;
use crate::table::{NumericFrame, ReadOptions, Table};

// =============================================================================
// Artifact names
// =============================================================================

pub const PANEL_FILE: &str = "panel_long.csv";
pub const PC1_FILE: &str = "pc1_scores.csv";
pub const RESIDUALS_FILE: &str = "clean_wide_residualised.csv";
pub const ASSIGNMENTS_FILE: &str = "cluster_assignments.csv";
pub const SIGNATURES_FILE: &str = "profile_signatures.csv";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const TABLES_DIR: &str = "tables";

/// File stem, caption and label of one result table.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub stem: &'static str,
    pub caption: &'static str,
    pub label: &'static str,
}

pub const ECHO_TABLE: TableSpec = TableSpec {
    stem: "a1_echo_by_block",
    caption: "A1 Echo slopes per judgement context; pair fixed effects; participant-clustered SEs; BH-FDR (m=5); effect-size $r$.",
    label: "tab:a1_echo",
};
pub const RESIDUAL_TABLE: TableSpec = TableSpec {
    stem: "a2_echo_postpc1",
    caption: "A2 Echo slopes after residualising Phase-II on PC1; BH-FDR (m=5); effect-size $r$.",
    label: "tab:a2_echo_postpc1",
};
pub const LOBO_TABLE: TableSpec = TableSpec {
    stem: "a3_lobo",
    caption: "A3 LOBO: slope after omitting one block (overall model).",
    label: "tab:a3_lobo",
};
pub const LOPO_TABLE: TableSpec = TableSpec {
    stem: "a3_lopo",
    caption: "A3 LOPO: slope after omitting one pair (overall model).",
    label: "tab:a3_lopo",
};
pub const ICC_TABLE: TableSpec = TableSpec {
    stem: "a4_icc",
    caption: "A4 ICC(2,1) between Phase I and mean Phase II scores per pair.",
    label: "tab:a4_icc",
};
pub const CONTEXT_TABLE: TableSpec = TableSpec {
    stem: "a5_context",
    caption: "A5: Echo slopes by judgement context (first block ref). BH-FDR (m=5); participant-clustered SEs; effect-size $r$.",
    label: "tab:a5_context",
};
pub const STRUCTURE_TABLE: TableSpec = TableSpec {
    stem: "b1_block_structure",
    caption: "Block-level internal structure (McDonald's $\\omega_{\\text{total}}$; PCA %variance).",
    label: "tab:block_structure",
};
pub const CLUSTER_TABLE: TableSpec = TableSpec {
    stem: "b2_cluster_sizes_metrics",
    caption: "B2 GMM clustering on six-slope vectors: BIC, silhouette, stability (bootstrap Jaccard).",
    label: "tab:b2_cluster_sizes_metrics",
};
pub const MODERATION_TABLE: TableSpec = TableSpec {
    stem: "b3_cluster_moderation",
    caption: "B3: Echo slopes by cluster per block; BH-FDR over five interactions.",
    label: "tab:cluster_moderation",
};
pub const PROFILE_MEANS_TABLE: TableSpec = TableSpec {
    stem: "b4_profiles_main",
    caption: "B4 Profile-only signature means (averaged across judgement contexts).",
    label: "tab:profile_main",
};
pub const PROFILE_BLOCK_TABLE: TableSpec = TableSpec {
    stem: "b4_profile_block_means",
    caption: "B4 Adjusted signature means by profile $\\times$ judgement context.",
    label: "tab:profile_block_means",
};
pub const PROFILE_SLOPES_TABLE: TableSpec = TableSpec {
    stem: "b4_profile_slopes",
    caption: "B4 Echo slopes within profiles by judgement context (signature scores).",
    label: "tab:profile_slopes",
};

/// Where result tables go, and whether a JSON copy is written next to each.
#[derive(Debug, Clone)]
pub struct TableOutput {
    pub dir: PathBuf,
    pub json: bool,
}

impl TableOutput {
    pub fn new(dir: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            dir: dir.into(),
            json,
        }
    }

    pub fn write(&self, spec: &TableSpec, build: impl FnOnce(&str, &str) -> ReportTable) -> Result<PathBuf> {
        let table = build(spec.caption, spec.label);
        let latex = self.dir.join(format!("{}.tex", spec.stem));
        table.write_latex(&latex)?;
        if self.json {
            table.write_json(self.dir.join(format!("{}.json", spec.stem)))?;
        }
        info!(table = spec.stem, rows = table.rows.len(), path = %latex.display(), "table written");
        Ok(latex)
    }
}

// =============================================================================
// Study inputs
// =============================================================================

/// Configuration shared by every stage.
#[derive(Debug, Clone)]
pub struct Study {
    pub config: StudyConfig,
    pub catalog: Catalog,
    pub blocks: BlockMap,
    /// Pairs whose baseline rating is looked up.
    pub pairs: Vec<PairId>,
}

impl Study {
    pub fn new(config: StudyConfig, blocks: BlockMap, pairs: Option<Vec<PairId>>) -> Result<Self> {
        config.validate()?;
        let catalog = config.catalog()?;
        let pairs = pairs.unwrap_or_else(|| catalog.pairs().to_vec());
        for pair in blocks.pairs() {
            if !pairs.contains(&pair) {
                warn!(pair = %catalog.display_pair(pair), "block map uses a pair missing from the pair list");
            }
        }
        Ok(Self {
            config,
            catalog,
            blocks,
            pairs,
        })
    }

    pub fn load(config: Option<&Path>, blocks: &Path, pairs: Option<&Path>) -> Result<Self> {
        let config = match config {
            Some(path) => StudyConfig::load(path)?,
            None => StudyConfig::default(),
        };
        let catalog = config.catalog()?;
        let block_map = BlockMap::load(blocks, &catalog, &config)?;
        let pairs = pairs.map(|p| load_pairs(p, &catalog)).transpose()?;
        Self::new(config, block_map, pairs)
    }

    /// Configured block ids; the BH family for block-level tests.
    pub fn block_ids(&self) -> Vec<String> {
        self.config.block_ids()
    }

    fn id_column<'a>(&'a self, table: &Table) -> Result<&'a str> {
        if table.find_column(&self.config.participant_column).is_some() {
            Ok(&self.config.participant_column)
        } else if table.find_column(PARTICIPANT).is_some() {
            Ok(PARTICIPANT)
        } else {
            Err(AnalysisError::missing_column(self.config.participant_column.clone()))
        }
    }

    /// Mapped block columns of a cleaned wide table.
    pub fn block_frame(&self, wide: &Table) -> Result<NumericFrame> {
        block_frame(wide, self.id_column(wide)?, &self.blocks)
    }

    /// Every detected multi-block column of a cleaned wide table.
    ///
    /// Mapped columns that slider detection did not pick up are reported;
    /// they stay out of residualisation.
    pub fn schema_frame(&self, wide: &Table, schema: &SliderSchema) -> Result<NumericFrame> {
        for mapping in self.blocks.blocks() {
            let detected = schema.block_columns(&mapping.block).unwrap_or(&[]);
            let outside = mapping
                .columns()
                .filter(|c| !detected.iter().any(|d| d.as_str() == *c))
                .count();
            if outside > 0 {
                warn!(block = %mapping.block, columns = outside, "mapped columns outside the detected slider set");
            }
        }
        let present: Vec<String> = schema
            .multi_block
            .iter()
            .filter(|c| wide.find_column(c).is_some())
            .cloned()
            .collect();
        if present.len() < schema.multi_block.len() {
            warn!(
                missing = schema.multi_block.len() - present.len(),
                "detected multi-block columns absent from the cleaned table"
            );
        }
        NumericFrame::from_table(wide, self.id_column(wide)?, &present)
    }

    /// Baseline ratings from `source` when given, else from the wide table.
    pub fn baseline(&self, wide: &Table, source: Option<&Path>) -> Result<BaselineTable> {
        let owned;
        let table = match source {
            Some(path) => {
                owned = Table::read(path, &ReadOptions::default())?;
                &owned
            }
            None => wide,
        };
        let baseline = BaselineTable::from_table(
            table,
            self.id_column(table)?,
            &self.config.baseline_prefix,
            &self.pairs,
            &self.catalog,
        )?;
        info!(
            participants = baseline.participants(),
            pairs = baseline.pairs().len(),
            expected = self.pairs.len(),
            "baseline loaded"
        );
        Ok(baseline)
    }
}

pub fn read_wide(path: &Path) -> Result<Table> {
    Table::read(path, &ReadOptions::default())
}

// =============================================================================
// Stages
// =============================================================================

pub fn run_clean(study: &Study, export: &Path, opts: &ReadOptions, out_dir: &Path) -> Result<(CleanOutcome, CleanArtifacts)> {
    let outcome = clean_file(export, opts, &study.config)?;
    let paths = write_clean_artifacts(&outcome, out_dir)?;
    Ok((outcome, paths))
}

pub fn run_panel(study: &Study, wide: &Table, baseline: &BaselineTable, out: &Path) -> Result<Panel> {
    let frame = study.block_frame(wide)?;
    let panel = Panel::build(&frame, baseline, &study.blocks, &study.catalog);
    panel.write_csv(out, &study.catalog)?;
    Ok(panel)
}

pub fn run_echo(study: &Study, panel: &Panel, out: &TableOutput) -> Result<EchoTable> {
    let table = echo_by_block(panel, &study.block_ids(), &study.catalog, &study.config.regression)?;
    out.write(&ECHO_TABLE, |c, l| table.to_report(c, l))?;
    Ok(table)
}

pub fn run_residualize(
    study: &Study,
    wide: &Table,
    schema: &SliderSchema,
    baseline: &BaselineTable,
    pc1: Option<Pc1Scores>,
    out_dir: &Path,
    out: &TableOutput,
) -> Result<ResidualOutcome> {
    let items = study.schema_frame(wide, schema)?;
    let outcome = residualized_echo(&items, pc1, baseline, &study.blocks, &study.catalog, &study.config.regression)?;
    outcome.pc1.write_csv(out_dir.join(PC1_FILE))?;
    outcome
        .residuals
        .write_csv(out_dir.join(RESIDUALS_FILE), &study.config.participant_column)?;
    out.write(&RESIDUAL_TABLE, |c, l| outcome.echo.to_report(c, l))?;
    Ok(outcome)
}

pub fn run_robustness(study: &Study, panel: &Panel, out: &TableOutput) -> Result<(LeaveOneOut, LeaveOneOut)> {
    let lobo = leave_one_block_out(panel, &study.catalog, &study.config.regression)?;
    let lopo = leave_one_pair_out(panel, &study.catalog, &study.config.regression)?;
    out.write(&LOBO_TABLE, |c, l| lobo.to_report(c, l))?;
    out.write(&LOPO_TABLE, |c, l| lopo.to_report(c, l))?;
    Ok((lobo, lopo))
}

pub fn run_icc(study: &Study, wide: &Table, baseline: &BaselineTable, out: &TableOutput) -> Result<AgreementTable> {
    let frame = study.block_frame(wide)?;
    let table = pair_agreement(&frame, baseline, &study.blocks, &study.catalog);
    out.write(&ICC_TABLE, |c, l| table.to_report(c, l))?;
    Ok(table)
}

pub fn run_structure(study: &Study, wide: &Table, out: &TableOutput) -> Result<StructureTable> {
    let frame = study.block_frame(wide)?;
    let table = block_structure(&frame, &study.blocks)?;
    out.write(&STRUCTURE_TABLE, |c, l| table.to_report(c, l))?;
    Ok(table)
}

pub fn run_context(study: &Study, panel: &Panel, out: &TableOutput) -> Result<ContextTable> {
    let table = context_slopes(panel, &study.block_ids(), &study.catalog, &study.config.regression)?;
    out.write(&CONTEXT_TABLE, |c, l| table.to_report(c, l))?;
    Ok(table)
}

pub fn run_cluster(study: &Study, panel: &Panel, out_dir: &Path, out: &TableOutput) -> Result<ClusterResult> {
    let result = cluster_participants(panel, &study.block_ids(), &study.config.clustering)?;
    result.assignments().write_csv(out_dir.join(ASSIGNMENTS_FILE))?;
    out.write(&CLUSTER_TABLE, |c, l| result.to_report(c, l))?;
    Ok(result)
}

pub fn run_moderation(
    study: &Study,
    panel: &Panel,
    assignments: &ClusterAssignments,
    out: &TableOutput,
) -> Result<ModerationTable> {
    let table = cluster_moderation(panel, assignments, &study.block_ids(), &study.catalog, &study.config.regression)?;
    out.write(&MODERATION_TABLE, |c, l| table.to_report(c, l))?;
    Ok(table)
}

pub fn run_profiles(
    study: &Study,
    wide: &Table,
    baseline: &BaselineTable,
    out_dir: &Path,
    out: &TableOutput,
) -> Result<ProfileAnalysis> {
    let frame = study.block_frame(wide)?;
    let analysis = theory_profiles(
        &frame,
        baseline,
        &study.blocks,
        &study.catalog,
        study.config.min_profile_observations,
        &study.config.regression,
    )?;
    analysis
        .signatures
        .to_frame()?
        .write_csv(out_dir.join(SIGNATURES_FILE), PARTICIPANT)?;
    out.write(&PROFILE_MEANS_TABLE, |c, l| analysis.means_report(c, l))?;
    out.write(&PROFILE_BLOCK_TABLE, |c, l| analysis.block_means_report(c, l))?;
    out.write(&PROFILE_SLOPES_TABLE, |c, l| analysis.slopes_report(c, l))?;
    Ok(analysis)
}

// =============================================================================
// Full run
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub clean: CleanSummary,
    pub panel_rows: usize,
    pub panel_complete: usize,
    pub completed: Vec<String>,
    /// `(stage, reason)` for stages skipped on too little data.
    pub skipped: Vec<(String, String)>,
}

impl RunSummary {
    fn record<T>(&mut self, stage: &str, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(v) => {
                self.completed.push(stage.to_string());
                Ok(Some(v))
            }
            Err(e) if e.is_underdetermined() => {
                warn!(stage, error = %e, "stage skipped");
                self.skipped.push((stage.to_string(), e.to_string()));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Inputs of [`run_all`] besides the study.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub export: PathBuf,
    pub read: ReadOptions,
    /// Separate baseline table; the cleaned export is used when absent.
    pub baseline: Option<PathBuf>,
    /// Precomputed PC1 scores; computed from the block items when absent.
    pub pc1: Option<PathBuf>,
}

/// Every stage in dependency order into `out_dir`.
pub fn run_all(study: &Study, inputs: &RunInputs, out_dir: &Path, json: bool) -> Result<RunSummary> {
    let out = TableOutput::new(out_dir.join(TABLES_DIR), json);
    let mut summary = RunSummary::default();

    let (outcome, _) = run_clean(study, &inputs.export, &inputs.read, out_dir)?;
    summary.clean = outcome.summary.clone();
    summary.completed.push("clean".into());
    let wide = outcome.kept;
    let schema = outcome.schema;

    let baseline = study.baseline(&wide, inputs.baseline.as_deref())?;
    let panel = run_panel(study, &wide, &baseline, &out_dir.join(PANEL_FILE))?;
    summary.panel_rows = panel.len();
    summary.panel_complete = panel.complete_count();
    summary.completed.push("panel".into());

    let echo = run_echo(study, &panel, &out);
    summary.record("echo", echo)?;

    let pc1 = inputs
        .pc1
        .as_deref()
        .map(|p| Pc1Scores::read_csv(p, &study.config.participant_column))
        .transpose()?;
    let residual = run_residualize(study, &wide, &schema, &baseline, pc1, out_dir, &out);
    summary.record("residualize", residual)?;

    let robustness = run_robustness(study, &panel, &out);
    summary.record("robustness", robustness)?;

    let icc = run_icc(study, &wide, &baseline, &out);
    summary.record("icc", icc)?;

    let structure = run_structure(study, &wide, &out);
    summary.record("structure", structure)?;

    let context = run_context(study, &panel, &out);
    summary.record("context", context)?;

    let cluster = run_cluster(study, &panel, out_dir, &out);
    if let Some(result) = summary.record("cluster", cluster)? {
        let moderation = run_moderation(study, &panel, &result.assignments(), &out);
        summary.record("moderation", moderation)?;
    } else {
        summary
            .skipped
            .push(("moderation".into(), "no cluster assignments".into()));
    }

    let profiles = run_profiles(study, &wide, &baseline, out_dir, &out);
    summary.record("profiles", profiles)?;

    write_json(&out_dir.join(RUN_SUMMARY_FILE), &summary)?;
    info!(
        completed = summary.completed.len(),
        skipped = summary.skipped.len(),
        kept = summary.clean.kept,
        dropped = summary.clean.dropped,
        panel_rows = summary.panel_rows,
        "run finished"
    );
    Ok(summary)
}

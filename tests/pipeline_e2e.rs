use std::path::Path;

use value_echo::analysis::clustering::ClusterAssignments;
use value_echo::analysis::echo::echo_by_block;
use value_echo::analysis::residualize::{residualize, Pc1Scores};
use value_echo::analysis::robustness::{leave_one_block_out, leave_one_pair_out};
use value_echo::pipeline::{self, RunInputs, Study, TableOutput, PANEL_FILE, RUN_SUMMARY_FILE, TABLES_DIR};
use value_echo::stats::descriptive::covariance;
use value_echo::synthetic::{generate, SyntheticConfig, SyntheticPaths};
use value_echo::{clean, BaselineTable, BlockMap, NumericFrame, Panel, StudyConfig, Table};

struct Fixture {
    _dir: tempfile::TempDir,
    paths: SyntheticPaths,
    study: Study,
}

fn fixture(cfg: &SyntheticConfig) -> Fixture {
    let config = StudyConfig::default();
    let catalog = config.catalog().unwrap();
    let synthetic = generate(&config, &catalog, cfg).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let paths = synthetic.write(dir.path(), &catalog).unwrap();
    let study = Study::load(None, &paths.blocks, Some(paths.pairs.as_path())).unwrap();
    Fixture {
        _dir: dir,
        paths,
        study,
    }
}

fn cleaned(f: &Fixture) -> (Table, BaselineTable, Panel) {
    let raw = Table::read(&f.paths.export, &Default::default()).unwrap();
    let outcome = clean(&raw, &f.study.config).unwrap();
    let wide = outcome.kept;
    let baseline = f.study.baseline(&wide, Some(f.paths.baseline.as_path())).unwrap();
    let frame = f.study.block_frame(&wide).unwrap();
    let panel = Panel::build(&frame, &baseline, &f.study.blocks, &f.study.catalog);
    (wide, baseline, panel)
}

fn block_items(study: &Study) -> Vec<String> {
    study
        .blocks
        .blocks()
        .iter()
        .flat_map(|m| m.columns().map(str::to_string))
        .collect()
}

#[test]
fn synthetic_study_recovers_planted_echo() {
    let f = fixture(&SyntheticConfig {
        flatliners: 2,
        incomplete: 1,
        ..SyntheticConfig::default()
    });
    let (wide, _, panel) = cleaned(&f);
    assert_eq!(wide.len(), 20);
    assert_eq!(panel.len(), 20 * 5 * 15);
    assert_eq!(panel.complete_count(), panel.len());

    let table = echo_by_block(&panel, &f.study.block_ids(), &f.study.catalog, &f.study.config.regression).unwrap();
    assert_eq!(table.rows.len(), 5);
    let planted = SyntheticConfig::default().block_slopes;
    for (row, slope) in table.rows.iter().zip(planted) {
        assert!(row.status.is_ok(), "{}", row.block);
        assert!(row.slope.se.is_finite() && row.slope.se > 0.0);
        assert!(row.slope.p.is_finite());
        // Half the participants carry a +0.2 shift.
        assert!(
            (row.slope.estimate - (slope + 0.1)).abs() < 0.2,
            "{}: {} vs {}",
            row.block,
            row.slope.estimate,
            slope + 0.1
        );
        assert!(row.rejected);
    }
}

#[test]
fn residuals_are_uncorrelated_with_pc1() {
    let f = fixture(&SyntheticConfig::default());
    let (wide, _, _) = cleaned(&f);
    let frame = f.study.block_frame(&wide).unwrap();
    let items = block_items(&f.study);
    let pc1 = Pc1Scores::compute(&frame, &items).unwrap();
    let residuals = residualize(&frame, &items, &pc1).unwrap();

    let scores: Vec<f64> = residuals
        .ids()
        .iter()
        .map(|id| {
            let i = pc1.ids.iter().position(|p| p == id).unwrap();
            pc1.scores[i]
        })
        .collect();
    for name in &items {
        let column = residuals.column(name).unwrap();
        let cov = covariance(&scores, column);
        assert!(cov.abs() < 1e-8, "{name}: {cov}");
    }
}

#[test]
fn leave_one_out_slopes_stay_close_to_full_model() {
    let f = fixture(&SyntheticConfig::default());
    let (_, _, panel) = cleaned(&f);
    let cfg = &f.study.config.regression;

    let lobo = leave_one_block_out(&panel, &f.study.catalog, cfg).unwrap();
    assert_eq!(lobo.rows.len(), 5);
    assert!(lobo.failures().next().is_none());
    assert!(lobo.max_abs_delta() < 0.1, "{}", lobo.max_abs_delta());

    let lopo = leave_one_pair_out(&panel, &f.study.catalog, cfg).unwrap();
    assert_eq!(lopo.rows.len(), 15);
    assert!(lopo.max_abs_delta() < 0.1, "{}", lopo.max_abs_delta());
}

#[test]
fn residualisation_covers_every_detected_block_item() {
    let f = fixture(&SyntheticConfig::default());
    let raw = Table::read(&f.paths.export, &Default::default()).unwrap();
    let outcome = clean(&raw, &f.study.config).unwrap();
    let schema = outcome.schema;
    assert_eq!(schema.multi_block.len(), 75);

    // Map only three QH1 pairs; the other blocks stay complete.
    let partial: Vec<_> = f
        .study
        .blocks
        .blocks()
        .iter()
        .cloned()
        .map(|mut m| {
            if m.block == "QH1" {
                m.items.truncate(3);
            }
            m
        })
        .collect();
    let study = Study::new(f.study.config.clone(), BlockMap::new(partial), Some(f.study.pairs.clone())).unwrap();
    let baseline = study.baseline(&outcome.kept, Some(f.paths.baseline.as_path())).unwrap();

    let out = tempfile::tempdir().unwrap();
    let tables = TableOutput::new(out.path().join(TABLES_DIR), false);
    let res = pipeline::run_residualize(&study, &outcome.kept, &schema, &baseline, None, out.path(), &tables).unwrap();

    assert_eq!(res.residuals.names().len(), 75);
    let full = NumericFrame::from_table(&outcome.kept, &study.config.participant_column, &schema.multi_block).unwrap();
    let expected = Pc1Scores::compute(&full, &schema.multi_block).unwrap();
    assert_eq!(res.pc1.ids, expected.ids);
    for (a, b) in res.pc1.scores.iter().zip(&expected.scores) {
        assert!((a - b).abs() < 1e-9, "{a} vs {b}");
    }

    assert_eq!(res.panel.block("QH1").len(), 20 * 3);
    assert_eq!(res.panel.len(), 20 * (4 * 15 + 3));
    assert_eq!(res.echo.rows.len(), 5);
}

fn assert_table(dir: &Path, stem: &str) {
    let path = dir.join(TABLES_DIR).join(format!("{stem}.tex"));
    let body = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
    assert!(body.contains("\\begin{table}"), "{stem}");
}

#[test]
fn run_all_writes_every_artifact() {
    let f = fixture(&SyntheticConfig::default());
    let out = tempfile::tempdir().unwrap();
    let inputs = RunInputs {
        export: f.paths.export.clone(),
        baseline: Some(f.paths.baseline.clone()),
        ..RunInputs::default()
    };
    let summary = pipeline::run_all(&f.study, &inputs, out.path(), true).unwrap();

    assert_eq!(summary.clean.kept, 20);
    assert_eq!(summary.panel_rows, 1500);
    for stage in ["clean", "panel", "echo", "residualize", "robustness", "icc", "structure", "context", "profiles"] {
        assert!(summary.completed.iter().any(|s| s == stage), "{stage} not completed");
    }
    for stage in ["cluster", "moderation"] {
        assert!(summary.completed.iter().any(|s| s == stage), "{stage} not completed");
        assert!(!summary.skipped.iter().any(|(s, _)| s == stage), "{stage} skipped");
    }

    let assignments = ClusterAssignments::read_csv(out.path().join("cluster_assignments.csv")).unwrap();
    assert_eq!(assignments.ids.len(), 20);
    assert_eq!(assignments.labels.len(), 20);

    assert!(out.path().join(PANEL_FILE).exists());
    assert!(out.path().join(RUN_SUMMARY_FILE).exists());
    assert!(out.path().join("clean_wide.csv").exists());
    for stem in [
        "a1_echo_by_block",
        "a2_echo_postpc1",
        "a3_lobo",
        "a3_lopo",
        "a4_icc",
        "a5_context",
        "b1_block_structure",
        "b2_cluster_sizes_metrics",
        "b3_cluster_moderation",
        "b4_profiles_main",
        "b4_profile_block_means",
        "b4_profile_slopes",
    ] {
        assert_table(out.path(), stem);
        assert!(out.path().join(TABLES_DIR).join(format!("{stem}.json")).exists());
    }

    let raw = std::fs::read_to_string(out.path().join(RUN_SUMMARY_FILE)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["panel_rows"], 1500);
}

#[test]
fn run_all_is_reproducible() {
    let f = fixture(&SyntheticConfig::default());
    let inputs = RunInputs {
        export: f.paths.export.clone(),
        baseline: Some(f.paths.baseline.clone()),
        ..RunInputs::default()
    };
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    pipeline::run_all(&f.study, &inputs, a.path(), false).unwrap();
    pipeline::run_all(&f.study, &inputs, b.path(), false).unwrap();
    for stem in ["a1_echo_by_block", "a5_context", "b1_block_structure"] {
        let read = |d: &Path| std::fs::read_to_string(d.join(TABLES_DIR).join(format!("{stem}.tex"))).unwrap();
        assert_eq!(read(a.path()), read(b.path()), "{stem}");
    }
}

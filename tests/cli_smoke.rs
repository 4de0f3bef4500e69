use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_value-echo"))
}

fn simulate(dir: &Path) {
    let status = bin()
        .args(["--log-level", "warn", "simulate", "--flatliners", "1"])
        .arg("--out-dir")
        .arg(dir)
        .status()
        .unwrap();
    assert!(status.success());
    for file in ["export.csv", "baseline.csv", "pairs.yaml", "blocks.yaml"] {
        assert!(dir.join(file).exists(), "{file}");
    }
}

#[test]
fn simulate_then_run_writes_tables() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input");
    let out = dir.path().join("out");
    simulate(&input);

    let status = bin()
        .args(["--log-level", "warn", "--json", "run"])
        .arg("--input")
        .arg(input.join("export.csv"))
        .arg("--blocks")
        .arg(input.join("blocks.yaml"))
        .arg("--pairs")
        .arg(input.join("pairs.yaml"))
        .arg("--baseline")
        .arg(input.join("baseline.csv"))
        .arg("--out-dir")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    assert!(out.join("clean_wide.csv").exists());
    assert!(out.join("dropped_log.csv").exists());
    assert!(out.join("panel_long.csv").exists());
    assert!(out.join("tables").join("a1_echo_by_block.tex").exists());
    assert!(out.join("tables").join("a1_echo_by_block.json").exists());

    let raw = std::fs::read_to_string(out.join("run_summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(summary["clean"]["kept"], 20);
    assert_eq!(summary["clean"]["flatliner"], 1);
}

#[test]
fn stages_chain_through_files() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input");
    let out = dir.path().join("out");
    simulate(&input);

    let status = bin()
        .args(["--log-level", "warn", "clean"])
        .arg("--input")
        .arg(input.join("export.csv"))
        .arg("--out-dir")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let status = bin()
        .args(["--log-level", "warn", "residualize"])
        .arg("--clean")
        .arg(out.join("clean_wide.csv"))
        .arg("--blocks")
        .arg(input.join("blocks.yaml"))
        .arg("--baseline")
        .arg(input.join("baseline.csv"))
        .arg("--out-dir")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());
    assert!(out.join("pc1_scores.csv").exists());
    assert!(out.join("tables").join("a2_echo_postpc1.tex").exists());

    let panel = out.join("panel_long.csv");
    let status = bin()
        .args(["--log-level", "warn", "panel"])
        .arg("--clean")
        .arg(out.join("clean_wide.csv"))
        .arg("--blocks")
        .arg(input.join("blocks.yaml"))
        .arg("--baseline")
        .arg(input.join("baseline.csv"))
        .arg("--out")
        .arg(&panel)
        .status()
        .unwrap();
    assert!(status.success());

    for stage in ["echo", "context", "robustness"] {
        let status = bin()
            .args(["--log-level", "warn", stage])
            .arg("--panel")
            .arg(&panel)
            .arg("--blocks")
            .arg(input.join("blocks.yaml"))
            .arg("--out-dir")
            .arg(&out)
            .status()
            .unwrap();
        assert!(status.success(), "{stage}");
    }
    assert!(out.join("tables").join("a1_echo_by_block.tex").exists());
    assert!(out.join("tables").join("a5_context.tex").exists());
    assert!(out.join("tables").join("a3_lobo.tex").exists());
}

#[test]
fn missing_block_file_fails() {
    let dir = tempdir().unwrap();
    let output = bin()
        .args(["--log-level", "error", "echo"])
        .arg("--panel")
        .arg(dir.path().join("panel.csv"))
        .arg("--blocks")
        .arg(dir.path().join("missing.yaml"))
        .arg("--out-dir")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

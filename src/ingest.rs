//! Survey export ingestion and participant-level quality filtering.
//!
//! Produces the cleaned wide table, the rejected rows with their reasons, and
//! the [`SliderSchema`] every later stage reads column names from.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CleaningConfig, StudyConfig};
use crate::error::{AnalysisError, Result};
use crate::stats::descriptive;
use crate::table::{ensure_parent, NumericFrame, ReadOptions, Table};

pub const DROP_REASON_COLUMN: &str = "drop_reason";
/// File name of the persisted [`SliderSchema`].
pub const SCHEMA_FILE: &str = "slider_schema.json";

/// Slider columns of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockColumns {
    pub block: String,
    pub columns: Vec<String>,
}

/// Column-name contract shared by every stage after cleaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliderSchema {
    pub participant_column: String,
    /// Baseline-battery columns, sorted.
    pub baseline: Vec<String>,
    /// Multi-block columns grouped by block, in configured block order.
    pub blocks: Vec<BlockColumns>,
    /// All multi-block columns, sorted.
    pub multi_block: Vec<String>,
    /// Baseline and multi-block columns, sorted.
    pub all: Vec<String>,
    pub expected_total: usize,
    /// BLAKE3 hex digest of the raw export, when read from a file.
    #[serde(default)]
    pub source_hash: Option<String>,
}

impl SliderSchema {
    /// Detect slider columns by prefix.
    pub fn detect(headers: &[String], study: &StudyConfig) -> Self {
        let mut baseline: Vec<String> = headers
            .iter()
            .filter(|h| h.starts_with(&study.baseline_prefix))
            .cloned()
            .collect();
        baseline.sort();

        let blocks: Vec<BlockColumns> = study
            .blocks
            .iter()
            .map(|b| {
                let mut columns: Vec<String> = headers
                    .iter()
                    .filter(|h| h.starts_with(&b.prefix))
                    .cloned()
                    .collect();
                columns.sort();
                BlockColumns {
                    block: b.id.clone(),
                    columns,
                }
            })
            .collect();

        let mut multi_block: Vec<String> = blocks
            .iter()
            .flat_map(|b| b.columns.iter().cloned())
            .collect();
        multi_block.sort();
        multi_block.dedup();

        let mut all: Vec<String> = baseline.iter().chain(&multi_block).cloned().collect();
        all.sort();
        all.dedup();

        Self {
            participant_column: study.participant_column.clone(),
            baseline,
            blocks,
            multi_block,
            all,
            expected_total: study.expected_total_items(),
            source_hash: None,
        }
    }

    pub fn block_columns(&self, block: &str) -> Option<&[String]> {
        self.blocks
            .iter()
            .find(|b| b.block == block)
            .map(|b| b.columns.as_slice())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Why a participant was rejected by the quality filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropReason {
    Incomplete,
    Flatliner,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::Incomplete => "incomplete",
            DropReason::Flatliner => "flatliner",
        })
    }
}

/// Per-participant quality metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantQuality {
    pub participant_id: String,
    pub answered: usize,
    pub completeness: f64,
    /// Population SD over multi-block items.
    pub sd: f64,
    /// Unscaled MAD over multi-block items.
    pub mad: f64,
    pub reasons: Vec<DropReason>,
}

impl ParticipantQuality {
    pub fn kept(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn reason_label(&self) -> String {
        self.reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Evaluate one participant's slider values.
///
/// `all_values` covers every detected slider; `block_values` only the
/// multi-block ones. Rejected as a flatliner only when SD and MAD are both
/// below their floors.
pub fn assess_participant(
    participant_id: &str,
    all_values: &[f64],
    block_values: &[f64],
    expected_total: usize,
    cfg: &CleaningConfig,
) -> ParticipantQuality {
    let answered = descriptive::count_present(all_values);
    let completeness = answered as f64 / expected_total as f64;
    let sd = descriptive::std_dev(block_values, 0);
    let mad = descriptive::mad(block_values);

    let mut reasons = Vec::new();
    if completeness < cfg.completeness_threshold {
        reasons.push(DropReason::Incomplete);
    }
    if sd < cfg.sd_floor && mad < cfg.mad_floor {
        reasons.push(DropReason::Flatliner);
    }
    ParticipantQuality {
        participant_id: participant_id.to_string(),
        answered,
        completeness,
        sd,
        mad,
        reasons,
    }
}

/// Counts reported at the end of cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanSummary {
    pub raw_rows: usize,
    pub not_finished: usize,
    pub missing_id: usize,
    pub duplicate_id: usize,
    pub kept: usize,
    pub dropped: usize,
    pub incomplete: usize,
    pub flatliner: usize,
    pub detected_sliders: usize,
    pub expected_sliders: usize,
}

#[derive(Debug, Clone)]
pub struct CleanOutcome {
    pub kept: Table,
    pub dropped: Table,
    pub schema: SliderSchema,
    pub quality: Vec<ParticipantQuality>,
    pub summary: CleanSummary,
}

impl CleanOutcome {
    /// Numeric slider values of kept participants.
    pub fn slider_frame(&self) -> Result<NumericFrame> {
        NumericFrame::from_table(&self.kept, &self.schema.participant_column, &self.schema.all)
    }
}

/// Admin filters: finished rows only, non-empty id, first occurrence of each id.
pub fn admin_filter(table: &Table, study: &StudyConfig, summary: &mut CleanSummary) -> Result<Table> {
    let id_col = table.column_index(&study.participant_column)?;
    let finished_col = table.find_column(&study.finished_column);
    if finished_col.is_none() {
        warn!(
            column = %study.finished_column,
            "finished column not found; completion filter skipped"
        );
    }

    let mut seen = std::collections::HashSet::new();
    let mut keep = Vec::with_capacity(table.len());
    for (i, row) in table.rows().iter().enumerate() {
        if let Some(fc) = finished_col {
            if !is_finished(&row[fc]) {
                summary.not_finished += 1;
                continue;
            }
        }
        let id = row[id_col].trim();
        if id.is_empty() {
            summary.missing_id += 1;
            continue;
        }
        if !seen.insert(id.to_string()) {
            summary.duplicate_id += 1;
            continue;
        }
        keep.push(i);
    }
    Ok(table.select_rows(&keep))
}

fn is_finished(cell: &str) -> bool {
    matches!(
        cell.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// Run admin filters, slider detection and the quality filter.
pub fn clean(raw: &Table, study: &StudyConfig) -> Result<CleanOutcome> {
    let mut summary = CleanSummary {
        raw_rows: raw.len(),
        ..CleanSummary::default()
    };
    let table = admin_filter(raw, study, &mut summary)?;

    let schema = SliderSchema::detect(table.headers(), study);
    summary.detected_sliders = schema.all.len();
    summary.expected_sliders = schema.expected_total;
    if schema.all.len() < study.cleaning.min_detected_sliders {
        warn!(
            detected = schema.all.len(),
            expected = schema.expected_total,
            "unusually few slider columns detected"
        );
    }

    let frame = NumericFrame::from_table(&table, &study.participant_column, &schema.all)?;
    let mut quality = Vec::with_capacity(frame.len());
    let mut kept_rows = Vec::new();
    let mut dropped_rows = Vec::new();
    for (row, id) in frame.ids().iter().enumerate() {
        let all_values = frame.row_values(row, &schema.all);
        let block_values = frame.row_values(row, &schema.multi_block);
        let q = assess_participant(
            id,
            &all_values,
            &block_values,
            schema.expected_total,
            &study.cleaning,
        );
        if q.kept() {
            kept_rows.push(row);
        } else {
            summary.incomplete += q.reasons.contains(&DropReason::Incomplete) as usize;
            summary.flatliner += q.reasons.contains(&DropReason::Flatliner) as usize;
            warn!(
                participant = %id,
                reason = %q.reason_label(),
                completeness = q.completeness,
                sd = q.sd,
                mad = q.mad,
                "participant dropped"
            );
            dropped_rows.push(row);
        }
        quality.push(q);
    }

    let kept = table.select_rows(&kept_rows);
    let mut dropped = table.select_rows(&dropped_rows);
    let reasons = dropped_rows
        .iter()
        .map(|&r| quality[r].reason_label())
        .collect();
    dropped.push_column(DROP_REASON_COLUMN, reasons)?;

    summary.kept = kept.len();
    summary.dropped = dropped.len();
    info!(
        kept = summary.kept,
        dropped = summary.dropped,
        incomplete = summary.incomplete,
        flatliner = summary.flatliner,
        sliders_found = summary.detected_sliders,
        sliders_expected = summary.expected_sliders,
        "cleaning finished"
    );

    Ok(CleanOutcome {
        kept,
        dropped,
        schema,
        quality,
        summary,
    })
}

/// Read an export from disk and clean it, recording the export's hash.
pub fn clean_file(path: impl AsRef<Path>, opts: &ReadOptions, study: &StudyConfig) -> Result<CleanOutcome> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| AnalysisError::io(path, e))?;
    let table = Table::read(path, opts)?;
    let mut outcome = clean(&table, study)?;
    outcome.schema.source_hash = Some(blake3::hash(&bytes).to_hex().to_string());
    Ok(outcome)
}

/// Paths written by [`write_clean_artifacts`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanArtifacts {
    pub cleaned: PathBuf,
    pub dropped: PathBuf,
    pub all_sliders: PathBuf,
    pub multi_block: PathBuf,
    pub schema: PathBuf,
}

impl CleanArtifacts {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cleaned: dir.join("clean_wide.csv"),
            dropped: dir.join("dropped_log.csv"),
            all_sliders: dir.join("all_slider_cols.json"),
            multi_block: dir.join("phase2_cols.json"),
            schema: dir.join(SCHEMA_FILE),
        }
    }
}

pub fn write_clean_artifacts(outcome: &CleanOutcome, dir: &Path) -> Result<CleanArtifacts> {
    let paths = CleanArtifacts::in_dir(dir);
    outcome.kept.write_csv(&paths.cleaned)?;
    outcome.dropped.write_csv(&paths.dropped)?;
    write_json(&paths.all_sliders, &outcome.schema.all)?;
    write_json(&paths.multi_block, &outcome.schema.multi_block)?;
    write_json(&paths.schema, &outcome.schema)?;
    Ok(paths)
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body).map_err(|e| AnalysisError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CleaningConfig {
        CleaningConfig {
            completeness_threshold: 0.75,
            ..CleaningConfig::default()
        }
    }

    #[test]
    fn completeness_boundary_is_inclusive() {
        let mut all = vec![50.0; 63];
        all.extend(vec![f64::NAN; 21]);
        let block: Vec<f64> = (0..63).map(|i| (i % 10) as f64 * 10.0).collect();
        let q = assess_participant("p", &all, &block, 84, &cfg());
        assert_eq!(q.answered, 63);
        assert!(q.kept());

        all[62] = f64::NAN;
        let q = assess_participant("p", &all, &block, 84, &cfg());
        assert_eq!(q.reasons, vec![DropReason::Incomplete]);
    }

    #[test]
    fn flatliner_needs_both_floors() {
        let all = vec![50.0; 84];
        // 48 x 50 plus one 30 and one 70: SD exactly 4, MAD 0. Kept.
        let mut block = vec![50.0; 48];
        block.extend([30.0, 70.0]);
        let q = assess_participant("p", &all, &block, 84, &CleaningConfig::default());
        assert_eq!(q.sd, 4.0);
        assert_eq!(q.mad, 0.0);
        assert!(q.kept());

        let flat = vec![50.0; 75];
        let q = assess_participant("p", &all, &flat, 84, &CleaningConfig::default());
        assert_eq!(q.reasons, vec![DropReason::Flatliner]);
        assert_eq!(q.reason_label(), "flatliner");
    }

    #[test]
    fn participant_without_block_values_is_not_a_flatliner() {
        let q = assess_participant("p", &[f64::NAN; 84], &[f64::NAN; 75], 84, &cfg());
        assert_eq!(q.reasons, vec![DropReason::Incomplete]);
    }

    #[test]
    fn admin_filter_drops_unfinished_blank_and_duplicate_ids() {
        let raw = "ResponseId,Finished\nR1,True\nR2,False\n,True\nR1,1\nR3,yes\n";
        let table = Table::from_reader(raw.as_bytes(), b',', 1).unwrap();
        let mut summary = CleanSummary::default();
        let out = admin_filter(&table, &StudyConfig::default(), &mut summary).unwrap();
        let ids: Vec<&str> = out.text(0).collect();
        assert_eq!(ids, vec!["R1", "R3"]);
        assert_eq!(summary.not_finished, 1);
        assert_eq!(summary.missing_id, 1);
        assert_eq!(summary.duplicate_id, 1);
    }

    #[test]
    fn missing_id_column_is_a_configuration_error() {
        let table = Table::from_reader("Finished\nTrue\n".as_bytes(), b',', 1).unwrap();
        let err = clean(&table, &StudyConfig::default()).unwrap_err();
        assert!(err.is_configuration());
    }
}

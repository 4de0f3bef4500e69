//! Long analytic panel: one row per (participant, pair, block).

use std::collections::HashMap;
use std::path::Path;

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{Catalog, PairId};
use crate::config::BlockMap;
use crate::error::{AnalysisError, Result};
use crate::stats::descriptive;
use crate::table::{ensure_parent, format_cell, parse_numeric, NumericFrame, ReadOptions, Table};

pub const PARTICIPANT: &str = "participant_id";
pub const PHASE_I: &str = "PhaseI";
pub const PHASE_II: &str = "PhaseII";

/// Baseline rating per participant and pair.
#[derive(Debug, Clone, Default)]
pub struct BaselineTable {
    index: HashMap<String, usize>,
    pairs: Vec<PairId>,
    values: Vec<Vec<f64>>,
}

impl BaselineTable {
    /// Column for `pair`, preferring `<prefix><pair>_MEAN`, then
    /// `<prefix><pair>_REC`, then `<prefix><pair>`.
    pub fn candidate_columns(prefix: &str, pair_name: &str) -> [String; 3] {
        [
            format!("{prefix}{pair_name}_MEAN"),
            format!("{prefix}{pair_name}_REC"),
            format!("{prefix}{pair_name}"),
        ]
    }

    pub fn from_table(
        table: &Table,
        id_column: &str,
        prefix: &str,
        pairs: &[PairId],
        catalog: &Catalog,
    ) -> Result<Self> {
        let id_idx = table.column_index(id_column)?;
        let mut index = HashMap::with_capacity(table.len());
        for (row, id) in table.text(id_idx).enumerate() {
            index.entry(id.trim().to_string()).or_insert(row);
        }

        let mut found = Vec::new();
        let mut values = Vec::new();
        for &pair in pairs {
            let name = catalog.pair_name(pair);
            let column = Self::candidate_columns(prefix, &name)
                .iter()
                .find_map(|c| table.find_column(c));
            match column {
                Some(col) => {
                    found.push(pair);
                    values.push(table.numeric(col));
                }
                None => warn!(pair = %name, "no baseline column for pair"),
            }
        }
        Ok(Self {
            index,
            pairs: found,
            values,
        })
    }

    pub fn pairs(&self) -> &[PairId] {
        &self.pairs
    }

    pub fn participants(&self) -> usize {
        self.index.len()
    }

    /// `NaN` when the participant or pair is unknown.
    pub fn value(&self, participant: &str, pair: PairId) -> f64 {
        let Some(&row) = self.index.get(participant) else {
            return f64::NAN;
        };
        self.pairs
            .iter()
            .position(|p| *p == pair)
            .map_or(f64::NAN, |i| self.values[i][row])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    pub participant_id: String,
    pub pair: PairId,
    pub block: String,
    pub phase1: f64,
    pub phase2: f64,
}

impl PanelRow {
    pub fn is_complete(&self) -> bool {
        self.phase1.is_finite() && self.phase2.is_finite()
    }
}

/// Long panel. Rows with a missing rating are kept; model fits drop them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Panel {
    rows: Vec<PanelRow>,
}

impl Panel {
    pub fn new(rows: Vec<PanelRow>) -> Self {
        Self { rows }
    }

    /// Reshape block columns of `wide` into panel rows, joining the
    /// baseline rating by participant and pair.
    ///
    /// A mapped column absent from `wide`, or entirely missing in it,
    /// contributes no rows.
    pub fn build(wide: &NumericFrame, baseline: &BaselineTable, blocks: &BlockMap, catalog: &Catalog) -> Self {
        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for mapping in blocks.blocks() {
            for (pair, column) in &mapping.items {
                let Some(values) = wide.column(column) else {
                    warn!(block = %mapping.block, pair = %catalog.display_pair(*pair), column = %column, "mapped column not found");
                    skipped += 1;
                    continue;
                };
                if descriptive::count_present(values) == 0 {
                    warn!(block = %mapping.block, pair = %catalog.display_pair(*pair), column = %column, "mapped column is empty");
                    skipped += 1;
                    continue;
                }
                for (id, &phase2) in wide.ids().iter().zip(values) {
                    rows.push(PanelRow {
                        participant_id: id.clone(),
                        pair: *pair,
                        block: mapping.block.clone(),
                        phase1: baseline.value(id, *pair),
                        phase2,
                    });
                }
            }
        }
        let panel = Self { rows };
        info!(
            rows = panel.len(),
            complete = panel.complete_count(),
            skipped_columns = skipped,
            "panel built"
        );
        panel
    }

    pub fn rows(&self) -> &[PanelRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn complete_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_complete()).count()
    }

    pub fn filter(&self, keep: impl Fn(&PanelRow) -> bool) -> Self {
        Self {
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    pub fn block(&self, block: &str) -> Self {
        self.filter(|r| r.block == block)
    }

    /// Participant ids in order of first appearance.
    pub fn participants(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.rows
            .iter()
            .filter(|r| seen.insert(r.participant_id.as_str()))
            .map(|r| r.participant_id.clone())
            .collect()
    }

    /// Block ids in order of first appearance.
    pub fn blocks(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for r in &self.rows {
            if !out.contains(&r.block) {
                out.push(r.block.clone());
            }
        }
        out
    }

    /// Pairs in order of first appearance.
    pub fn pairs(&self) -> Vec<PairId> {
        let mut out = Vec::new();
        for r in &self.rows {
            if !out.contains(&r.pair) {
                out.push(r.pair);
            }
        }
        out
    }

    pub fn write_csv(&self, path: impl AsRef<Path>, catalog: &Catalog) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let mut writer = WriterBuilder::new()
            .from_path(path)
            .map_err(AnalysisError::Csv)?;
        writer.write_record([PARTICIPANT, "pair", "block", PHASE_I, PHASE_II])?;
        for r in &self.rows {
            writer.write_record([
                r.participant_id.clone(),
                catalog.pair_name(r.pair),
                r.block.clone(),
                format_cell(r.phase1),
                format_cell(r.phase2),
            ])?;
        }
        writer.flush().map_err(|e| AnalysisError::io(path, e))?;
        Ok(())
    }

    pub fn read_csv(path: impl AsRef<Path>, catalog: &Catalog) -> Result<Self> {
        let table = Table::read(path, &ReadOptions::default())?;
        let id = table.column_index(PARTICIPANT)?;
        let pair = table.column_index("pair")?;
        let block = table.column_index("block")?;
        let p1 = table.column_index(PHASE_I)?;
        let p2 = table.column_index(PHASE_II)?;
        let mut rows = Vec::with_capacity(table.len());
        for row in table.rows() {
            rows.push(PanelRow {
                participant_id: row[id].trim().to_string(),
                pair: catalog.resolve_pair(&row[pair])?,
                block: row[block].trim().to_string(),
                phase1: parse_numeric(&row[p1]),
                phase2: parse_numeric(&row[p2]),
            });
        }
        Ok(Self { rows })
    }
}

/// Numeric frame of every mapped column present in `table`, keyed by the
/// mapping's column names.
pub fn block_frame(table: &Table, id_column: &str, blocks: &BlockMap) -> Result<NumericFrame> {
    let mut columns: Vec<String> = Vec::new();
    for mapping in blocks.blocks() {
        for column in mapping.columns() {
            if table.find_column(column).is_some() && !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }
    }
    NumericFrame::from_table(table, id_column, &columns)
}

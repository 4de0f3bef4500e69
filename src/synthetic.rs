//! Deterministic synthetic studies with a planted echo slope.
//!
//! Produces a survey export in the layout [`crate::ingest`] expects, a
//! separate baseline table carrying `<prefix><pair>_MEAN` for every pair,
//! and the matching pair-list and block files.

use std::path::{Path, PathBuf};

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use tracing::info;

use crate::catalog::{Catalog, PairId};
use crate::config::{BlockMap, BlockMapping, StudyConfig};
use crate::error::{AnalysisError, Result};
use crate::table::{ensure_parent, Table};

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub participants: usize,
    pub seed: u64,
    /// Echo slope planted in each configured block, in block order. Shorter
    /// lists repeat their last entry.
    pub block_slopes: Vec<f64>,
    /// Added to every block slope for odd-numbered participants, giving two
    /// latent groups.
    pub group_slope_shift: f64,
    /// SD of the Gaussian noise on block ratings; 0 gives noiseless ratings.
    pub noise_sigma: f64,
    /// Extra participants who answer every block item with the same value.
    pub flatliners: usize,
    /// Extra participants who skip every block item.
    pub incomplete: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            participants: 20,
            seed: 7,
            block_slopes: vec![0.6, 0.5, 0.4, 0.55, 0.45],
            group_slope_shift: 0.2,
            noise_sigma: 8.0,
            flatliners: 0,
            incomplete: 0,
        }
    }
}

impl SyntheticConfig {
    fn slope(&self, block: usize) -> f64 {
        self.block_slopes
            .get(block)
            .or(self.block_slopes.last())
            .copied()
            .unwrap_or(0.5)
    }
}

// =============================================================================
// Generated study
// =============================================================================

#[derive(Debug, Clone)]
pub struct SyntheticStudy {
    pub export: Table,
    pub baseline: Table,
    pub pairs: Vec<PairId>,
    pub blocks: BlockMap,
}

/// Files written by [`SyntheticStudy::write`].
#[derive(Debug, Clone, Serialize)]
pub struct SyntheticPaths {
    pub export: PathBuf,
    pub baseline: PathBuf,
    pub pairs: PathBuf,
    pub blocks: PathBuf,
}

#[derive(Serialize)]
struct PairsFile {
    pairs: Vec<String>,
}

/// Column of `pair` in `block`: `<prefix><pair>_<n>`.
pub fn block_column(prefix: &str, pair_name: &str, item: usize) -> String {
    format!("{prefix}{pair_name}_{item}")
}

fn slider(v: f64) -> String {
    format!("{:.1}", v.clamp(0.0, 100.0))
}

/// Generate a study for `study`'s catalog and blocks.
///
/// The export carries the first `expected_baseline_items` pairs of the
/// baseline battery as bare `<prefix><pair>` columns; the separate baseline
/// table covers all pairs.
pub fn generate(study: &StudyConfig, catalog: &Catalog, cfg: &SyntheticConfig) -> Result<SyntheticStudy> {
    if cfg.participants == 0 {
        return Err(AnalysisError::invalid_config("synthetic study needs participants"));
    }
    if cfg.noise_sigma.is_nan() || cfg.noise_sigma < 0.0 {
        return Err(AnalysisError::invalid_config(format!(
            "noise_sigma must be non-negative, got {}",
            cfg.noise_sigma
        )));
    }
    let noise = if cfg.noise_sigma > 0.0 {
        let normal = Normal::new(0.0, cfg.noise_sigma)
            .map_err(|e| AnalysisError::invalid_config(format!("noise_sigma: {e}")))?;
        Some(normal)
    } else {
        None
    };
    let pairs: Vec<PairId> = catalog.pairs().to_vec();
    let pair_names: Vec<String> = pairs.iter().map(|p| catalog.pair_name(*p)).collect();
    let export_pairs = study.expected_baseline_items.min(pairs.len());
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let mut blocks = Vec::with_capacity(study.blocks.len());
    for (b, spec) in study.blocks.iter().enumerate() {
        blocks.push(BlockMapping {
            block: spec.id.clone(),
            items: pairs
                .iter()
                .zip(&pair_names)
                .enumerate()
                .map(|(k, (p, name))| (*p, block_column(&spec.prefix, name, b * pairs.len() + k + 1)))
                .collect(),
        });
    }
    let blocks = BlockMap::new(blocks);

    let mut headers = vec![study.participant_column.clone(), study.finished_column.clone()];
    headers.extend(
        pair_names[..export_pairs]
            .iter()
            .map(|n| format!("{}{n}", study.baseline_prefix)),
    );
    for mapping in blocks.blocks() {
        headers.extend(mapping.columns().map(str::to_string));
    }
    let mut baseline_headers = vec![study.participant_column.clone()];
    baseline_headers.extend(
        pair_names
            .iter()
            .map(|n| format!("{}{n}_MEAN", study.baseline_prefix)),
    );

    let total = cfg.participants + cfg.flatliners + cfg.incomplete;
    let mut rows = Vec::with_capacity(total);
    let mut baseline_rows = Vec::with_capacity(total);
    for i in 0..total {
        let id = format!("R_{i:04}");
        let base: Vec<f64> = (0..pairs.len()).map(|_| rng.gen_range(5.0..95.0)).collect();
        let mut row = vec![id.clone(), "True".to_string()];
        row.extend(base[..export_pairs].iter().map(|v| slider(*v)));

        let flat = i >= cfg.participants && i < cfg.participants + cfg.flatliners;
        let skip = i >= cfg.participants + cfg.flatliners;
        let shift = if i % 2 == 1 { cfg.group_slope_shift } else { 0.0 };
        for b in 0..blocks.blocks().len() {
            let slope = cfg.slope(b) + shift;
            for base_k in &base {
                row.push(if flat {
                    slider(50.0)
                } else if skip {
                    String::new()
                } else {
                    let mean = 50.0 * (1.0 - slope) + slope * base_k;
                    slider(mean + noise.as_ref().map_or(0.0, |n| n.sample(&mut rng)))
                });
            }
        }
        rows.push(row);

        let mut b_row = vec![id];
        b_row.extend(base.iter().map(|v| slider(*v)));
        baseline_rows.push(b_row);
    }

    info!(
        participants = cfg.participants,
        flatliners = cfg.flatliners,
        incomplete = cfg.incomplete,
        columns = headers.len(),
        "synthetic study generated"
    );
    Ok(SyntheticStudy {
        export: Table::new(headers, rows),
        baseline: Table::new(baseline_headers, baseline_rows),
        pairs,
        blocks,
    })
}

impl SyntheticStudy {
    pub fn write(&self, dir: &Path, catalog: &Catalog) -> Result<SyntheticPaths> {
        let paths = SyntheticPaths {
            export: dir.join("export.csv"),
            baseline: dir.join("baseline.csv"),
            pairs: dir.join("pairs.yaml"),
            blocks: dir.join("blocks.yaml"),
        };
        self.export.write_csv(&paths.export)?;
        self.baseline.write_csv(&paths.baseline)?;

        let pairs = PairsFile {
            pairs: self.pairs.iter().map(|p| catalog.pair_name(*p)).collect(),
        };
        write_text(&paths.pairs, &serde_yaml::to_string(&pairs)?)?;
        write_text(&paths.blocks, &self.blocks.to_yaml(catalog)?)?;
        Ok(paths)
    }
}

fn write_text(path: &Path, body: &str) -> Result<()> {
    ensure_parent(path)?;
    std::fs::write(path, body).map_err(|e| AnalysisError::io(path, e))
}

//! Study configuration and the externally authored pair/block files.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;
use tracing::warn;

use crate::analysis::clustering::ClusteringConfig;
use crate::catalog::{Catalog, CatalogSpec, PairId};
use crate::error::{AnalysisError, Result};
use crate::stats::regression::RegressionConfig;

/// One judgment-context block of the multi-block battery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    /// Block tag, e.g. `QH1`.
    pub id: String,
    /// Column-name prefix that marks this block's sliders, e.g. `QH1-`.
    pub prefix: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl BlockSpec {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            prefix: format!("{id}-"),
            label: Some(label.to_string()),
        }
    }
}

/// Participant-level quality filter thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Minimum fraction of the expected slider set that must be answered.
    pub completeness_threshold: f64,
    /// Flatliner SD floor over multi-block items (population SD).
    pub sd_floor: f64,
    /// Flatliner MAD floor over multi-block items (unscaled MAD).
    pub mad_floor: f64,
    /// Warn when fewer sliders than this are detected in the export.
    pub min_detected_sliders: usize,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            completeness_threshold: 0.80,
            sd_floor: 4.0,
            mad_floor: 3.0,
            min_detected_sliders: 70,
        }
    }
}

/// Full configuration for one study.
///
/// `Default` reproduces the moral-foundations study this pipeline was
/// written for; a YAML or JSON file may override any subset of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub catalog: CatalogSpec,
    pub participant_column: String,
    pub finished_column: String,
    /// Column-name prefix of the baseline battery.
    pub baseline_prefix: String,
    /// Blocks in reporting order. The first block is the reference level of
    /// the context-interaction model.
    pub blocks: Vec<BlockSpec>,
    pub expected_baseline_items: usize,
    pub expected_block_items: usize,
    pub cleaning: CleaningConfig,
    pub regression: RegressionConfig,
    pub clustering: ClusteringConfig,
    /// Minimum complete observations for a within-profile echo slope.
    pub min_profile_observations: usize,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogSpec::default(),
            participant_column: "ResponseId".to_string(),
            finished_column: "Finished".to_string(),
            baseline_prefix: "P1Q-".to_string(),
            blocks: vec![
                BlockSpec::new("QH1", "Choice"),
                BlockSpec::new("QH2", "Emotion"),
                BlockSpec::new("QH3", "Intensity"),
                BlockSpec::new("QH5", "Normative language"),
                BlockSpec::new("QH6", "Justification"),
            ],
            expected_baseline_items: 9,
            expected_block_items: 75,
            cleaning: CleaningConfig::default(),
            regression: RegressionConfig::default(),
            clustering: ClusteringConfig::default(),
            min_profile_observations: 10,
        }
    }
}

impl StudyConfig {
    /// Load from YAML (`.yaml`/`.yml`) or JSON (anything else).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        let cfg: StudyConfig = if is_yaml(path) {
            serde_yaml::from_str(&raw)?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                AnalysisError::invalid_config(format!("{}: {e}", path.display()))
            })?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocks.is_empty() {
            return Err(AnalysisError::invalid_config("no blocks configured"));
        }
        for (i, b) in self.blocks.iter().enumerate() {
            if self.blocks[..i].iter().any(|o| o.id == b.id) {
                return Err(AnalysisError::invalid_config(format!(
                    "duplicate block id {}",
                    b.id
                )));
            }
            if b.prefix.is_empty() {
                return Err(AnalysisError::invalid_config(format!(
                    "block {} has an empty prefix",
                    b.id
                )));
            }
        }
        let c = &self.cleaning;
        if !(0.0..=1.0).contains(&c.completeness_threshold) {
            return Err(AnalysisError::invalid_config(format!(
                "completeness_threshold must lie in [0, 1], got {}",
                c.completeness_threshold
            )));
        }
        if c.sd_floor < 0.0 || c.mad_floor < 0.0 {
            return Err(AnalysisError::invalid_config(
                "flatliner floors must be non-negative",
            ));
        }
        if self.expected_total_items() == 0 {
            return Err(AnalysisError::invalid_config(
                "expected slider count must be positive",
            ));
        }
        self.clustering.validate()?;
        Ok(())
    }

    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::from_spec(&self.catalog)
    }

    pub fn expected_total_items(&self) -> usize {
        self.expected_baseline_items + self.expected_block_items
    }

    pub fn block_ids(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.id.clone()).collect()
    }

    pub fn block(&self, id: &str) -> Result<&BlockSpec> {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| AnalysisError::UnknownBlock {
                block: id.to_string(),
            })
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

// ---------------------------------------------------------------------
//  Pair list
// ---------------------------------------------------------------------

/// Parse a pair-list file. Accepts a bare list of names, a `pairs:` key
/// holding a list or a mapping (keys are the names), or a bare mapping.
pub fn parse_pairs(raw: &str, catalog: &Catalog) -> Result<Vec<PairId>> {
    let doc: Yaml = serde_yaml::from_str(raw)?;
    let names: Vec<String> = match &doc {
        Yaml::Sequence(seq) => yaml_strings(seq)?,
        Yaml::Mapping(map) => match map.get("pairs") {
            Some(Yaml::Sequence(seq)) => yaml_strings(seq)?,
            Some(Yaml::Mapping(inner)) => yaml_keys(inner)?,
            Some(_) => {
                return Err(AnalysisError::invalid_config(
                    "`pairs` must be a list or a mapping",
                ))
            }
            None => yaml_keys(map)?,
        },
        _ => {
            return Err(AnalysisError::invalid_config(
                "pair config must be a list or a mapping",
            ))
        }
    };

    let mut pairs = Vec::with_capacity(names.len());
    for name in names {
        let pair = catalog.resolve_pair(&name)?;
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }
    Ok(pairs)
}

pub fn load_pairs(path: impl AsRef<Path>, catalog: &Catalog) -> Result<Vec<PairId>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
    parse_pairs(&raw, catalog)
}

fn yaml_strings(seq: &[Yaml]) -> Result<Vec<String>> {
    seq.iter().map(yaml_scalar).collect()
}

fn yaml_keys(map: &serde_yaml::Mapping) -> Result<Vec<String>> {
    map.keys().map(yaml_scalar).collect()
}

fn yaml_scalar(v: &Yaml) -> Result<String> {
    match v {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        other => Err(AnalysisError::invalid_config(format!(
            "expected a scalar, found {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------
//  Block map
// ---------------------------------------------------------------------

/// Source columns of one block, keyed by pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapping {
    pub block: String,
    pub items: Vec<(PairId, String)>,
}

impl BlockMapping {
    pub fn column(&self, pair: PairId) -> Option<&str> {
        self.items
            .iter()
            .find(|(p, _)| *p == pair)
            .map(|(_, c)| c.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(_, c)| c.as_str())
    }
}

/// `block -> {pair -> column}`, ordered like the study's block list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockMap {
    blocks: Vec<BlockMapping>,
}

impl BlockMap {
    pub fn new(blocks: Vec<BlockMapping>) -> Self {
        Self { blocks }
    }

    /// Parse a block file of the form `BLOCK: {mapping: {PAIR: COLUMN}}`.
    pub fn parse(raw: &str, catalog: &Catalog, study: &StudyConfig) -> Result<Self> {
        let doc: Yaml = serde_yaml::from_str(raw)?;
        let Yaml::Mapping(top) = doc else {
            return Err(AnalysisError::invalid_config(
                "block config must be a mapping of block ids",
            ));
        };

        let mut parsed: Vec<BlockMapping> = Vec::with_capacity(top.len());
        for (key, spec) in &top {
            let block = yaml_scalar(key)?;
            study.block(&block)?;
            let mapping = match spec {
                Yaml::Mapping(m) => m.get("mapping").cloned(),
                _ => None,
            };
            let mut items = Vec::new();
            match mapping {
                Some(Yaml::Mapping(m)) => {
                    for (pair_name, column) in &m {
                        let pair = catalog.resolve_pair(&yaml_scalar(pair_name)?)?;
                        items.push((pair, yaml_scalar(column)?));
                    }
                }
                Some(Yaml::Null) | None => {
                    warn!(block = %block, "block has no mapping; no items will be read");
                }
                Some(_) => {
                    return Err(AnalysisError::invalid_config(format!(
                        "block {block}: `mapping` must be a mapping of pair -> column"
                    )))
                }
            }
            parsed.push(BlockMapping { block, items });
        }

        let mut blocks = Vec::with_capacity(parsed.len());
        for spec in &study.blocks {
            match parsed.iter().position(|b| b.block == spec.id) {
                Some(idx) => blocks.push(parsed.swap_remove(idx)),
                None => warn!(block = %spec.id, "block missing from block config"),
            }
        }
        Ok(Self { blocks })
    }

    pub fn load(path: impl AsRef<Path>, catalog: &Catalog, study: &StudyConfig) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        Self::parse(&raw, catalog, study)
    }

    /// Render back into the YAML layout accepted by [`BlockMap::parse`].
    pub fn to_yaml(&self, catalog: &Catalog) -> Result<String> {
        let mut top = serde_yaml::Mapping::new();
        for b in &self.blocks {
            let mut mapping = serde_yaml::Mapping::new();
            for (pair, column) in &b.items {
                mapping.insert(
                    Yaml::String(catalog.pair_name(*pair)),
                    Yaml::String(column.clone()),
                );
            }
            let mut spec = serde_yaml::Mapping::new();
            spec.insert(Yaml::String("mapping".into()), Yaml::Mapping(mapping));
            top.insert(Yaml::String(b.block.clone()), Yaml::Mapping(spec));
        }
        Ok(serde_yaml::to_string(&Yaml::Mapping(top))?)
    }

    pub fn blocks(&self) -> &[BlockMapping] {
        &self.blocks
    }

    pub fn get(&self, block: &str) -> Option<&BlockMapping> {
        self.blocks.iter().find(|b| b.block == block)
    }

    pub fn block_ids(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.block.clone()).collect()
    }

    /// Union of pairs across blocks, in order of first appearance.
    pub fn pairs(&self) -> Vec<PairId> {
        let mut out = Vec::new();
        for b in &self.blocks {
            for (pair, _) in &b.items {
                if !out.contains(pair) {
                    out.push(*pair);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::from_spec(&CatalogSpec::default()).unwrap()
    }

    #[test]
    fn parse_pairs_accepts_all_layouts() {
        let c = catalog();
        let list = parse_pairs("- CareFairness\n- CareLoyalty\n", &c).unwrap();
        assert_eq!(list.len(), 2);

        let nested = parse_pairs("pairs:\n  - CareFairness\n", &c).unwrap();
        assert_eq!(nested, vec![c.resolve_pair("CareFairness").unwrap()]);

        let keyed = parse_pairs("pairs:\n  CareFairness: {}\n  LoyaltyLiberty: {}\n", &c).unwrap();
        assert_eq!(keyed.len(), 2);

        let err = parse_pairs("- CareNothing\n", &c).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn block_map_follows_study_order_and_rejects_unknown_blocks() {
        let c = catalog();
        let study = StudyConfig::default();
        let raw = "\
QH2:
  mapping:
    CareFairness: QH2-CareFairness_1
QH1:
  mapping:
    CareFairness: QH1-CareFairness_1
    CareLoyalty: QH1-CareLoyalty_1
";
        let map = BlockMap::parse(raw, &c, &study).unwrap();
        assert_eq!(map.block_ids(), vec!["QH1".to_string(), "QH2".to_string()]);
        let qh1 = map.get("QH1").unwrap();
        assert_eq!(
            qh1.column(c.resolve_pair("CareLoyalty").unwrap()),
            Some("QH1-CareLoyalty_1")
        );

        let round_trip = BlockMap::parse(&map.to_yaml(&c).unwrap(), &c, &study).unwrap();
        assert_eq!(round_trip, map);

        let bad = BlockMap::parse("QH9:\n  mapping: {}\n", &c, &study).unwrap_err();
        assert!(matches!(bad, AnalysisError::UnknownBlock { .. }));
    }

    #[test]
    fn study_config_overrides_subset_of_fields() {
        let cfg: StudyConfig =
            serde_yaml::from_str("cleaning:\n  completeness_threshold: 0.9\n").unwrap();
        assert_eq!(cfg.cleaning.completeness_threshold, 0.9);
        assert_eq!(cfg.cleaning.sd_floor, 4.0);
        assert_eq!(cfg.blocks.len(), 5);
        assert!(cfg.validate().is_ok());
    }
}

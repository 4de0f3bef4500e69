//! Study catalog: the value set, the pairs built from it, and the
//! theory-driven profiles defined over it.
//!
//! The catalog is immutable once built and passed explicitly to every
//! component that needs pair or value semantics. Pair names found in
//! configuration files and column names are resolved here, once, into a
//! structured [`PairId`]; nothing downstream re-parses a concatenated name.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Index of a value inside its [`Catalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u8);

/// Ordered pair of two distinct values.
///
/// The order follows the naming convention of the instrument: for a slider
/// named `CareFairness`, `first` is Care and `second` is Fairness, and a
/// rating of 100 leans towards `second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairId {
    pub first: ValueId,
    pub second: ValueId,
}

impl PairId {
    pub fn new(first: ValueId, second: ValueId) -> Self {
        Self { first, second }
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.first == value || self.second == value
    }
}

/// How a pair item enters a profile signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Focal value is the first member; raw score is kept.
    Keep,
    /// Focal value is the second member; score enters as `100 - raw`.
    Invert,
}

impl Orientation {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Orientation::Keep => raw,
            Orientation::Invert => 100.0 - raw,
        }
    }
}

/// Theory-driven profile: an unordered set of exactly two focal values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub focal: [ValueId; 2],
}

impl Profile {
    pub fn is_focal(&self, value: ValueId) -> bool {
        self.focal.contains(&value)
    }

    /// Returns the orientation for `pair`, or `None` when the pair holds zero
    /// or two focal values and is therefore excluded from the signature.
    pub fn orientation(&self, pair: PairId) -> Option<Orientation> {
        match (self.is_focal(pair.first), self.is_focal(pair.second)) {
            (true, false) => Some(Orientation::Keep),
            (false, true) => Some(Orientation::Invert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub name: String,
    pub focal: Vec<String>,
}

/// Serializable description of a catalog, as found in a study config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSpec {
    pub values: Vec<String>,
    pub profiles: Vec<ProfileSpec>,
}

impl Default for CatalogSpec {
    fn default() -> Self {
        let values = ["Care", "Fairness", "Loyalty", "Authority", "Sanctity", "Liberty"];
        let profile = |name: &str, a: &str, b: &str| ProfileSpec {
            name: name.to_string(),
            focal: vec![a.to_string(), b.to_string()],
        };
        Self {
            values: values.iter().map(|v| v.to_string()).collect(),
            profiles: vec![
                profile("ProCare", "Care", "Fairness"),
                profile("ProTradition", "Authority", "Loyalty"),
                profile("FreeSpirit", "Sanctity", "Liberty"),
            ],
        }
    }
}

/// Immutable value/pair/profile catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    values: Vec<String>,
    value_index: HashMap<String, ValueId>,
    pairs: Vec<PairId>,
    pair_index: HashMap<String, PairId>,
    profiles: Vec<Profile>,
}

impl Catalog {
    pub fn from_spec(spec: &CatalogSpec) -> Result<Self> {
        if spec.values.len() < 2 {
            return Err(AnalysisError::invalid_config(
                "catalog needs at least two values",
            ));
        }
        if spec.values.len() > u8::MAX as usize {
            return Err(AnalysisError::invalid_config("catalog has too many values"));
        }

        let mut value_index = HashMap::with_capacity(spec.values.len());
        for (idx, name) in spec.values.iter().enumerate() {
            let name = name.trim();
            if name.is_empty() {
                return Err(AnalysisError::invalid_config("empty value name"));
            }
            if value_index
                .insert(name.to_string(), ValueId(idx as u8))
                .is_some()
            {
                return Err(AnalysisError::invalid_config(format!(
                    "duplicate value name: {name}"
                )));
            }
        }
        let values: Vec<String> = spec.values.iter().map(|v| v.trim().to_string()).collect();

        let mut pairs = Vec::new();
        let mut pair_index = HashMap::new();
        for i in 0..values.len() {
            for j in (i + 1)..values.len() {
                let canonical = PairId::new(ValueId(i as u8), ValueId(j as u8));
                pairs.push(canonical);
                // Both spellings resolve, each to its own orientation.
                for pair in [canonical, PairId::new(canonical.second, canonical.first)] {
                    let name = format!(
                        "{}{}",
                        values[pair.first.0 as usize], values[pair.second.0 as usize]
                    );
                    if let Some(prev) = pair_index.insert(name.clone(), pair) {
                        if prev != pair {
                            return Err(AnalysisError::invalid_config(format!(
                                "pair name {name} is ambiguous for this value set"
                            )));
                        }
                    }
                }
            }
        }

        let mut profiles = Vec::with_capacity(spec.profiles.len());
        for p in &spec.profiles {
            if p.focal.len() != 2 {
                return Err(AnalysisError::invalid_config(format!(
                    "profile {} must name exactly two focal values",
                    p.name
                )));
            }
            let a = lookup_value(&value_index, &p.focal[0])?;
            let b = lookup_value(&value_index, &p.focal[1])?;
            if a == b {
                return Err(AnalysisError::invalid_config(format!(
                    "profile {} repeats focal value {}",
                    p.name, p.focal[0]
                )));
            }
            profiles.push(Profile {
                name: p.name.clone(),
                focal: [a, b],
            });
        }

        Ok(Self {
            values,
            value_index,
            pairs,
            pair_index,
            profiles,
        })
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id.0 as usize]
    }

    pub fn value(&self, name: &str) -> Result<ValueId> {
        lookup_value(&self.value_index, name)
    }

    /// Canonical pairs, in catalog order (`i < j`).
    pub fn pairs(&self) -> &[PairId] {
        &self.pairs
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn pair_name(&self, pair: PairId) -> String {
        format!(
            "{}{}",
            self.value_name(pair.first),
            self.value_name(pair.second)
        )
    }

    /// Resolve a concatenated pair name by exact lookup.
    pub fn resolve_pair(&self, name: &str) -> Result<PairId> {
        self.pair_index
            .get(name.trim())
            .copied()
            .ok_or_else(|| AnalysisError::UnknownPair {
                name: name.trim().to_string(),
            })
    }

    pub fn display_pair(&self, pair: PairId) -> PairDisplay<'_> {
        PairDisplay {
            catalog: self,
            pair,
        }
    }
}

fn lookup_value(index: &HashMap<String, ValueId>, name: &str) -> Result<ValueId> {
    index
        .get(name.trim())
        .copied()
        .ok_or_else(|| AnalysisError::UnknownValue {
            name: name.trim().to_string(),
        })
}

pub struct PairDisplay<'a> {
    catalog: &'a Catalog,
    pair: PairId,
}

impl fmt::Display for PairDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.catalog.value_name(self.pair.first),
            self.catalog.value_name(self.pair.second)
        )
    }
}

//! Theory-profile signatures.
//!
//! For a profile with focal values `{a, b}`, a pair enters the signature only
//! when exactly one of its values is focal; it is oriented so that higher
//! always means "towards the focal value" (see [`Profile::orientation`]). A
//! participant's signature in a block is the mean of their oriented items in
//! that block; the baseline signature is built the same way from the
//! baseline battery.

use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::{skip_underdetermined, FitStatus};
use crate::catalog::{Catalog, Orientation, PairId, Profile};
use crate::config::BlockMap;
use crate::error::Result;
use crate::panel::BaselineTable;
use crate::report::{Cell, ReportTable, PRECISION_MEANS, PRECISION_STRUCTURE};
use crate::stats::{descriptive, DesignBuilder, Estimate, RegressionConfig};
use crate::table::NumericFrame;

/// Column suffix of the baseline signature in [`Signatures::to_frame`].
pub const BASELINE_SIGNATURE: &str = "P1";

const SIGNATURE: &str = "signature";

/// Mean of the present oriented items; `NaN` when none is present.
fn signature_row(items: &[(Vec<f64>, Orientation)], row: usize) -> f64 {
    let oriented: Vec<f64> = items.iter().map(|(v, o)| o.apply(v[row])).collect();
    descriptive::mean(&oriented)
}

/// Signature of every participant in `wide` for `profile` over the
/// `(pair, column)` items of one block.
pub fn block_signature(wide: &NumericFrame, items: &[(PairId, String)], profile: &Profile) -> Vec<f64> {
    let included: Vec<_> = items
        .iter()
        .filter_map(|(pair, column)| {
            let orientation = profile.orientation(*pair)?;
            let values = wide.column(column)?;
            Some((values.to_vec(), orientation))
        })
        .collect();
    if included.is_empty() {
        return vec![f64::NAN; wide.len()];
    }
    (0..wide.len()).map(|r| signature_row(&included, r)).collect()
}

/// Baseline signature for each id in `ids`.
pub fn baseline_signature(baseline: &BaselineTable, ids: &[String], profile: &Profile) -> Vec<f64> {
    let included: Vec<_> = baseline
        .pairs()
        .iter()
        .filter_map(|&pair| profile.orientation(pair).map(|o| (pair, o)))
        .collect();
    ids.iter()
        .map(|id| {
            let oriented: Vec<f64> = included
                .iter()
                .map(|(pair, o)| o.apply(baseline.value(id, *pair)))
                .collect();
            descriptive::mean(&oriented)
        })
        .collect()
}

/// Signatures per profile, per block and for the baseline.
#[derive(Debug, Clone, Serialize)]
pub struct Signatures {
    pub ids: Vec<String>,
    pub profiles: Vec<String>,
    pub blocks: Vec<String>,
    /// `[profile][block][participant]`.
    pub block: Vec<Vec<Vec<f64>>>,
    /// `[profile][participant]`.
    pub baseline: Vec<Vec<f64>>,
}

impl Signatures {
    pub fn compute(wide: &NumericFrame, baseline: &BaselineTable, blocks: &BlockMap, catalog: &Catalog) -> Self {
        let ids = wide.ids().to_vec();
        let mut block = Vec::new();
        let mut base = Vec::new();
        for profile in catalog.profiles() {
            block.push(
                blocks
                    .blocks()
                    .iter()
                    .map(|m| block_signature(wide, &m.items, profile))
                    .collect(),
            );
            base.push(baseline_signature(baseline, &ids, profile));
        }
        Self {
            ids,
            profiles: catalog.profiles().iter().map(|p| p.name.clone()).collect(),
            blocks: blocks.block_ids(),
            block,
            baseline: base,
        }
    }

    /// Wide frame with `<profile>_<block>` and `<profile>_P1` columns.
    pub fn to_frame(&self) -> Result<NumericFrame> {
        let mut names = Vec::new();
        let mut columns = Vec::new();
        for (p, profile) in self.profiles.iter().enumerate() {
            for (b, block) in self.blocks.iter().enumerate() {
                names.push(format!("{profile}_{block}"));
                columns.push(self.block[p][b].clone());
            }
            names.push(format!("{profile}_{BASELINE_SIGNATURE}"));
            columns.push(self.baseline[p].clone());
        }
        NumericFrame::new(self.ids.clone(), names, columns)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileMean {
    pub profile: String,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileBlockMean {
    pub profile: String,
    pub block: String,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSlope {
    pub profile: String,
    pub block: String,
    pub slope: Estimate,
    pub n_obs: usize,
    pub status: FitStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileAnalysis {
    pub signatures: Signatures,
    pub means: Vec<ProfileMean>,
    pub block_means: Vec<ProfileBlockMean>,
    pub slopes: Vec<ProfileSlope>,
}

/// Echo of the block signature on the baseline signature, one row per
/// participant, clustered by participant. Fewer than `min_obs` complete rows
/// leaves the slope undefined.
fn signature_slope(
    ids: &[String],
    y: &[f64],
    x: &[f64],
    label: &str,
    min_obs: usize,
    cfg: &RegressionConfig,
) -> Result<(Estimate, usize, FitStatus)> {
    let complete: Vec<usize> = (0..ids.len())
        .filter(|&i| y[i].is_finite() && x[i].is_finite())
        .collect();
    let n = complete.len();
    if n < min_obs {
        warn!(unit = %label, complete = n, needed = min_obs, "too few complete signatures; slope undefined");
        return Ok((
            Estimate::undefined(),
            n,
            FitStatus::Skipped(format!("{n} complete observations, {min_obs} needed")),
        ));
    }
    let fit = DesignBuilder::new(
        label,
        complete.iter().map(|&i| y[i]).collect(),
        complete.iter().map(|&i| ids[i].clone()).collect(),
    )
    .intercept()
    .numeric(SIGNATURE, complete.iter().map(|&i| x[i]).collect())
    .fit(cfg)
    .and_then(|f| f.coefficient(SIGNATURE));
    match skip_underdetermined(fit, label)? {
        Ok(est) => Ok((est, n, FitStatus::Ok)),
        Err(status) => Ok((Estimate::undefined(), n, status)),
    }
}

/// Signatures, profile means, profile x block means and within-profile echo
/// slopes.
pub fn theory_profiles(
    wide: &NumericFrame,
    baseline: &BaselineTable,
    blocks: &BlockMap,
    catalog: &Catalog,
    min_obs: usize,
    cfg: &RegressionConfig,
) -> Result<ProfileAnalysis> {
    let signatures = Signatures::compute(wide, baseline, blocks, catalog);
    let n = signatures.ids.len();

    let mut means = Vec::new();
    let mut block_means = Vec::new();
    let mut slopes = Vec::new();
    for (p, profile) in signatures.profiles.iter().enumerate() {
        let per_person: Vec<f64> = (0..n)
            .map(|i| {
                let across: Vec<f64> = signatures.block[p].iter().map(|b| b[i]).collect();
                descriptive::mean(&across)
            })
            .collect();
        means.push(ProfileMean {
            profile: profile.clone(),
            mean: descriptive::mean(&per_person),
        });

        for (b, block) in signatures.blocks.iter().enumerate() {
            let y = &signatures.block[p][b];
            block_means.push(ProfileBlockMean {
                profile: profile.clone(),
                block: block.clone(),
                mean: descriptive::mean(y),
            });
            let label = format!("{profile} {block}");
            let (slope, n_obs, status) =
                signature_slope(&signatures.ids, y, &signatures.baseline[p], &label, min_obs, cfg)?;
            slopes.push(ProfileSlope {
                profile: profile.clone(),
                block: block.clone(),
                slope,
                n_obs,
                status,
            });
        }
    }
    info!(
        profiles = signatures.profiles.len(),
        blocks = signatures.blocks.len(),
        fitted = slopes.iter().filter(|s| s.status.is_ok()).count(),
        "profile signatures analysed"
    );
    Ok(ProfileAnalysis {
        signatures,
        means,
        block_means,
        slopes,
    })
}

impl ProfileAnalysis {
    pub fn means_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_MEANS,
            &["Profile", "Mean signature (across blocks)"],
        );
        for m in &self.means {
            t.push_row(vec![Cell::text(&m.profile), m.mean.into()]);
        }
        t
    }

    pub fn block_means_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(caption, label, PRECISION_MEANS, &["Profile", "Block", "Mean signature"]);
        for m in &self.block_means {
            t.push_row(vec![Cell::text(&m.profile), Cell::text(&m.block), m.mean.into()]);
        }
        t
    }

    pub fn slopes_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_STRUCTURE,
            &["Profile", "Block", "$\\beta$", "SE", "CI lo", "CI hi", "$p$", "N"],
        );
        for s in &self.slopes {
            t.push_row(vec![
                Cell::text(&s.profile),
                Cell::text(&s.block),
                s.slope.estimate.into(),
                s.slope.se.into(),
                s.slope.ci_lo.into(),
                s.slope.ci_hi.into(),
                s.slope.p.into(),
                Cell::count(s.n_obs),
            ]);
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSpec;
    use crate::config::BlockMapping;
    use crate::table::Table;

    fn catalog() -> Catalog {
        Catalog::from_spec(&CatalogSpec::default()).unwrap()
    }

    fn pro_care(c: &Catalog) -> Profile {
        c.profiles()[0].clone()
    }

    #[test]
    fn orientation_keeps_first_and_inverts_second_focal_value() {
        let c = catalog();
        let cf = c.resolve_pair("CareFairness").unwrap();
        let ac = c.resolve_pair("AuthorityCare").unwrap();
        let cl = c.resolve_pair("CareLoyalty").unwrap();
        let wide = NumericFrame::new(
            vec!["a".into()],
            vec!["X-CF".into(), "X-AC".into(), "X-CL".into()],
            vec![vec![90.0], vec![30.0], vec![60.0]],
        )
        .unwrap();
        let items = vec![(cf, "X-CF".to_string()), (ac, "X-AC".to_string()), (cl, "X-CL".to_string())];
        // CareFairness has two focal values and is excluded; AuthorityCare
        // enters as 100 - 30.
        let sig = block_signature(&wide, &items, &pro_care(&c));
        assert_eq!(sig, vec![(70.0 + 60.0) / 2.0]);
    }

    #[test]
    fn custom_profile_uses_its_own_focal_set() {
        let spec = CatalogSpec {
            profiles: vec![crate::catalog::ProfileSpec {
                name: "CareSanctity".into(),
                focal: vec!["Care".into(), "Sanctity".into()],
            }],
            ..CatalogSpec::default()
        };
        let c = Catalog::from_spec(&spec).unwrap();
        let cf = c.resolve_pair("CareFairness").unwrap();
        let cs = c.resolve_pair("CareSanctity").unwrap();
        let fs = c.resolve_pair("FairnessSanctity").unwrap();
        let wide = NumericFrame::new(
            vec!["a".into()],
            vec!["CF".into(), "CS".into(), "FS".into()],
            vec![vec![20.0], vec![50.0], vec![10.0]],
        )
        .unwrap();
        let items = vec![(cf, "CF".to_string()), (cs, "CS".to_string()), (fs, "FS".to_string())];
        let sig = block_signature(&wide, &items, &c.profiles()[0]);
        assert_eq!(sig, vec![(20.0 + 90.0) / 2.0]);
    }

    #[test]
    fn missing_items_are_skipped_and_empty_signature_is_nan() {
        let c = catalog();
        let ac = c.resolve_pair("AuthorityCare").unwrap();
        let cl = c.resolve_pair("CareLoyalty").unwrap();
        let wide = NumericFrame::new(
            vec!["a".into(), "b".into()],
            vec!["AC".into(), "CL".into()],
            vec![vec![40.0, f64::NAN], vec![f64::NAN, f64::NAN]],
        )
        .unwrap();
        let items = vec![(ac, "AC".to_string()), (cl, "CL".to_string())];
        let sig = block_signature(&wide, &items, &pro_care(&c));
        assert_eq!(sig[0], 60.0);
        assert!(sig[1].is_nan());
    }

    #[test]
    fn slopes_need_enough_complete_signatures() {
        let c = catalog();
        let pairs: Vec<PairId> = c.pairs().to_vec();
        let n = 30;
        let ids: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();

        let mut csv = String::from("ResponseId");
        for &p in &pairs {
            csv.push_str(&format!(",P1Q-{}_MEAN", c.pair_name(p)));
        }
        csv.push('\n');
        let mut names = Vec::new();
        let mut columns = Vec::new();
        for &p in &pairs {
            names.push(format!("QH1-{}", c.pair_name(p)));
            columns.push(Vec::with_capacity(n));
        }
        for (i, id) in ids.iter().enumerate() {
            csv.push_str(id);
            for (k, col) in columns.iter_mut().enumerate() {
                let base = ((i * 13 + k * 7) % 80) as f64 + 10.0;
                csv.push_str(&format!(",{base}"));
                col.push(0.6 * base + 20.0 + ((i + k) % 3) as f64);
            }
            csv.push('\n');
        }
        let table = Table::from_reader(csv.as_bytes(), b',', 1).unwrap();
        let baseline = BaselineTable::from_table(&table, "ResponseId", "P1Q-", &pairs, &c).unwrap();
        let wide = NumericFrame::new(ids, names.clone(), columns).unwrap();
        let blocks = BlockMap::new(vec![BlockMapping {
            block: "QH1".into(),
            items: pairs.iter().copied().zip(names).collect(),
        }]);

        let res = theory_profiles(&wide, &baseline, &blocks, &c, 10, &RegressionConfig::default()).unwrap();
        assert_eq!(res.slopes.len(), 3);
        assert!(res.slopes.iter().all(|s| s.status.is_ok() && s.slope.estimate.is_finite()));
        assert_eq!(res.block_means.len(), 3);

        let strict = theory_profiles(&wide, &baseline, &blocks, &c, 31, &RegressionConfig::default()).unwrap();
        assert!(strict.slopes.iter().all(|s| s.slope.estimate.is_nan() && !s.status.is_ok()));
        assert_eq!(strict.means_report("m", "tab:profile_main").rows.len(), 3);
    }
}

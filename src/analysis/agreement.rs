//! Baseline vs multi-block agreement per pair, as ICC(2,1).

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::BlockMap;
use crate::panel::BaselineTable;
use crate::report::{Cell, ReportTable, PRECISION_STRUCTURE};
use crate::stats::descriptive;
use crate::stats::icc_2_1;
use crate::table::NumericFrame;

#[derive(Debug, Clone, Serialize)]
pub struct AgreementRow {
    pub pair: String,
    pub icc: f64,
    /// Participants with both the baseline and at least one block rating.
    pub n_complete: usize,
    /// Block columns averaged for this pair.
    pub n_blocks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgreementTable {
    pub rows: Vec<AgreementRow>,
}

/// ICC(2,1) between the baseline rating and the mean block rating of each
/// pair, sorted by ICC descending (undefined last).
pub fn pair_agreement(
    wide: &NumericFrame,
    baseline: &BaselineTable,
    blocks: &BlockMap,
    catalog: &Catalog,
) -> AgreementTable {
    let mut pairs: Vec<_> = blocks.pairs();
    pairs.sort_by_key(|p| catalog.pair_name(*p));

    let mut rows = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let name = catalog.pair_name(pair);
        let columns: Vec<&[f64]> = blocks
            .blocks()
            .iter()
            .filter_map(|b| b.column(pair))
            .filter_map(|c| wide.column(c))
            .collect();
        if columns.len() < 2 {
            warn!(pair = %name, columns = columns.len(), "pair has fewer than two block columns");
        }
        let block_mean: Vec<f64> = (0..wide.len())
            .map(|r| descriptive::mean(&columns.iter().map(|c| c[r]).collect::<Vec<_>>()))
            .collect();
        let base: Vec<f64> = wide.ids().iter().map(|id| baseline.value(id, pair)).collect();
        let n_complete = base
            .iter()
            .zip(&block_mean)
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .count();
        let icc = icc_2_1(&base, &block_mean);
        if icc.is_nan() {
            warn!(pair = %name, n_complete, "ICC undefined");
        }
        rows.push(AgreementRow {
            pair: name,
            icc,
            n_complete,
            n_blocks: columns.len(),
        });
    }
    rows.sort_by(|a, b| match (a.icc.is_nan(), b.icc.is_nan()) {
        (false, false) => b.icc.partial_cmp(&a.icc).unwrap_or(Ordering::Equal),
        (x, y) => x.cmp(&y),
    });
    info!(
        pairs = rows.len(),
        defined = rows.iter().filter(|r| r.icc.is_finite()).count(),
        "pair agreement computed"
    );
    AgreementTable { rows }
}

impl AgreementTable {
    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_STRUCTURE,
            &["Pair", "ICC(2,1)", "$N$", "Blocks"],
        );
        for row in &self.rows {
            t.push_row(vec![
                Cell::text(&row.pair),
                row.icc.into(),
                Cell::count(row.n_complete),
                Cell::count(row.n_blocks),
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

    #[test]
    fn identical_ratings_agree_perfectly_and_sparse_pairs_are_undefined() {
        let c = Catalog::from_spec(&CatalogSpec::default()).unwrap();
        let cf = c.resolve_pair("CareFairness").unwrap();
        let cl = c.resolve_pair("CareLoyalty").unwrap();
        let ids: Vec<String> = (0..5).map(|i| format!("r{i}")).collect();
        let v = vec![10.0, 30.0, 50.0, 70.0, 90.0];
        let wide = NumericFrame::new(
            ids.clone(),
            vec!["A-CF".into(), "B-CF".into(), "A-CL".into()],
            vec![v.clone(), v.clone(), vec![1.0, f64::NAN, f64::NAN, f64::NAN, 2.0]],
        )
        .unwrap();
        let blocks = BlockMap::new(vec![
            BlockMapping {
                block: "A".into(),
                items: vec![(cf, "A-CF".into()), (cl, "A-CL".into())],
            },
            BlockMapping {
                block: "B".into(),
                items: vec![(cf, "B-CF".into())],
            },
        ]);
        let mut csv = String::from("ResponseId,P1Q-CareFairness_MEAN,P1Q-CareLoyalty_MEAN\n");
        for (id, x) in ids.iter().zip(&v) {
            csv.push_str(&format!("{id},{x},{x}\n"));
        }
        let table = Table::from_reader(csv.as_bytes(), b',', 1).unwrap();
        let baseline = BaselineTable::from_table(&table, "ResponseId", "P1Q-", &[cf, cl], &c).unwrap();

        let res = pair_agreement(&wide, &baseline, &blocks, &c);
        assert_eq!(res.rows[0].pair, "CareFairness");
        assert!((res.rows[0].icc - 1.0).abs() < 1e-12);
        assert_eq!(res.rows[0].n_blocks, 2);
        assert_eq!(res.rows[1].pair, "CareLoyalty");
        assert!(res.rows[1].icc.is_nan());
        assert_eq!(res.rows[1].n_complete, 2);
    }
}

//! Block-level internal structure: ω_total and PCA variance shares.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BlockMap;
use crate::error::Result;
use crate::report::{Cell, ReportTable, PRECISION_STRUCTURE};
use crate::stats::reliability::OMEGA_MIN_ITEMS;
use crate::stats::{omega_pca, OmegaPca};
use crate::table::NumericFrame;

#[derive(Debug, Clone, Serialize)]
pub struct StructureRow {
    pub block: String,
    pub omega_total: f64,
    pub pc1_pct: f64,
    pub pc2_pct: f64,
    pub n_items: usize,
    pub n_complete: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructureTable {
    pub rows: Vec<StructureRow>,
}

/// One row per block with at least three mapped items present, sorted by
/// block id. A block with too few complete rows is kept with undefined
/// statistics.
pub fn block_structure(wide: &NumericFrame, blocks: &BlockMap) -> Result<StructureTable> {
    let mut rows = Vec::new();
    for mapping in blocks.blocks() {
        let items: Vec<Vec<f64>> = mapping
            .columns()
            .filter_map(|c| wide.column(c))
            .map(<[f64]>::to_vec)
            .collect();
        if items.len() < OMEGA_MIN_ITEMS {
            warn!(block = %mapping.block, items = items.len(), "too few items; block skipped");
            continue;
        }
        let stats = match omega_pca(&items) {
            Ok(s) => s,
            Err(e) if e.is_underdetermined() => {
                warn!(block = %mapping.block, error = %e, "structure undefined");
                OmegaPca {
                    omega_total: f64::NAN,
                    pc1_pct: f64::NAN,
                    pc2_pct: f64::NAN,
                    n_complete: 0,
                    n_items: items.len(),
                }
            }
            Err(e) => return Err(e),
        };
        rows.push(StructureRow {
            block: mapping.block.clone(),
            omega_total: stats.omega_total,
            pc1_pct: stats.pc1_pct,
            pc2_pct: stats.pc2_pct,
            n_items: stats.n_items,
            n_complete: stats.n_complete,
        });
    }
    rows.sort_by(|a, b| a.block.cmp(&b.block));
    info!(blocks = rows.len(), "block structure computed");
    Ok(StructureTable { rows })
}

impl StructureTable {
    pub fn to_report(&self, caption: &str, label: &str) -> ReportTable {
        let mut t = ReportTable::new(
            caption,
            label,
            PRECISION_STRUCTURE,
            &[
                "Block",
                "McDonald's $\\omega_{\\text{total}}$",
                "\\% variance PC1",
                "\\% variance PC2",
                "Items",
                "$N$",
            ],
        );
        for row in &self.rows {
            t.push_row(vec![
                Cell::text(&row.block),
                row.omega_total.into(),
                row.pc1_pct.into(),
                row.pc2_pct.into(),
                Cell::count(row.n_items),
                Cell::count(row.n_complete),
            ]);
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogSpec};
    use crate::config::BlockMapping;

    #[test]
    fn blocks_with_few_items_are_skipped_and_few_rows_are_undefined() {
        let c = Catalog::from_spec(&CatalogSpec::default()).unwrap();
        let pairs = c.pairs();
        let n = 8;
        let ids: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
        let base: Vec<f64> = (0..n).map(|i| (i * 9 % 8) as f64 * 10.0).collect();
        let mut names = Vec::new();
        let mut cols = Vec::new();
        for j in 0..3 {
            names.push(format!("A{j}"));
            cols.push(base.iter().enumerate().map(|(i, v)| v + ((i + j) % 3) as f64).collect());
        }
        for j in 0..3 {
            names.push(format!("B{j}"));
            let mut col: Vec<f64> = base.clone();
            for v in col.iter_mut().skip(j * 3).take(3) {
                *v = f64::NAN;
            }
            cols.push(col);
        }
        names.push("C0".into());
        cols.push(base.clone());
        let wide = NumericFrame::new(ids, names, cols).unwrap();
        let mapping = |block: &str, prefix: &str, count: usize| BlockMapping {
            block: block.into(),
            items: (0..count).map(|j| (pairs[j], format!("{prefix}{j}"))).collect(),
        };
        let blocks = BlockMap::new(vec![mapping("QH2", "B", 3), mapping("QH1", "A", 3), mapping("QH3", "C", 1)]);

        let res = block_structure(&wide, &blocks).unwrap();
        assert_eq!(res.rows.len(), 2);
        assert_eq!(res.rows[0].block, "QH1");
        assert!(res.rows[0].omega_total > 0.9);
        assert_eq!(res.rows[0].n_complete, 8);
        assert!(res.rows[1].omega_total.is_nan());
    }
}

//! Result tables: fixed-precision LaTeX with caption and label, plus a JSON
//! rendering of the same rows.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{AnalysisError, Result};
use crate::table::ensure_parent;

/// Precision used for the echo, robustness, agreement and context tables.
pub const PRECISION_SLOPES: usize = 4;
/// Precision used for the structure, clustering and profile-slope tables.
pub const PRECISION_STRUCTURE: usize = 3;
/// Precision used for the profile mean tables.
pub const PRECISION_MEANS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(f64),
    Integer(i64),
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        Cell::Text(s.into())
    }

    pub fn count(n: usize) -> Self {
        Cell::Integer(n as i64)
    }

    fn render(&self, precision: usize) -> String {
        match self {
            Cell::Text(s) => escape_latex(s),
            Cell::Number(v) if v.is_finite() => format!("{v:.precision$}"),
            Cell::Number(_) => String::new(),
            Cell::Integer(i) => i.to_string(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Number(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
            Cell::Integer(i) => Value::from(*i),
        }
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Number(v)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

/// A captioned result table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportTable {
    pub caption: String,
    pub label: String,
    pub precision: usize,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ReportTable {
    pub fn new(caption: &str, label: &str, precision: usize, headers: &[&str]) -> Self {
        Self {
            caption: caption.to_string(),
            label: label.to_string(),
            precision,
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.headers.len());
        self.rows.push(row);
    }

    fn alignment(&self) -> String {
        (0..self.headers.len())
            .map(|c| {
                let textual = self
                    .rows
                    .iter()
                    .any(|r| matches!(r.get(c), Some(Cell::Text(_))));
                if textual || self.rows.is_empty() {
                    'l'
                } else {
                    'r'
                }
            })
            .collect()
    }

    pub fn render_latex(&self) -> String {
        let mut out = String::new();
        out.push_str("\\begin{table}[htbp]\n\\centering\n");
        let _ = writeln!(out, "\\begin{{tabular}}{{{}}}", self.alignment());
        out.push_str("\\toprule\n");
        let _ = writeln!(out, "{} \\\\", self.headers.join(" & "));
        out.push_str("\\midrule\n");
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|c| c.render(self.precision)).collect();
            let _ = writeln!(out, "{} \\\\", cells.join(" & "));
        }
        out.push_str("\\bottomrule\n\\end{tabular}\n\n");
        let _ = writeln!(out, "\\caption{{{}}}", self.caption);
        let _ = writeln!(out, "\\label{{{}}}", self.label);
        out.push_str("\\end{table}\n");
        out
    }

    pub fn write_latex(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        fs::write(path, self.render_latex()).map_err(|e| AnalysisError::io(path, e))
    }

    /// Rows as objects keyed by header; undefined numbers become `null`.
    pub fn to_json(&self) -> Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = Map::new();
                for (h, c) in self.headers.iter().zip(row) {
                    obj.insert(h.clone(), c.to_json());
                }
                Value::Object(obj)
            })
            .collect();
        let mut doc = Map::new();
        doc.insert("caption".into(), Value::String(self.caption.clone()));
        doc.insert("label".into(), Value::String(self.label.clone()));
        doc.insert("rows".into(), Value::Array(rows));
        Value::Object(doc)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let body = serde_json::to_string_pretty(&self.to_json())?;
        fs::write(path, body).map_err(|e| AnalysisError::io(path, e))
    }
}

/// Escape LaTeX specials in data cells. Headers and captions are authored
/// as LaTeX and left alone.
fn escape_latex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' | '%' | '_' | '#' | '$' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

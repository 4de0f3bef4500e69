//! In-memory tables: raw string tables read from survey exports, and
//! participant-indexed numeric frames used by the analysis stages.

use std::fs;
use std::io::Read;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use csv::{ReaderBuilder, WriterBuilder};

use crate::error::{AnalysisError, Result};

/// Separator used when two header rows are flattened into one name.
pub const HEADER_SEPARATOR: &str = " | ";

/// Options for reading an export.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Number of header rows (1 or 2). `None` picks 2 for spreadsheets and 1
    /// for delimited text.
    pub header_rows: Option<usize>,
    /// Sheet name, or zero-based sheet index, for spreadsheets.
    pub sheet: Option<String>,
}

/// A table of string cells with flattened column names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, String::new());
                r
            })
            .collect();
        Self { headers, rows }
    }

    /// Read a delimited-text or spreadsheet file, chosen by extension.
    pub fn read(path: impl AsRef<Path>, opts: &ReadOptions) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => {
                read_workbook(path, opts.sheet.as_deref(), opts.header_rows.unwrap_or(2))
            }
            _ => {
                let delimiter = if ext == "tsv" { b'\t' } else { b',' };
                let file = fs::File::open(path).map_err(|e| AnalysisError::io(path, e))?;
                Self::from_reader(file, delimiter, opts.header_rows.unwrap_or(1))
            }
        }
    }

    pub fn from_reader<R: Read>(reader: R, delimiter: u8, header_rows: usize) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(reader);

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record?;
            records.push(record.iter().map(|c| c.to_string()).collect::<Vec<_>>());
        }
        Self::from_records(records, header_rows)
    }

    fn from_records(mut records: Vec<Vec<String>>, header_rows: usize) -> Result<Self> {
        if !(1..=2).contains(&header_rows) {
            return Err(AnalysisError::invalid_config(format!(
                "header_rows must be 1 or 2, got {header_rows}"
            )));
        }
        if records.len() < header_rows {
            return Err(AnalysisError::InsufficientData {
                context: "export header".to_string(),
                needed: header_rows,
                got: records.len(),
            });
        }
        let body = records.split_off(header_rows);
        let headers = if header_rows == 2 {
            flatten_headers(&records[0], &records[1])
        } else {
            records[0].iter().map(|h| h.trim().to_string()).collect()
        };
        Ok(Self::new(headers, body))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Locate a column by exact name, or by the first segment of a flattened
    /// two-row header (`"ResponseId | Response ID"` answers to `ResponseId`).
    pub fn find_column(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.headers.iter().position(|h| h == name).or_else(|| {
            self.headers
                .iter()
                .position(|h| h.split(HEADER_SEPARATOR).next().map(str::trim) == Some(name))
        })
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.find_column(name)
            .ok_or_else(|| AnalysisError::missing_column(name))
    }

    pub fn text(&self, col: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(move |r| r[col].as_str())
    }

    /// Coerce a column to numbers; unparseable cells become `NaN`.
    pub fn numeric(&self, col: usize) -> Vec<f64> {
        self.text(col).map(parse_numeric).collect()
    }

    /// Keep the rows at `indices`, in that order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            headers: self.headers.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// Append a text column; `values` must have one entry per row.
    pub fn push_column(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(AnalysisError::invalid_config(format!(
                "column {name} has {} values for {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        self.headers.push(name.to_string());
        for (row, v) in self.rows.iter_mut().zip(values) {
            row.push(v);
        }
        Ok(())
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let mut writer = WriterBuilder::new()
            .from_path(path)
            .map_err(|e| csv_io(path, e))?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush().map_err(|e| AnalysisError::io(path, e))?;
        Ok(())
    }
}

/// Join two header rows per column, dropping empty parts.
pub fn flatten_headers(top: &[String], second: &[String]) -> Vec<String> {
    let width = top.len().max(second.len());
    (0..width)
        .map(|i| {
            let parts: Vec<&str> = [top.get(i), second.get(i)]
                .into_iter()
                .flatten()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                format!("column_{i}")
            } else {
                parts.join(HEADER_SEPARATOR)
            }
        })
        .collect()
}

/// Trimmed `f64` parse; empty, unparseable and non-finite cells are `NaN`.
pub fn parse_numeric(cell: &str) -> f64 {
    match cell.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => f64::NAN,
    }
}

fn read_workbook(path: &Path, sheet: Option<&str>, header_rows: usize) -> Result<Table> {
    let workbook_err = |message: String| AnalysisError::Workbook {
        path: path.to_path_buf(),
        message,
    };
    let mut workbook = open_workbook_auto(path).map_err(|e| workbook_err(e.to_string()))?;
    let names = workbook.sheet_names();
    let name = match sheet {
        None => names.first().cloned(),
        Some(s) if names.iter().any(|n| n == s) => Some(s.to_string()),
        Some(s) => s.parse::<usize>().ok().and_then(|i| names.get(i).cloned()),
    }
    .ok_or_else(|| workbook_err(format!("sheet {} not found", sheet.unwrap_or("0"))))?;

    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| workbook_err(e.to_string()))?;
    let records = range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();
    Table::from_records(records, header_rows)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------
//  Numeric frame
// ---------------------------------------------------------------------

/// Numeric columns indexed by participant id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NumericFrame {
    ids: Vec<String>,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl NumericFrame {
    pub fn new(ids: Vec<String>, names: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self> {
        if names.len() != columns.len() {
            return Err(AnalysisError::invalid_config(
                "frame column names and data disagree",
            ));
        }
        if let Some((name, _)) = names
            .iter()
            .zip(&columns)
            .find(|(_, c)| c.len() != ids.len())
        {
            return Err(AnalysisError::invalid_config(format!(
                "frame column {name} has the wrong length"
            )));
        }
        Ok(Self {
            ids,
            names,
            columns,
        })
    }

    /// Extract `columns` (coerced) keyed by `id_column`.
    pub fn from_table(table: &Table, id_column: &str, columns: &[String]) -> Result<Self> {
        let id_idx = table.column_index(id_column)?;
        let ids = table.text(id_idx).map(|s| s.trim().to_string()).collect();
        let mut data = Vec::with_capacity(columns.len());
        for name in columns {
            data.push(table.numeric(table.column_index(name)?));
        }
        Self::new(ids, columns.to_vec(), data)
    }

    pub fn read_csv(path: impl AsRef<Path>, id_column: &str) -> Result<Self> {
        let table = Table::read(path, &ReadOptions::default())?;
        let id_idx = table.column_index(id_column)?;
        let names: Vec<String> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id_idx)
            .map(|(_, h)| h.clone())
            .collect();
        Self::from_table(&table, id_column, &names)
    }

    pub fn write_csv(&self, path: impl AsRef<Path>, id_header: &str) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let mut writer = WriterBuilder::new()
            .from_path(path)
            .map_err(|e| csv_io(path, e))?;
        let mut header = vec![id_header.to_string()];
        header.extend(self.names.iter().cloned());
        writer.write_record(&header)?;
        for (row, id) in self.ids.iter().enumerate() {
            let mut record = vec![id.clone()];
            record.extend(self.columns.iter().map(|c| format_cell(c[row])));
            writer.write_record(&record)?;
        }
        writer.flush().map_err(|e| AnalysisError::io(path, e))?;
        Ok(())
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }

    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| AnalysisError::missing_column(name))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter().map(Vec::as_slice))
    }

    /// Values of `names` for participant row `row`.
    pub fn row_values(&self, row: usize, names: &[String]) -> Vec<f64> {
        names
            .iter()
            .map(|n| self.column(n).map_or(f64::NAN, |c| c[row]))
            .collect()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|i| i == id)
    }

    /// Same ids, columns replaced.
    pub fn with_columns(&self, names: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self> {
        Self::new(self.ids.clone(), names, columns)
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            ids: rows.iter().map(|&r| self.ids[r].clone()).collect(),
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| rows.iter().map(|&r| c[r]).collect())
                .collect(),
        }
    }
}

/// Empty for `NaN`, shortest round-trip representation otherwise.
pub fn format_cell(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        v.to_string()
    }
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| AnalysisError::io(parent, e))?;
        }
    }
    Ok(())
}

fn csv_io(path: &Path, e: csv::Error) -> AnalysisError {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => AnalysisError::io(path, io),
            other => AnalysisError::invalid_config(format!("{}: {other:?}", path.display())),
        }
    } else {
        AnalysisError::Csv(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_header_rows_are_flattened_and_found_by_first_segment() {
        let raw = "ResponseId,Finished,QH1-CareFairness_1\n\
                   Response ID, ,Care vs Fairness\n\
                   R_1,True,55\n\
                   R_2,False,oops\n";
        let table = Table::from_reader(raw.as_bytes(), b',', 2).unwrap();
        assert_eq!(
            table.headers(),
            &[
                "ResponseId | Response ID".to_string(),
                "Finished".to_string(),
                "QH1-CareFairness_1 | Care vs Fairness".to_string(),
            ]
        );
        assert_eq!(table.find_column("ResponseId"), Some(0));
        assert_eq!(table.find_column("QH1-CareFairness_1"), Some(2));

        let values = table.numeric(2);
        assert_eq!(values[0], 55.0);
        assert!(values[1].is_nan());
    }

    #[test]
    fn short_rows_are_padded() {
        let raw = "a,b,c\n1,2\n";
        let table = Table::from_reader(raw.as_bytes(), b',', 1).unwrap();
        assert_eq!(table.rows()[0], vec!["1", "2", ""]);
        assert!(table.numeric(2)[0].is_nan());
    }

    #[test]
    fn numeric_parse_rejects_non_finite() {
        assert_eq!(parse_numeric(" 42.5 "), 42.5);
        assert!(parse_numeric("inf").is_nan());
        assert!(parse_numeric("NaN").is_nan());
        assert!(parse_numeric("").is_nan());
    }

    #[test]
    fn frame_csv_round_trip_keeps_missing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.csv");
        let frame = NumericFrame::new(
            vec!["a".into(), "b".into()],
            vec!["x".into()],
            vec![vec![1.5, f64::NAN]],
        )
        .unwrap();
        frame.write_csv(&path, "participant_id").unwrap();
        let back = NumericFrame::read_csv(&path, "participant_id").unwrap();
        assert_eq!(back.ids(), frame.ids());
        let x = back.column("x").unwrap();
        assert_eq!(x[0], 1.5);
        assert!(x[1].is_nan());
    }
}

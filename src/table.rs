//! In-memory spreadsheet model for the harvest artifacts.
//!
//! Sheets travel as `.xlsx` bytes: the upstream exports them, the pipeline
//! filters and enriches them, the artifact store persists them. Cells are
//! plain strings throughout — in particular the literal `"N/A"` is a value,
//! never a missing cell.

use std::io::Cursor;

use anyhow::Context;
use calamine::{Data, Reader, Xlsx};

/// Literal placeholder value used across all appended columns.
pub const NA: &str = "N/A";

/// Input column: hold status, kept only when "NO".
pub const COL_HOLDS: &str = "Holds";
/// Input column: pregate ticket, kept only when it still reads N/A.
pub const COL_PREGATE_TICKET: &str = "Pregate Ticket#";
/// Input column: IMPORT or EXPORT.
pub const COL_TRADE_TYPE: &str = "Trade Type";
/// Input column: container id.
pub const COL_CONTAINER: &str = "Container #";
/// Input column: current location terminal code.
pub const COL_CURRENT_LOC: &str = "CurrentLoc";
/// Input column: origin terminal code (import fallback).
pub const COL_ORIGIN: &str = "Origin";
/// Input column: destination terminal code (export fallback).
pub const COL_DESTINATION: &str = "Destination";

/// Appended column: manifested milestone date.
pub const COL_MANIFESTED: &str = "Manifested";
/// Appended column: earliest slot seen before pregate (PICK FULL probes).
pub const COL_FIRST_APPT_BEFORE: &str = "First Appointment Available (Before)";
/// Appended column: departed-terminal milestone date.
pub const COL_DEPARTED_TERMINAL: &str = "Departed Terminal";
/// Appended column: earliest slot seen after pregate (DROP EMPTY probes).
pub const COL_FIRST_APPT_AFTER: &str = "First Appointment Available (After)";
/// Appended column: empty-received milestone date.
pub const COL_EMPTY_RECEIVED: &str = "Empty Received";

/// The five output columns stage 2 appends, in sheet order.
pub const APPENDED_COLUMNS: [&str; 5] = [
    COL_MANIFESTED,
    COL_FIRST_APPT_BEFORE,
    COL_DEPARTED_TERMINAL,
    COL_FIRST_APPT_AFTER,
    COL_EMPTY_RECEIVED,
];

/// A rectangular sheet of string cells with a header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table from explicit headers and rows.
    ///
    /// Short rows are padded with empty cells to the header width.
    pub fn new(headers: Vec<String>, mut rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        for row in &mut rows {
            row.resize(width, String::new());
        }
        Self { headers, rows }
    }

    /// Parse the first worksheet of an `.xlsx` byte buffer.
    ///
    /// The first row becomes the header; all cells are rendered to strings.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a readable workbook or the
    /// workbook has no sheet.
    pub fn from_xlsx_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut workbook =
            Xlsx::new(Cursor::new(bytes.to_vec())).context("failed to open xlsx workbook")?;
        let range = workbook
            .worksheet_range_at(0)
            .context("workbook has no sheets")?
            .context("failed to read first worksheet")?;

        let mut iter = range.rows();
        let headers: Vec<String> = iter
            .next()
            .map(|row| row.iter().map(cell_to_string).collect())
            .unwrap_or_default();
        let width = headers.len();

        let rows = iter
            .map(|row| {
                let mut cells: Vec<String> = row.iter().map(cell_to_string).collect();
                cells.resize(width.max(cells.len()), String::new());
                cells
            })
            .collect();

        Ok(Self::new(headers, rows))
    }

    /// Serialize to `.xlsx` bytes with a single worksheet.
    ///
    /// # Errors
    ///
    /// Returns an error if the workbook cannot be assembled.
    pub fn to_xlsx_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();

        for (col, header) in self.headers.iter().enumerate() {
            let col = u16::try_from(col).context("too many columns for xlsx")?;
            sheet
                .write_string(0, col, header.as_str())
                .context("failed to write header cell")?;
        }
        for (row_idx, row) in self.rows.iter().enumerate() {
            let sheet_row =
                u32::try_from(row_idx.saturating_add(1)).context("too many rows for xlsx")?;
            for (col, cell) in row.iter().enumerate() {
                let col = u16::try_from(col).context("too many columns for xlsx")?;
                sheet
                    .write_string(sheet_row, col, cell.as_str())
                    .context("failed to write data cell")?;
            }
        }

        workbook
            .save_to_buffer()
            .context("failed to serialize workbook")
    }

    /// Header names in sheet order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Number of data rows (header excluded).
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Borrow a data row by index.
    pub fn row(&self, index: usize) -> Option<&[String]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Find a column by header name, case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }

    /// Cell value by row index and header name; empty cells yield `""`.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(col)).map(String::as_str)
    }

    /// Set a cell by row index and header name.
    ///
    /// Unknown columns and out-of-range rows are ignored; stage code only
    /// writes columns it appended itself.
    pub fn set_value(&mut self, row: usize, column: &str, value: impl Into<String>) {
        if let Some(col) = self.column_index(column) {
            if let Some(cells) = self.rows.get_mut(row) {
                if let Some(cell) = cells.get_mut(col) {
                    *cell = value.into();
                }
            }
        }
    }

    /// Append a column with every cell initialized to `fill`.
    pub fn append_column(&mut self, name: &str, fill: &str) {
        self.headers.push(name.to_owned());
        for row in &mut self.rows {
            row.push(fill.to_owned());
        }
    }

    /// Keep only the rows for which `keep` returns true.
    pub fn retain_rows<F: FnMut(&Table, usize) -> bool>(&mut self, mut keep: F) {
        let mut kept_indices = Vec::new();
        for i in 0..self.rows.len() {
            if keep(self, i) {
                kept_indices.push(i);
            }
        }
        let mut kept = Vec::with_capacity(kept_indices.len());
        for i in kept_indices {
            kept.push(self.rows[i].clone());
        }
        self.rows = kept;
    }
}

/// Render a calamine cell to the string the target site showed.
///
/// Excel stores whole-number cells as floats; those print without the
/// trailing `.0` so container counts and ticket numbers read as typed.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 => format!("{f:.0}"),
        other => other.to_string(),
    }
}

#![cfg(feature = "excel")]

use std::path::Path;

use calamine::{Data, Reader, open_workbook_auto};

use crate::error::{PipelineError, PipelineResult};

/// One worksheet row rendered as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    /// 1-based row number as shown by spreadsheet applications.
    pub number: usize,
    pub cells: Vec<String>,
}

impl SheetRow {
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }
}

/// Read every row of the first worksheet of `path` (`.xlsx`, `.xls`, `.xlsm`, `.ods`).
///
/// Empty cells become empty strings; numbers that are whole are rendered without a fractional
/// part.
pub fn read_first_sheet(path: impl AsRef<Path>) -> PipelineResult<Vec<SheetRow>> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::Unreadable {
            message: "workbook has no sheets".to_string(),
        })?;
    let range = workbook.worksheet_range(&sheet)?;
    let first_row = range.start().map(|(r, _)| r as usize).unwrap_or(0);

    Ok(range
        .rows()
        .enumerate()
        .map(|(idx0, row)| SheetRow {
            number: first_row + idx0 + 1,
            cells: row.iter().map(cell_to_string).collect(),
        })
        .collect())
}

fn cell_to_string(c: &Data) -> String {
    match c {
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_floats_render_as_integers() {
        assert_eq!(cell_to_string(&Data::Float(612345678.0)), "612345678");
        assert_eq!(cell_to_string(&Data::Float(1.5)), "1.5");
        assert_eq!(cell_to_string(&Data::Empty), "");
        assert_eq!(cell_to_string(&Data::String("a@b.com".into())), "a@b.com");
    }

    #[test]
    fn blank_rows_are_detected() {
        let row = SheetRow {
            number: 3,
            cells: vec![" ".to_string(), String::new()],
        };
        assert!(row.is_blank());
    }
}

//! Supported input kinds, detected by file extension.

use std::path::Path;

/// Suffix used by upload/extraction collaborators for files still being written.
pub const IN_PROGRESS_SUFFIX: &str = ".uploading";

/// Input file kinds the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Delimited text (`.csv`, `.tsv`, `.psv`, `.dat`, `.data`, `.txt`).
    Text,
    /// Spreadsheet/workbook (`.xls`, `.xlsx`, `.xlsm`, `.ods`).
    Spreadsheet,
}

impl FileKind {
    /// Parse a file kind from an extension (case-insensitive, without the leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "psv" | "dat" | "data" | "txt" => Some(Self::Text),
            "xls" | "xlsx" | "xlsm" | "ods" => Some(Self::Spreadsheet),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// The extension of `path` as written (`".PDF"`, `""` when there is none).
pub fn display_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default()
}

/// Whether the inbound scan should pick up `path`.
pub fn is_ingestible(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    !name.ends_with(IN_PROGRESS_SUFFIX) && !name.starts_with('.') && FileKind::from_path(path).is_some()
}

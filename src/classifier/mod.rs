//! File classification: readability, encoding, tabular shape and known-header coverage.
//!
//! [`classify_file`] never returns an error. Every rejection is reported on the returned
//! [`ClassificationResult`] with `is_tabular = false` and a human-readable reason.

pub mod known_headers;
pub mod tabular;

use std::io::ErrorKind;
use std::path::Path;

use tracing::{info, warn};

use crate::config::ClassifierConfig;
use crate::ingestion::encoding::resolve_encoding;
use crate::ingestion::format::{FileKind, display_extension};
use crate::types::{ClassificationFailure, ClassificationResult};

pub use known_headers::{
    HeaderMatch, KnownHeader, KnownHeaders, detect_header_delimiter, normalize_header,
    split_header_line,
};
pub use tabular::{DelimiterPattern, TabularVerdict};

/// Classify the file at `path`.
pub fn classify_file(
    path: &Path,
    cfg: &ClassifierConfig,
    known: &KnownHeaders,
) -> ClassificationResult {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some(kind) = supported_kind(path) else {
        return ClassificationResult::rejected(
            ClassificationFailure::UnsupportedType,
            format!("Unsupported file type: {}", display_extension(path)),
        );
    };

    let file_size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return ClassificationResult::rejected(ClassificationFailure::FileNotFound, "File not found");
        }
        Err(e) => {
            return ClassificationResult::rejected(
                ClassificationFailure::Unreadable,
                format!("Could not stat file: {e}"),
            );
        }
    };
    if file_size == 0 {
        let mut res = ClassificationResult::rejected(ClassificationFailure::EmptyFile, "File is empty");
        res.file_size = Some(0);
        return res;
    }

    let mut res = match kind {
        FileKind::Text => classify_text(path, &file_name, cfg, known),
        FileKind::Spreadsheet => classify_spreadsheet(path, known),
    };
    res.file_size = Some(file_size);

    if res.is_tabular {
        info!(
            file = %file_name,
            rows = res.row_count,
            known_pct = res.known_header_percentage,
            "classified as tabular"
        );
    } else {
        warn!(
            file = %file_name,
            reason = res.error_message.as_deref().unwrap_or(""),
            "classified as not tabular"
        );
    }
    res
}

fn supported_kind(path: &Path) -> Option<FileKind> {
    match FileKind::from_path(path)? {
        FileKind::Spreadsheet if !cfg!(feature = "excel") => None,
        kind => Some(kind),
    }
}

fn classify_text(
    path: &Path,
    file_name: &str,
    cfg: &ClassifierConfig,
    known: &KnownHeaders,
) -> ClassificationResult {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            return ClassificationResult::rejected(
                ClassificationFailure::Unreadable,
                format!("Could not read file: {e}"),
            );
        }
    };

    let decoded = match resolve_encoding(&bytes, file_name, cfg.encoding_probe_bytes) {
        Ok(d) => d,
        Err(exhausted) => {
            let mut res = ClassificationResult::rejected(
                ClassificationFailure::EncodingExhausted,
                exhausted.message,
            );
            res.warnings = exhausted.warnings;
            return res;
        }
    };

    let mut res = ClassificationResult {
        encoding: Some(decoded.encoding.name()),
        row_count: decoded.lines.len(),
        warnings: decoded.warnings,
        ..Default::default()
    };

    if decoded.lines.iter().all(|l| l.trim().is_empty()) {
        res.failure = Some(ClassificationFailure::WhitespaceOnly);
        res.error_message = Some("File is empty or only contains whitespace".to_string());
        return res;
    }

    let verdict = tabular::assess(&decoded.lines, cfg);
    res.warnings.extend(verdict.warnings);
    if !verdict.is_tabular {
        res.failure = Some(ClassificationFailure::NotTabular);
        res.error_message = verdict.error_message;
        return res;
    }
    res.is_tabular = true;

    let first = decoded.lines.first().map(String::as_str).unwrap_or("");
    let delimiter = detect_header_delimiter(first);
    let headers = split_header_line(first, delimiter.map(|(d, _)| d));
    apply_header_match(&mut res, known.match_headers(&headers));
    res.separators = match delimiter {
        Some((d, cols)) => vec![d.to_string(); cols - 1],
        None => Vec::new(),
    };
    res
}

#[cfg(feature = "excel")]
fn classify_spreadsheet(path: &Path, known: &KnownHeaders) -> ClassificationResult {
    use crate::ingestion::excel::read_first_sheet;

    let rows = match read_first_sheet(path) {
        Ok(rows) => rows,
        Err(e) => {
            return ClassificationResult::rejected(
                ClassificationFailure::Unreadable,
                format!("Failed to read and validate Excel file content: {e}"),
            );
        }
    };
    if rows.is_empty() {
        return ClassificationResult::rejected(
            ClassificationFailure::EmptyFile,
            "File is empty (no columns or rows).",
        );
    }
    if rows.iter().all(|r| r.is_blank()) {
        return ClassificationResult::rejected(
            ClassificationFailure::WhitespaceOnly,
            "File contains only whitespace or empty cells.",
        );
    }

    let mut res = ClassificationResult {
        is_tabular: true,
        row_count: rows.len(),
        ..Default::default()
    };
    let headers: Vec<String> = rows[0].cells.iter().map(|c| c.trim().to_string()).collect();
    apply_header_match(&mut res, known.match_headers(&headers));
    res
}

#[cfg(not(feature = "excel"))]
fn classify_spreadsheet(path: &Path, _known: &KnownHeaders) -> ClassificationResult {
    ClassificationResult::rejected(
        ClassificationFailure::UnsupportedType,
        format!("Unsupported file type: {}", display_extension(path)),
    )
}

fn apply_header_match(res: &mut ClassificationResult, m: HeaderMatch) {
    res.known_header_percentage = m.percentage();
    res.known_columns_count = m.matched;
    res.total_columns_count = m.total;
    res.standardized_headers = m.standardized;
    res.normalize_flags = m.normalize_flags;
}

//! Value types passed between pipeline stages.
//!
//! Each stage produces one of these values and the next stage consumes it; none of them is
//! mutated after it has been handed on. The only mutable aggregate is
//! [`crate::pipeline::run::Run`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Candidate delimiters, in the order they are tried.
///
/// Used both by the tabular heuristic and to recover over-merged trailing columns.
pub const FALLBACK_DELIMITERS: [char; 5] = [',', ';', '|', '\t', ':'];

/// Why classification rejected a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationFailure {
    UnsupportedType,
    FileNotFound,
    EmptyFile,
    WhitespaceOnly,
    EncodingExhausted,
    NotTabular,
    Unreadable,
}

/// Result of classifying a single file.
///
/// Classification never returns an error to its caller; every failure mode is reported here with
/// `is_tabular = false` and a human-readable `error_message`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Resolved text encoding (lower-case label), `None` for spreadsheets or unreadable files.
    pub encoding: Option<String>,
    /// File size in bytes, if the file could be stat'ed.
    pub file_size: Option<u64>,
    /// Physical line count (text) or row count (spreadsheet).
    pub row_count: usize,
    pub is_tabular: bool,
    pub failure: Option<ClassificationFailure>,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
    /// Percentage (0-100) of first-line headers that matched the known-header dictionary.
    pub known_header_percentage: f64,
    /// First-line headers, replaced by their canonical key when matched.
    pub standardized_headers: Vec<String>,
    /// Per standardized header: does the canonical key ask for value normalization.
    pub normalize_flags: Vec<bool>,
    pub known_columns_count: usize,
    pub total_columns_count: usize,
    /// Inferred separators between header columns (`total_columns_count - 1` entries).
    pub separators: Vec<String>,
}

impl ClassificationResult {
    /// Build a rejected result.
    pub fn rejected(failure: ClassificationFailure, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            is_tabular: false,
            failure: Some(failure),
            warnings: vec![message.clone()],
            error_message: Some(message),
            ..Default::default()
        }
    }

    /// Convert a rejection into the matching [`PipelineError`]. Returns `None` for tabular files.
    pub fn to_error(&self) -> Option<PipelineError> {
        if self.is_tabular {
            return None;
        }
        let message = self
            .error_message
            .clone()
            .unwrap_or_else(|| "File is not tabular".to_string());
        Some(match self.failure {
            Some(ClassificationFailure::UnsupportedType) => PipelineError::UnsupportedType {
                extension: message
                    .strip_prefix("Unsupported file type: ")
                    .unwrap_or(&message)
                    .to_string(),
            },
            Some(ClassificationFailure::FileNotFound) => PipelineError::FileNotFound,
            Some(ClassificationFailure::EmptyFile) | Some(ClassificationFailure::WhitespaceOnly) => {
                PipelineError::EmptyFile { message }
            }
            Some(ClassificationFailure::EncodingExhausted) => {
                PipelineError::EncodingExhausted { message }
            }
            Some(ClassificationFailure::Unreadable) => PipelineError::Unreadable { message },
            Some(ClassificationFailure::NotTabular) | None => PipelineError::NotTabular { message },
        })
    }
}

/// Description attached to an output header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderMetadata {
    pub is_known: bool,
    pub description: String,
}

/// Resolved column → header assignment used to rewrite a file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaMapping {
    /// Column index → output header name.
    pub header_mapping: BTreeMap<usize, String>,
    /// Output header name → whether values need normalization.
    pub normalization_map: BTreeMap<String, bool>,
    pub matched_columns_count: usize,
    pub input_has_header: bool,
    pub total_columns: usize,
    /// Inter-column separators, `total_columns - 1` entries when present.
    pub column_separators: Vec<String>,
    /// Column index → literal prefix to strip from every value of that column.
    pub strip_prefixes: BTreeMap<usize, String>,
    pub header_metadata: BTreeMap<String, HeaderMetadata>,
}

impl SchemaMapping {
    /// Output headers in column order; unmapped columns get `unknown_column_<i>`.
    pub fn output_headers(&self) -> Vec<String> {
        (0..self.total_columns)
            .map(|i| {
                self.header_mapping
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| format!("unknown_column_{i}"))
            })
            .collect()
    }

    /// Whether the values under `header` must be normalized.
    pub fn needs_normalization(&self, header: &str) -> bool {
        self.normalization_map.get(header).copied().unwrap_or(false)
    }
}

/// Token counters reported by the schema-mapping service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A substring that repeats across most values of an output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepetitivePattern {
    pub column_index: usize,
    pub header: String,
    pub substring: String,
    /// Number of rows whose value contains the substring.
    pub occurrences: usize,
    pub total_rows: usize,
}

impl RepetitivePattern {
    pub fn percentage(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.occurrences as f64 / self.total_rows as f64 * 100.0
    }
}

/// Result of rewriting one file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizationOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
    /// Rows written to the normalized CSV, header included.
    pub rows_written: usize,
    /// Non-blank input rows processed, header included when the input has one.
    pub rows_read: usize,
    /// 1-based line numbers that were blank or discarded.
    pub skipped_line_numbers: Vec<usize>,
    pub output_size: u64,
    pub output_path: PathBuf,
    pub invalid_rows_path: PathBuf,
    pub json_mirror_path: Option<PathBuf>,
    /// Diagnostic findings of the repetitive-pattern pass.
    pub repetitive_patterns: Vec<RepetitivePattern>,
}

//! Rewrites a classified file into a fixed-schema CSV.
//!
//! One pass over the input: every non-blank row is split, checked against the expected column
//! count, transformed and written. Rows with the wrong column count go to an invalid-rows side
//! file with their 1-based line number. A line-oriented JSON mirror of the output can be written
//! alongside. After writing, a diagnostic pass looks for suspicious repetitive substrings.

pub mod qa;
pub mod split;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::classifier::KnownHeaders;
use crate::config::{NormalizerConfig, PathsConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::ingestion::encoding::read_lines;
use crate::ingestion::format::{FileKind, display_extension};
use crate::types::{NormalizationOutcome, SchemaMapping};

pub use qa::{analyze_output, find_repetitive_patterns};
pub use split::RowSplitter;

/// Header of the invalid-rows side file.
pub const INVALID_ROWS_HEADER: [&str; 3] = ["Row_Number", "Reason", "Original_Line"];

/// Deterministic artifact locations for one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub normalized: PathBuf,
    pub invalid_rows: PathBuf,
    pub json_mirror: Option<PathBuf>,
}

impl OutputPaths {
    /// `normalized_<stem>.csv`, `invalid_rows_<stem>.csv` and `be_normalized_<stem>.json`.
    pub fn for_input(input: &Path, paths: &PathsConfig, json_mirror: bool) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            normalized: paths.output_dir.join(format!("normalized_{stem}.csv")),
            invalid_rows: paths.invalid_dir.join(format!("invalid_rows_{stem}.csv")),
            json_mirror: json_mirror
                .then(|| paths.json_output_dir.join(format!("be_normalized_{stem}.json"))),
        }
    }
}

/// Apply the per-field transforms to a split row.
///
/// In order: strip the column's literal prefix (then leading whitespace), strip surrounding
/// quote characters, then normalize values of flagged columns (emails are trimmed and
/// lower-cased; other kinds pass through).
pub fn transform_row(fields: Vec<String>, headers: &[String], mapping: &SchemaMapping) -> Vec<String> {
    fields
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let v = match mapping
                .strip_prefixes
                .get(&i)
                .and_then(|p| value.strip_prefix(p.as_str()))
            {
                Some(rest) => rest.trim_start(),
                None => value.as_str(),
            };
            let v = v.trim_matches(|c: char| c == '"' || c == '\'');
            match headers.get(i) {
                Some(h) if mapping.needs_normalization(h) => normalize_value(h, v),
                _ => v.to_string(),
            }
        })
        .collect()
}

fn normalize_value(header: &str, value: &str) -> String {
    if header.to_lowercase().contains("email") {
        value.trim().to_lowercase()
    } else {
        value.to_string()
    }
}

/// One line of the JSON mirror: `{"field": v0, "field_0": v1, "field_1": v2, ...}`, keys in
/// column order.
fn mirror_line(values: &[String]) -> PipelineResult<String> {
    let mut line = String::from("{");
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        let key = match i {
            0 => "field".to_string(),
            n => format!("field_{}", n - 1),
        };
        line.push_str(&serde_json::to_string(&key)?);
        line.push_str(": ");
        line.push_str(&serde_json::to_string(v)?);
    }
    line.push('}');
    Ok(line)
}

/// Open writers for one normalization pass.
struct Sinks {
    output: csv::Writer<File>,
    invalid: csv::Writer<File>,
    mirror: Option<BufWriter<File>>,
}

impl Sinks {
    fn create(paths: &OutputPaths, headers: &[String]) -> PipelineResult<Self> {
        for p in [Some(&paths.normalized), Some(&paths.invalid_rows), paths.json_mirror.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut output = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .from_path(&paths.normalized)?;
        output.write_record(headers)?;

        let mut invalid = csv::Writer::from_path(&paths.invalid_rows)?;
        invalid.write_record(INVALID_ROWS_HEADER)?;

        let mirror = match &paths.json_mirror {
            Some(p) => {
                let mut w = BufWriter::new(File::create(p)?);
                writeln!(w, "{}", mirror_line(headers)?)?;
                Some(w)
            }
            None => None,
        };
        Ok(Self {
            output,
            invalid,
            mirror,
        })
    }

    fn write_row(&mut self, row: &[String]) -> PipelineResult<()> {
        self.output.write_record(row)?;
        if let Some(m) = self.mirror.as_mut() {
            writeln!(m, "{}", mirror_line(row)?)?;
        }
        Ok(())
    }

    fn write_invalid(&mut self, line_no: usize, reason: &str, original: &str) -> PipelineResult<()> {
        self.invalid
            .write_record([line_no.to_string().as_str(), reason, original])?;
        Ok(())
    }

    fn finish(mut self) -> PipelineResult<()> {
        self.output.flush()?;
        self.invalid.flush()?;
        if let Some(m) = self.mirror.as_mut() {
            m.flush()?;
        }
        Ok(())
    }
}

/// Counters accumulated while rows stream through.
#[derive(Debug, Default)]
struct Tally {
    /// Non-blank input rows, the input header included.
    read: usize,
    /// Data rows written.
    written: usize,
    discarded: usize,
    skipped: Vec<usize>,
}

/// Rewrites files according to one resolved [`SchemaMapping`].
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'a> {
    mapping: &'a SchemaMapping,
    known: &'a KnownHeaders,
    cfg: &'a NormalizerConfig,
}

impl<'a> Normalizer<'a> {
    pub fn new(mapping: &'a SchemaMapping, known: &'a KnownHeaders, cfg: &'a NormalizerConfig) -> Self {
        Self {
            mapping,
            known,
            cfg,
        }
    }

    /// Number of mapped output headers that are known dictionary keys.
    pub fn known_output_headers(&self) -> usize {
        self.mapping
            .header_mapping
            .values()
            .filter(|h| self.known.contains_key(h))
            .count()
    }

    /// Normalize `input` (decoded with `encoding` for text files) into `paths`.
    ///
    /// Outputs are truncated and rewritten, so normalizing the same input with the same mapping
    /// twice produces identical files.
    pub fn normalize_file(
        &self,
        input: &Path,
        encoding: Option<&str>,
        paths: &OutputPaths,
    ) -> PipelineResult<NormalizationOutcome> {
        if self.known_output_headers() < 1 {
            return Err(PipelineError::NoKnownHeaderMatched);
        }
        let kind = FileKind::from_path(input).ok_or_else(|| PipelineError::UnsupportedType {
            extension: display_extension(input),
        })?;

        let headers = self.mapping.output_headers();
        let mut sinks = Sinks::create(paths, &headers)?;
        let tally = match kind {
            FileKind::Text => self.rewrite_text(input, encoding, &headers, &mut sinks)?,
            FileKind::Spreadsheet => self.rewrite_spreadsheet(input, &headers, &mut sinks)?,
        };
        sinks.finish()?;

        let mut outcome = NormalizationOutcome {
            success: true,
            rows_written: tally.written + 1,
            rows_read: tally.read,
            skipped_line_numbers: tally.skipped,
            output_size: std::fs::metadata(&paths.normalized)?.len(),
            output_path: paths.normalized.clone(),
            invalid_rows_path: paths.invalid_rows.clone(),
            json_mirror_path: paths.json_mirror.clone(),
            ..Default::default()
        };
        if tally.discarded > 0 {
            let written = tally.written + usize::from(self.mapping.input_has_header);
            outcome.warnings.push(format!(
                "{written} of {} non-empty rows written to normalized CSV (some rows were skipped)",
                tally.read
            ));
        }

        match analyze_output(&paths.normalized, &headers, self.cfg) {
            Ok(patterns) => outcome.repetitive_patterns = patterns,
            Err(e) => warn!(error = %e, "repetitive pattern analysis failed"),
        }

        info!(
            file = %input.display(),
            written = outcome.rows_written,
            read = outcome.rows_read,
            discarded = tally.discarded,
            bytes = outcome.output_size,
            "normalized file"
        );
        Ok(outcome)
    }

    fn rewrite_text(
        &self,
        input: &Path,
        encoding: Option<&str>,
        headers: &[String],
        sinks: &mut Sinks,
    ) -> PipelineResult<Tally> {
        let lines = read_lines(input, encoding)?;
        let splitter = RowSplitter::for_mapping(self.mapping);
        let mut tally = Tally::default();
        let mut rows = lines.iter().enumerate().map(|(i, l)| (i + 1, l.as_str()));
        if self.mapping.input_has_header && rows.next().is_some() {
            tally.read += 1;
        }
        for (line_no, line) in rows {
            if line.trim().is_empty() {
                tally.skipped.push(line_no);
                continue;
            }
            tally.read += 1;
            let fields = splitter.split(line);
            self.emit(line_no, fields, line, headers, sinks, &mut tally)?;
        }
        Ok(tally)
    }

    #[cfg(feature = "excel")]
    fn rewrite_spreadsheet(
        &self,
        input: &Path,
        headers: &[String],
        sinks: &mut Sinks,
    ) -> PipelineResult<Tally> {
        let sheet = crate::ingestion::excel::read_first_sheet(input)?;
        let mut tally = Tally::default();
        let mut rows = sheet.into_iter();
        if self.mapping.input_has_header && rows.next().is_some() {
            tally.read += 1;
        }
        for row in rows {
            if row.is_blank() {
                tally.skipped.push(row.number);
                continue;
            }
            tally.read += 1;
            let original = row.cells.join(",");
            self.emit(row.number, row.cells, &original, headers, sinks, &mut tally)?;
        }
        Ok(tally)
    }

    #[cfg(not(feature = "excel"))]
    fn rewrite_spreadsheet(
        &self,
        input: &Path,
        _headers: &[String],
        _sinks: &mut Sinks,
    ) -> PipelineResult<Tally> {
        Err(PipelineError::UnsupportedType {
            extension: display_extension(input),
        })
    }

    fn emit(
        &self,
        line_no: usize,
        fields: Vec<String>,
        original: &str,
        headers: &[String],
        sinks: &mut Sinks,
        tally: &mut Tally,
    ) -> PipelineResult<()> {
        let expected = self.mapping.total_columns;
        if fields.len() != expected {
            let reason = PipelineError::ColumnCountMismatch {
                got: fields.len(),
                expected,
            }
            .to_string();
            warn!(
                line = line_no,
                got = fields.len(),
                expected,
                "discarding row with wrong column count"
            );
            sinks.write_invalid(line_no, &reason, original)?;
            tally.skipped.push(line_no);
            tally.discarded += 1;
            return Ok(());
        }
        sinks.write_row(&transform_row(fields, headers, self.mapping))?;
        tally.written += 1;
        Ok(())
    }
}

//! Bounded row extraction used as input to schema inference.

use std::path::Path;

use tracing::{info, warn};

use crate::config::SamplerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ingestion::encoding::read_lines;
use crate::ingestion::format::FileKind;

/// Rows extracted from the top of a file: the first row followed by up to `max_rows` rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sample {
    pub rows: Vec<Vec<String>>,
    pub warnings: Vec<String>,
}

/// Extract a sample from `path` using the encoding resolved at classification.
pub fn extract_sample(
    path: &Path,
    encoding: Option<&str>,
    cfg: &SamplerConfig,
) -> PipelineResult<Sample> {
    let sample = match FileKind::from_path(path) {
        Some(FileKind::Text) => sample_text(path, encoding, cfg.max_rows)?,
        Some(FileKind::Spreadsheet) => sample_spreadsheet(path, cfg.max_rows)?,
        None => {
            return Err(PipelineError::UnsupportedType {
                extension: crate::ingestion::format::display_extension(path),
            });
        }
    };
    if sample.rows.is_empty() {
        return Err(PipelineError::SampleEmpty {
            message: format!("no rows could be extracted from {}", path.display()),
        });
    }
    info!(file = %path.display(), rows = sample.rows.len(), "extracted sample");
    Ok(sample)
}

fn sample_text(path: &Path, encoding: Option<&str>, max_rows: usize) -> PipelineResult<Sample> {
    let mut sample = Sample::default();
    for line in read_lines(path, encoding)?.into_iter().take(max_rows + 1) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(row) => sample.rows.push(row),
            Err(e) => {
                let head: String = line.chars().take(50).collect();
                let msg = format!("[SAMPLER] Failed to parse line: {head}... ({e})");
                warn!("{msg}");
                sample.warnings.push(msg);
            }
        }
    }
    Ok(sample)
}

fn parse_line(line: &str) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(record) => Ok(record?.iter().map(str::to_string).collect()),
        None => Ok(Vec::new()),
    }
}

#[cfg(feature = "excel")]
fn sample_spreadsheet(path: &Path, max_rows: usize) -> PipelineResult<Sample> {
    let rows = crate::ingestion::excel::read_first_sheet(path)?;
    let mut sample = Sample::default();
    if rows.len() > max_rows + 1 {
        sample.warnings.push(format!(
            "Excel file has more than {max_rows} rows, truncating for sample."
        ));
    }
    sample.rows = rows
        .into_iter()
        .take(max_rows + 1)
        .map(|r| r.cells)
        .collect();
    Ok(sample)
}

#[cfg(not(feature = "excel"))]
fn sample_spreadsheet(path: &Path, _max_rows: usize) -> PipelineResult<Sample> {
    Err(PipelineError::UnsupportedType {
        extension: crate::ingestion::format::display_extension(path),
    })
}

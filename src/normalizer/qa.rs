//! Repetitive-substring diagnostics over a normalized output file.
//!
//! Flags, per column, the longest substrings that occur in more than a configured share of rows.
//! Findings are diagnostic only: they are logged and returned, never change the output.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::NormalizerConfig;
use crate::error::PipelineResult;
use crate::types::RepetitivePattern;

/// Read the normalized CSV at `path` (header row first) and analyze every column.
pub fn analyze_output(
    path: &Path,
    headers: &[String],
    cfg: &NormalizerConfig,
) -> PipelineResult<Vec<RepetitivePattern>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut columns: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    let mut total_rows = 0;
    for record in reader.records() {
        let record = record?;
        total_rows += 1;
        for (col, value) in columns.iter_mut().zip(record.iter()) {
            col.push(value.chars().take(cfg.qa_max_value_chars).collect());
        }
    }

    let patterns = find_repetitive_patterns(headers, &columns, total_rows, cfg);
    for p in &patterns {
        warn!(
            "Repetitive pattern detected in column {} '{}': substring '{}' appears in {}/{} rows ({:.1}% of all rows)",
            p.column_index,
            p.header,
            p.substring,
            p.occurrences,
            p.total_rows,
            p.percentage()
        );
    }
    Ok(patterns)
}

/// Analyze column-major values. Columns are processed in parallel; the result is ordered by
/// column, then longest substring first.
pub fn find_repetitive_patterns(
    headers: &[String],
    columns: &[Vec<String>],
    total_rows: usize,
    cfg: &NormalizerConfig,
) -> Vec<RepetitivePattern> {
    if total_rows == 0 {
        return Vec::new();
    }
    columns
        .par_iter()
        .enumerate()
        .flat_map_iter(|(idx, values)| {
            let header = headers
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("unknown_column_{idx}"));
            column_patterns(values, cfg, total_rows)
                .into_iter()
                .map(move |(substring, occurrences)| RepetitivePattern {
                    column_index: idx,
                    header: header.clone(),
                    substring,
                    occurrences,
                    total_rows,
                })
        })
        .collect()
}

fn column_patterns(values: &[String], cfg: &NormalizerConfig, total_rows: usize) -> Vec<(String, usize)> {
    let non_empty: Vec<&str> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    if non_empty.len() < cfg.qa_min_values {
        return Vec::new();
    }

    let counts = substring_counts(
        &non_empty,
        cfg.qa_min_substring_len.max(1),
        cfg.qa_max_distinct_substrings,
    );

    let threshold = total_rows as f64 * cfg.qa_row_ratio;
    let mut qualifying: Vec<(&str, usize)> = counts
        .into_iter()
        .filter(|&(_, n)| n as f64 > threshold)
        .collect();
    qualifying.sort_by(|a, b| {
        b.0.chars()
            .count()
            .cmp(&a.0.chars().count())
            .then(b.1.cmp(&a.1))
            .then(a.0.cmp(b.0))
    });

    let mut reported: Vec<(String, usize)> = Vec::new();
    for (sub, n) in qualifying {
        if reported.iter().any(|(r, _)| r.contains(sub)) {
            continue;
        }
        reported.push((sub.to_string(), n));
    }
    reported
}

/// Number of values containing each substring of at least `min_len` chars.
///
/// At most `cap` distinct substrings are tracked; once full, only substrings already seen keep
/// being counted.
fn substring_counts<'v>(values: &[&'v str], min_len: usize, cap: usize) -> HashMap<&'v str, usize> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut capped = false;
    for &value in values {
        // Char boundaries, end included.
        let bounds: Vec<usize> = value
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(value.len()))
            .collect();
        if bounds.len() <= min_len {
            continue;
        }
        let mut seen = HashSet::new();
        for a in 0..bounds.len() {
            for b in (a + min_len)..bounds.len() {
                let sub = &value[bounds[a]..bounds[b]];
                if !seen.insert(sub) {
                    continue;
                }
                if let Some(n) = counts.get_mut(sub) {
                    *n += 1;
                } else if counts.len() < cap {
                    counts.insert(sub, 1);
                } else {
                    capped = true;
                }
            }
        }
    }
    if capped {
        debug!(cap, "substring table full, later substrings were not counted");
    }
    counts
}

//! Known-header dictionary and header matching.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::types::FALLBACK_DELIMITERS;

const BUNDLED: &str = include_str!("known_headers.json");

/// A canonical header with its declared text variants.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnownHeader {
    pub description: String,
    pub variants: Vec<String>,
    /// Ambiguous headers never take part in matching.
    pub conflictive: bool,
    /// Values under this header get type-specific normalization.
    pub normalize: bool,
}

/// Read-only dictionary of canonical headers, keyed by canonical key.
#[derive(Debug, Clone, Default)]
pub struct KnownHeaders {
    entries: BTreeMap<String, KnownHeader>,
    lookup: HashMap<String, String>,
}

/// Outcome of matching a header row against the dictionary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeaderMatch {
    /// Input headers, replaced by their canonical key when matched.
    pub standardized: Vec<String>,
    pub normalize_flags: Vec<bool>,
    pub matched: usize,
    pub total: usize,
}

impl HeaderMatch {
    /// Matched share in percent (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.matched as f64 / self.total as f64 * 100.0
    }
}

/// Trim, lower-case and drop `-`, `_` and whitespace.
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
        .collect()
}

impl KnownHeaders {
    pub fn new(entries: BTreeMap<String, KnownHeader>) -> Self {
        let mut lookup = HashMap::new();
        for (key, header) in &entries {
            if header.conflictive {
                continue;
            }
            lookup.insert(normalize_header(key), key.clone());
            for variant in &header.variants {
                lookup
                    .entry(normalize_header(variant))
                    .or_insert_with(|| key.clone());
            }
        }
        Self { entries, lookup }
    }

    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let entries: BTreeMap<String, KnownHeader> =
            serde_json::from_str(json).map_err(|e| PipelineError::Config {
                message: format!("invalid known-header dictionary: {e}"),
            })?;
        Ok(Self::new(entries))
    }

    pub fn from_path(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Dictionary compiled into the crate.
    pub fn bundled() -> PipelineResult<Self> {
        Self::from_json_str(BUNDLED)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&KnownHeader> {
        self.entries.get(key)
    }

    /// Canonical key for a raw header, if it matches a non-conflictive entry.
    pub fn lookup(&self, raw: &str) -> Option<&str> {
        self.lookup.get(&normalize_header(raw)).map(String::as_str)
    }

    /// Key → description, the only part of the dictionary shared with the mapping service.
    pub fn descriptions(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.description.clone()))
            .collect()
    }

    pub fn match_headers(&self, headers: &[String]) -> HeaderMatch {
        let mut out = HeaderMatch {
            total: headers.len(),
            ..Default::default()
        };
        for raw in headers {
            match self.lookup(raw) {
                Some(key) => {
                    out.matched += 1;
                    out.normalize_flags
                        .push(self.entries.get(key).is_some_and(|h| h.normalize));
                    out.standardized.push(key.to_string());
                }
                None => {
                    out.normalize_flags.push(false);
                    out.standardized.push(raw.trim().to_string());
                }
            }
        }
        out
    }
}

/// Pick the fallback delimiter that splits `line` into the most columns (at least two).
///
/// Returns the delimiter and the resulting column count. Earlier delimiters win ties.
pub fn detect_header_delimiter(line: &str) -> Option<(char, usize)> {
    let mut best: Option<(char, usize)> = None;
    for d in FALLBACK_DELIMITERS {
        let cols = line.split(d).count();
        if cols >= 2 && best.is_none_or(|(_, n)| cols > n) {
            best = Some((d, cols));
        }
    }
    best
}

/// Split a header line into trimmed, unquoted header names.
pub fn split_header_line(line: &str, delimiter: Option<char>) -> Vec<String> {
    let Some(d) = delimiter else {
        return vec![unquote(line.trim()).to_string()];
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(d as u8)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(Ok(record)) => record.iter().map(|h| unquote(h.trim()).to_string()).collect(),
        _ => line.split(d).map(|h| unquote(h.trim()).to_string()).collect(),
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(s)
}

//! Delimiter-pattern heuristic deciding whether text lines form a table.
//!
//! Every sampled non-blank line is reduced to the set of `(delimiter, count)` pairs for the
//! fallback delimiters it contains. The file is tabular when one such set is shared by enough
//! lines.

use std::collections::HashMap;
use std::fmt;

use crate::config::ClassifierConfig;
use crate::types::FALLBACK_DELIMITERS;

/// Order-independent set of `(delimiter, count)` pairs for one line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DelimiterPattern(Vec<(char, usize)>);

impl DelimiterPattern {
    pub fn of_line(line: &str) -> Self {
        let mut pairs: Vec<(char, usize)> = FALLBACK_DELIMITERS
            .iter()
            .map(|&d| (d, line.matches(d).count()))
            .filter(|&(_, n)| n > 0)
            .collect();
        pairs.sort_unstable();
        Self(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DelimiterPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (d, n)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{d}': {n}")?;
        }
        f.write_str("}")
    }
}

/// Result of the heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct TabularVerdict {
    pub is_tabular: bool,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
    /// Non-blank lines that were inspected.
    pub sampled_lines: usize,
    /// Most frequent patterns (at most three), with their line counts.
    pub top: Vec<(DelimiterPattern, usize)>,
}

impl TabularVerdict {
    /// Share (0-1) of sampled lines carrying the most frequent pattern.
    pub fn mode_ratio(&self) -> f64 {
        match self.top.first() {
            Some((_, n)) if self.sampled_lines > 0 => *n as f64 / self.sampled_lines as f64,
            _ => 0.0,
        }
    }
}

/// Line indices to inspect: the first `head` lines, then an even stride over the rest, capped
/// at `max` indices in total.
pub fn sample_indices(total: usize, head: usize, max: usize) -> Vec<usize> {
    let first = total.min(head);
    let mut out: Vec<usize> = (0..first).collect();
    let remaining = max.saturating_sub(out.len());
    if total > head && remaining > 0 {
        let step = ((total - head) / remaining).max(1);
        out.extend((head..total).step_by(step).take(remaining));
    }
    out
}

/// Apply the heuristic to decoded lines.
pub fn assess(lines: &[String], cfg: &ClassifierConfig) -> TabularVerdict {
    let patterns: Vec<DelimiterPattern> =
        sample_indices(lines.len(), cfg.head_lines, cfg.max_sample_lines)
            .into_iter()
            .map(|i| lines[i].trim())
            .filter(|l| !l.is_empty())
            .map(DelimiterPattern::of_line)
            .collect();

    let sampled = patterns.len();
    if sampled == 0 {
        return TabularVerdict {
            is_tabular: false,
            error_message: Some("No non-empty lines found".to_string()),
            warnings: Vec::new(),
            sampled_lines: 0,
            top: Vec::new(),
        };
    }

    let top = most_common(patterns, 3);
    let pct = |n: usize| n as f64 / sampled as f64;
    let threshold = threshold_label(cfg.tabular_min_ratio);
    let top_str = top
        .iter()
        .map(|(p, n)| {
            let shown = if p.is_empty() {
                "None".to_string()
            } else {
                p.to_string()
            };
            format!("{shown} ({:.1}%)", pct(*n) * 100.0)
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut verdict = TabularVerdict {
        is_tabular: false,
        error_message: None,
        warnings: Vec::new(),
        sampled_lines: sampled,
        top: Vec::new(),
    };

    let (mode, mode_count) = (&top[0].0, top[0].1);
    if !mode.is_empty() && pct(mode_count) >= cfg.tabular_min_ratio {
        verdict.is_tabular = true;
    } else if mode.is_empty() && top.len() > 1 {
        let (second, second_count) = (&top[1].0, top[1].1);
        if !second.is_empty() && pct(second_count) >= cfg.tabular_min_ratio {
            verdict.is_tabular = true;
            verdict.warnings.push(format!(
                "[CLASSIFIER] Tabular: although the most common line type has no delimiters, the second most common has delimiter counts {second} in {:.1}% of lines (>={threshold}). Top 3: {top_str}",
                pct(second_count) * 100.0
            ));
        } else {
            verdict.error_message = Some(format!(
                "Not tabular: the most common line type has no delimiters, and no delimiter-count pattern appears in at least {threshold} of lines. Top 3: {top_str}"
            ));
        }
    } else {
        verdict.error_message = Some(format!(
            "Not tabular: only {:.1}% of lines have delimiter counts {mode}, which is below the {threshold} threshold. Top 3: {top_str}",
            pct(mode_count) * 100.0
        ));
    }
    verdict.top = top;
    verdict
}

/// Count patterns and keep the `n` most frequent; ties keep first-seen order.
fn most_common(patterns: Vec<DelimiterPattern>, n: usize) -> Vec<(DelimiterPattern, usize)> {
    let mut index: HashMap<DelimiterPattern, usize> = HashMap::new();
    let mut counts: Vec<(DelimiterPattern, usize)> = Vec::new();
    for p in patterns {
        match index.get(&p) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(p.clone(), counts.len());
                counts.push((p, 1));
            }
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(n);
    counts
}

fn threshold_label(ratio: f64) -> String {
    let pct = ratio * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("{pct:.0}%")
    } else {
        format!("{pct:.1}%")
    }
}

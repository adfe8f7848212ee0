//! Quote-aware row splitting with per-column separators.

use std::collections::{BTreeMap, VecDeque};

use crate::types::{FALLBACK_DELIMITERS, SchemaMapping};

/// Splits raw lines into fields according to a [`SchemaMapping`].
///
/// With separators configured, separator `k` ends field `k`. A separator is only recognized
/// outside double quotes; `""` is an escaped quote and does not toggle. A fully quoted field
/// loses its outer quotes, any other field is trimmed.
///
/// When the last field was not quoted in the source and still contains a fallback delimiter, it
/// is re-split on the fallback delimiters. This is suppressed when a strip prefix is configured
/// for the last column: such a column is a single free-text value. The prefix itself is removed
/// later by [`transform_row`](super::transform_row).
///
/// Without separators the line is parsed as one CSV record.
#[derive(Debug, Clone, Copy)]
pub struct RowSplitter<'a> {
    separators: &'a [String],
    strip_prefixes: &'a BTreeMap<usize, String>,
}

impl<'a> RowSplitter<'a> {
    pub fn new(separators: &'a [String], strip_prefixes: &'a BTreeMap<usize, String>) -> Self {
        Self {
            separators,
            strip_prefixes,
        }
    }

    pub fn for_mapping(mapping: &'a SchemaMapping) -> Self {
        Self::new(&mapping.column_separators, &mapping.strip_prefixes)
    }

    pub fn split(&self, line: &str) -> Vec<String> {
        if self.separators.is_empty() {
            return split_csv(line);
        }

        let bytes = line.as_bytes();
        let mut fields = Vec::with_capacity(self.separators.len() + 1);
        let mut start = 0;
        let mut in_quotes = false;

        'separators: for sep in self.separators {
            let sep = sep.as_bytes();
            if sep.is_empty() {
                break;
            }
            let mut j = start;
            while j < bytes.len() {
                if bytes[j] == b'"' {
                    if bytes.get(j + 1) == Some(&b'"') {
                        j += 1;
                    } else {
                        in_quotes = !in_quotes;
                    }
                }
                // A UTF-8 separator never starts on a continuation byte, so `j` is a char
                // boundary whenever it matches.
                if !in_quotes && bytes[j..].starts_with(sep) {
                    fields.push(clean_field(&line[start..j]));
                    start = j + sep.len();
                    continue 'separators;
                }
                j += 1;
            }
            break;
        }

        let raw_last = &line[start..];
        fields.push(clean_field(raw_last));

        let last_idx = fields.len() - 1;
        if self.strip_prefixes.contains_key(&last_idx)
            || is_quoted(raw_last)
            || !fields[last_idx].contains(&FALLBACK_DELIMITERS[..])
        {
            return fields;
        }
        let last = fields.swap_remove(last_idx);
        fields.extend(split_fallback(&last));
        fields
    }
}

fn is_quoted(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('"') && s.ends_with('"')
}

fn clean_field(raw: &str) -> String {
    if is_quoted(raw) {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.trim().to_string()
    }
}

/// Re-split an over-merged trailing field, left to right, on the first fallback delimiter found
/// outside quotes. Quoted pieces are kept whole, quotes included.
fn split_fallback(field: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([field.to_string()]);
    while let Some(current) = queue.pop_front() {
        if is_quoted(&current) {
            out.push(current);
            continue;
        }
        match find_unquoted_delimiter(&current) {
            Some((i, d)) => {
                let right = current[i + d.len_utf8()..].trim().to_string();
                let left = current[..i].trim().to_string();
                queue.push_front(right);
                queue.push_front(left);
            }
            None => out.push(current),
        }
    }
    out
}

/// First occurrence outside quotes of the highest-priority fallback delimiter present.
fn find_unquoted_delimiter(s: &str) -> Option<(usize, char)> {
    FALLBACK_DELIMITERS.iter().find_map(|&d| {
        let mut in_quotes = false;
        s.char_indices().find_map(|(i, c)| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            (!in_quotes && c == d).then_some((i, d))
        })
    })
}

fn split_csv(line: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(Ok(record)) => record.iter().map(str::to_string).collect(),
        // An unparseable line yields no fields and is reported as a column-count mismatch.
        Some(Err(_)) | None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seps(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quoted_separator_is_not_a_boundary() {
        let separators = seps(&[",", "|"]);
        let mut prefixes = BTreeMap::new();
        prefixes.insert(2, "Note:".to_string());
        let splitter = RowSplitter::new(&separators, &prefixes);
        assert_eq!(splitter.split(r#""a,b",c|d"#), vec!["a,b", "c", "d"]);
    }

    #[test]
    fn escaped_quotes_do_not_toggle() {
        let separators = seps(&[","]);
        let none = BTreeMap::new();
        let splitter = RowSplitter::new(&separators, &none);
        assert_eq!(
            splitter.split(r#"say ""hi"", there,x"#),
            vec![r#"say ""hi"""#, "there", "x"]
        );
    }

    #[test]
    fn trailing_field_is_resplit_on_fallback_delimiters() {
        let separators = seps(&[";"]);
        let none = BTreeMap::new();
        let splitter = RowSplitter::new(&separators, &none);
        assert_eq!(
            splitter.split("alice@example.com; Alice | 555-0100"),
            vec!["alice@example.com", "Alice", "555-0100"]
        );
    }

    #[test]
    fn prefix_on_last_column_suppresses_resplit() {
        let separators = seps(&[";"]);
        let mut prefixes = BTreeMap::new();
        prefixes.insert(1, "Comment:".to_string());
        let splitter = RowSplitter::new(&separators, &prefixes);
        assert_eq!(
            splitter.split("alice@example.com;Comment: late, again"),
            vec!["alice@example.com", "Comment: late, again"]
        );
    }

    #[test]
    fn quoted_last_field_is_kept_whole() {
        let separators = seps(&[","]);
        let none = BTreeMap::new();
        let splitter = RowSplitter::new(&separators, &none);
        assert_eq!(splitter.split(r#"a,"b|c""#), vec!["a", "b|c"]);
    }

    #[test]
    fn missing_separator_yields_fewer_fields() {
        let separators = seps(&["|", "|", "|"]);
        let none = BTreeMap::new();
        let splitter = RowSplitter::new(&separators, &none);
        assert_eq!(splitter.split("a|b").len(), 2);
        assert_eq!(splitter.split("a|b|c|d").len(), 4);
    }

    #[test]
    fn multi_char_separator_and_unicode() {
        let separators = seps(&["::"]);
        let none = BTreeMap::new();
        let splitter = RowSplitter::new(&separators, &none);
        assert_eq!(splitter.split("café::crème"), vec!["café", "crème"]);
    }

    #[test]
    fn no_separators_uses_csv_rules() {
        let none = BTreeMap::new();
        let splitter = RowSplitter::new(&[], &none);
        assert_eq!(splitter.split(r#"1,"x, y",z"#), vec!["1", "x, y", "z"]);
    }

    #[test]
    fn fallback_keeps_quoted_pieces_whole() {
        assert_eq!(
            split_fallback(r#"a|"b;c"|d"#),
            vec!["a", r#""b;c""#, "d"]
        );
        // Comma is tried before pipe.
        assert_eq!(split_fallback("a|b,c"), vec!["a", "b", "c"]);
    }
}

//! Contract with the external schema-mapping service.
//!
//! The pipeline sends sample rows plus the known-header descriptions and expects a JSON object
//! describing a [`SchemaMapping`]. Everything about how the service decides is out of scope;
//! this module only defines the request/response shapes, the failure taxonomy and how a reply
//! is turned into a mapping.

#[cfg(feature = "http-mapper")]
pub mod http;
pub mod retry;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HeaderMetadata, SchemaMapping, TokenUsage};

pub use retry::{
    InferredMapping, RetryDecision, RetryPolicy, RetryState, estimated_cost, infer_schema,
    parse_retry_delay,
};

/// Keys every reply must carry.
pub const REQUIRED_KEYS: [&str; 5] = [
    "header_mapping",
    "normalization_map",
    "matched_columns_count",
    "input_has_header",
    "total_columns",
];

/// One inference request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingRequest {
    pub sample_rows: Vec<Vec<String>>,
    /// Canonical key → description.
    pub known_headers: BTreeMap<String, String>,
}

/// Raw service reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingResponse {
    /// Free text expected to contain a single JSON object.
    pub text: String,
    pub usage: TokenUsage,
}

/// Failure of a single mapping attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MappingError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("malformed mapping response: {0}")]
    Malformed(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// A schema-mapping backend.
pub trait SchemaMapper: Send + Sync {
    /// Rough size of `request` in tokens, used to keep requests under the budget.
    fn estimate_tokens(&self, request: &MappingRequest) -> usize {
        let rows: usize = request
            .sample_rows
            .iter()
            .map(|r| r.iter().map(|c| c.len() + 1).sum::<usize>())
            .sum();
        let headers: usize = request
            .known_headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 8)
            .sum();
        (rows + headers).div_ceil(4)
    }

    /// Perform one inference call. Blocking; the caller bounds it with a timeout.
    fn infer(&self, request: &MappingRequest) -> Result<MappingResponse, MappingError>;
}

#[derive(Debug, Deserialize)]
struct WireMapping {
    header_mapping: BTreeMap<String, String>,
    normalization_map: BTreeMap<String, bool>,
    matched_columns_count: usize,
    input_has_header: bool,
    total_columns: usize,
    #[serde(default)]
    column_separators: Option<Vec<String>>,
    #[serde(default)]
    strip_prefixes: Option<BTreeMap<String, Option<String>>>,
    #[serde(default)]
    header_metadata: Option<BTreeMap<String, HeaderMetadata>>,
}

/// Extract the JSON object between the first `{` and the last `}` of `text` and validate it.
///
/// Separators and prefixes are whitespace-trimmed; null or empty prefixes are dropped.
pub fn parse_mapping_response(text: &str) -> Result<SchemaMapping, MappingError> {
    let text = text.trim();
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(MappingError::Malformed(
            "no JSON object found in response".to_string(),
        ));
    };
    if end < start {
        return Err(MappingError::Malformed(
            "no JSON object found in response".to_string(),
        ));
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| MappingError::Malformed(format!("response is not valid JSON: {e}")))?;

    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|k| value.get(k).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(MappingError::Malformed(format!(
            "missing required keys: {missing:?}"
        )));
    }

    let wire: WireMapping = serde_json::from_value(value)
        .map_err(|e| MappingError::Malformed(format!("unexpected mapping shape: {e}")))?;
    if wire.total_columns == 0 {
        return Err(MappingError::Malformed(
            "total_columns must be at least 1".to_string(),
        ));
    }
    if let Some(seps) = wire.column_separators.as_ref().filter(|s| !s.is_empty()) {
        if seps.len() != wire.total_columns - 1 {
            return Err(MappingError::Malformed(format!(
                "{} column separators for {} columns, expected {}",
                seps.len(),
                wire.total_columns,
                wire.total_columns - 1
            )));
        }
    }

    let mut header_mapping = BTreeMap::new();
    for (k, v) in wire.header_mapping {
        let idx = k
            .trim()
            .parse::<usize>()
            .map_err(|_| MappingError::Malformed(format!("non-numeric column index '{k}'")))?;
        header_mapping.insert(idx, v);
    }

    let mut strip_prefixes = BTreeMap::new();
    for (k, v) in wire.strip_prefixes.unwrap_or_default() {
        let Some(prefix) = v.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) else {
            continue;
        };
        let idx = k
            .trim()
            .parse::<usize>()
            .map_err(|_| MappingError::Malformed(format!("non-numeric prefix column '{k}'")))?;
        strip_prefixes.insert(idx, prefix);
    }

    Ok(SchemaMapping {
        header_mapping,
        normalization_map: wire.normalization_map,
        matched_columns_count: wire.matched_columns_count,
        input_has_header: wire.input_has_header,
        total_columns: wire.total_columns,
        column_separators: wire
            .column_separators
            .unwrap_or_default()
            .into_iter()
            .map(trim_separator)
            .collect(),
        strip_prefixes,
        header_metadata: wire.header_metadata.unwrap_or_default(),
    })
}

/// `" | "` becomes `"|"`; a separator made only of whitespace (a tab) is kept as is.
fn trim_separator(sep: String) -> String {
    let trimmed = sep.trim();
    if trimmed.is_empty() {
        sep
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reply_wrapped_in_prose() {
        let text = r#"Sure! Here it is:
        ```json
        {
          "header_mapping": {"0": "digid_email", "1": "full_name", "2": "pdata_country"},
          "normalization_map": {"digid_email": true, "full_name": false},
          "matched_columns_count": 2,
          "input_has_header": false,
          "total_columns": 3,
          "column_separators": [" : ", "|"],
          "strip_prefixes": {"1": " Name: ", "2": null, "0": ""},
          "header_metadata": {"digid_email": {"is_known": true, "description": "email"}}
        }
        ```"#;
        let m = parse_mapping_response(text).unwrap();
        assert_eq!(m.header_mapping.get(&2).map(String::as_str), Some("pdata_country"));
        assert_eq!(m.column_separators, vec![":", "|"]);
        assert_eq!(m.strip_prefixes.len(), 1);
        assert_eq!(m.strip_prefixes.get(&1).map(String::as_str), Some("Name:"));
        assert!(!m.input_has_header);
        assert!(m.header_metadata["digid_email"].is_known);
    }

    #[test]
    fn separator_count_must_match_column_count() {
        let reply = |total: usize, seps: &str| {
            format!(
                r#"{{"header_mapping": {{"0": "digid_email"}}, "normalization_map": {{}},
                   "matched_columns_count": 1, "input_has_header": true,
                   "total_columns": {total}, "column_separators": {seps}}}"#
            )
        };

        let err = parse_mapping_response(&reply(0, r#"[",", ",", ","]"#)).unwrap_err();
        assert!(matches!(err, MappingError::Malformed(ref m) if m.contains("total_columns")));

        let err = parse_mapping_response(&reply(3, r#"[","]"#)).unwrap_err();
        assert_eq!(
            err,
            MappingError::Malformed("1 column separators for 3 columns, expected 2".to_string())
        );

        assert!(parse_mapping_response(&reply(3, r#"[",", ";"]"#)).is_ok());
        // No separators means the csv dialect is used.
        assert!(parse_mapping_response(&reply(3, "[]")).is_ok());
    }

    #[test]
    fn timeout_message_keeps_sub_second_precision() {
        assert_eq!(
            MappingError::Timeout(Duration::from_millis(200)).to_string(),
            "Timeout after 200ms"
        );
        assert_eq!(
            MappingError::Timeout(Duration::from_secs(180)).to_string(),
            "Timeout after 180s"
        );
    }

    #[test]
    fn missing_keys_are_malformed() {
        let err = parse_mapping_response(r#"{"header_mapping": {}, "total_columns": 1}"#).unwrap_err();
        match err {
            MappingError::Malformed(msg) => {
                assert!(msg.contains("normalization_map"));
                assert!(msg.contains("input_has_header"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(
            parse_mapping_response("I could not find any columns"),
            Err(MappingError::Malformed(_))
        ));
        assert!(matches!(
            parse_mapping_response("{not json}"),
            Err(MappingError::Malformed(_))
        ));
    }

    #[test]
    fn tab_separator_survives_trimming() {
        assert_eq!(trim_separator("\t".to_string()), "\t");
        assert_eq!(trim_separator(" ; ".to_string()), ";");
    }

    struct Echo;
    impl SchemaMapper for Echo {
        fn infer(&self, _r: &MappingRequest) -> Result<MappingResponse, MappingError> {
            Err(MappingError::Client("unused".into()))
        }
    }

    #[test]
    fn default_token_estimate_grows_with_rows() {
        let small = MappingRequest {
            sample_rows: vec![vec!["a".into(); 4]],
            known_headers: BTreeMap::new(),
        };
        let mut big = small.clone();
        big.sample_rows = vec![vec!["abcdefgh".into(); 4]; 100];
        assert!(Echo.estimate_tokens(&big) > Echo.estimate_tokens(&small));
    }
}

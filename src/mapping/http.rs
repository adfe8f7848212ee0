//! Blocking HTTP adapter for the schema-mapping service.
//!
//! POSTs `{"sample_rows": [...], "known_headers": {...}}` as JSON and expects either
//! `{"text": "...", "usage": {"input_tokens": n, "output_tokens": n}}` or a bare mapping object
//! as the body.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;

use super::{MappingError, MappingRequest, MappingResponse, SchemaMapper, parse_retry_delay};
use crate::config::MappingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::TokenUsage;

#[derive(Debug, Deserialize)]
struct Envelope {
    text: String,
    #[serde(default)]
    usage: TokenUsage,
}

/// Schema mapper backed by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpSchemaMapper {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSchemaMapper {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config {
                message: format!("could not build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Build from `[mapping]`; `None` when no endpoint is configured.
    pub fn from_config(cfg: &MappingConfig) -> PipelineResult<Option<Self>> {
        match &cfg.endpoint {
            Some(endpoint) => Self::new(endpoint.clone(), cfg.attempt_timeout()).map(Some),
            None => Ok(None),
        }
    }
}

impl SchemaMapper for HttpSchemaMapper {
    fn infer(&self, request: &MappingRequest) -> Result<MappingResponse, MappingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    MappingError::Timeout(self.timeout)
                } else {
                    MappingError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let header_delay = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .map_err(|e| MappingError::Transport(format!("could not read response body: {e}")))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(MappingError::QuotaExceeded {
                retry_after: header_delay.or_else(|| parse_retry_delay(&body)),
                message: format!("{status}: {}", truncate(&body, 300)),
            });
        }
        if status.is_client_error() {
            return Err(MappingError::Client(format!("{status}: {}", truncate(&body, 300))));
        }
        if !status.is_success() {
            return Err(MappingError::Transport(format!("{status}: {}", truncate(&body, 300))));
        }

        Ok(match serde_json::from_str::<Envelope>(&body) {
            Ok(env) => MappingResponse {
                text: env.text,
                usage: env.usage,
            },
            Err(_) => MappingResponse {
                text: body,
                usage: TokenUsage::default(),
            },
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_endpoint_means_no_mapper() {
        assert!(HttpSchemaMapper::from_config(&MappingConfig::default()).unwrap().is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}

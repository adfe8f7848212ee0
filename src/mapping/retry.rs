//! Bounded retry loop around the schema-mapping service.
//!
//! The loop is a small state machine: `{attempt, sample size, last error}` goes to either
//! `RetryAfter(delay, sample size)` or `Abort`. Each attempt runs on its own thread and is
//! abandoned (not cancelled) once the per-attempt timeout elapses.

use std::sync::{Arc, OnceLock, mpsc};
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use super::{MappingError, MappingRequest, MappingResponse, SchemaMapper, parse_mapping_response};
use crate::classifier::KnownHeaders;
use crate::config::MappingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{SchemaMapping, TokenUsage};

/// Retry limits derived from [`MappingConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub max_retry_delay: Duration,
    pub token_budget: usize,
}

impl From<&MappingConfig> for RetryPolicy {
    fn from(cfg: &MappingConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            attempt_timeout: cfg.attempt_timeout(),
            max_retry_delay: cfg.max_retry_delay(),
            token_budget: cfg.token_budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then retry with the first `sample_len` rows.
    RetryAfter { delay: Duration, sample_len: usize },
    Abort,
}

/// Progress of the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    pub sample_len: usize,
    pub last_error: Option<MappingError>,
}

impl RetryState {
    pub fn new(sample_len: usize) -> Self {
        Self {
            attempt: 0,
            sample_len,
            last_error: None,
        }
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// - quota: halve the sample, wait the server-provided delay (capped)
    /// - timeout: shrink the sample by a fifth, retry immediately
    /// - malformed or transport: retry immediately with the same sample
    /// - client error: abort
    pub fn on_failure(&mut self, error: MappingError, policy: &RetryPolicy) -> RetryDecision {
        self.attempt += 1;
        let decision = match &error {
            MappingError::Client(_) => RetryDecision::Abort,
            _ if self.attempt >= policy.max_attempts => RetryDecision::Abort,
            MappingError::QuotaExceeded { retry_after, .. } => {
                let next = self.sample_len / 2;
                if next < 1 {
                    RetryDecision::Abort
                } else {
                    RetryDecision::RetryAfter {
                        delay: retry_after.unwrap_or_default().min(policy.max_retry_delay),
                        sample_len: next,
                    }
                }
            }
            MappingError::Timeout(_) => RetryDecision::RetryAfter {
                delay: Duration::ZERO,
                sample_len: shrunk_len(self.sample_len).max(1),
            },
            MappingError::Malformed(_) | MappingError::Transport(_) => RetryDecision::RetryAfter {
                delay: Duration::ZERO,
                sample_len: self.sample_len,
            },
        };
        if let RetryDecision::RetryAfter { sample_len, .. } = decision {
            self.sample_len = sample_len;
        }
        self.last_error = Some(error);
        decision
    }

    /// Stage error reported once the loop gave up.
    pub fn into_error(self) -> PipelineError {
        let attempts = self.attempt;
        let Some(last) = self.last_error else {
            return PipelineError::MappingServiceFailed {
                attempts,
                message: "no attempt was made".to_string(),
            };
        };
        let message = format!("Schema mapping failed after {attempts} attempts. Last error: {last}");
        match last {
            MappingError::Timeout(_) => PipelineError::MappingServiceTimeout { attempts, message },
            MappingError::QuotaExceeded { .. } => {
                PipelineError::MappingServiceQuotaExceeded { attempts, message }
            }
            MappingError::Malformed(_) => PipelineError::MappingServiceMalformed { attempts, message },
            MappingError::Client(_) | MappingError::Transport(_) => {
                PipelineError::MappingServiceFailed { attempts, message }
            }
        }
    }
}

fn shrunk_len(len: usize) -> usize {
    len * 4 / 5
}

/// Best-effort parse of a provider retry hint such as `'retryDelay': '12s'`.
pub fn parse_retry_delay(text: &str) -> Option<Duration> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r#"retryDelay['"]?\s*[:=]\s*['"]?(\d+(?:\.\d+)?)s"#).ok())
        .as_ref()?;
    let secs: f64 = re.captures(text)?.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs_f64(secs))
}

/// Estimated cost of `usage` at the configured per-million-token prices.
pub fn estimated_cost(usage: TokenUsage, cfg: &MappingConfig) -> f64 {
    usage.input_tokens as f64 * cfg.input_token_price_per_million / 1_000_000.0
        + usage.output_tokens as f64 * cfg.output_token_price_per_million / 1_000_000.0
}

/// A mapping obtained from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredMapping {
    pub mapping: SchemaMapping,
    pub usage: TokenUsage,
    pub attempts: u32,
    /// Rows actually sent on the successful attempt.
    pub rows_sent: usize,
    pub warnings: Vec<String>,
}

/// Shrink `rows` by a fifth at a time (the first row always kept) until the request estimate
/// fits the budget.
fn fit_to_budget(
    mapper: &dyn SchemaMapper,
    mut rows: Vec<Vec<String>>,
    known: &KnownHeaders,
    budget: usize,
    warnings: &mut Vec<String>,
) -> PipelineResult<Vec<Vec<String>>> {
    loop {
        if rows.is_empty() {
            return Err(PipelineError::SampleEmpty {
                message: "sample is empty after attempting to reduce token count".to_string(),
            });
        }
        let request = MappingRequest {
            sample_rows: rows,
            known_headers: known.descriptions(),
        };
        let estimate = mapper.estimate_tokens(&request);
        rows = request.sample_rows;
        if estimate <= budget {
            return Ok(rows);
        }
        let next = shrunk_len(rows.len());
        if next < 1 {
            return Err(PipelineError::MappingServiceFailed {
                attempts: 0,
                message: format!("Cannot reduce sample size further to meet token limit of {budget}."),
            });
        }
        let msg = format!(
            "Token estimate ({estimate}) exceeds limit ({budget}). Reducing sample from {} to {next} rows.",
            rows.len()
        );
        warn!("{msg}");
        warnings.push(msg);
        rows.truncate(next);
    }
}

fn call_with_timeout(
    mapper: &Arc<dyn SchemaMapper>,
    request: MappingRequest,
    timeout: Duration,
) -> Result<MappingResponse, MappingError> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(mapper);
    thread::spawn(move || {
        let _ = tx.send(worker.infer(&request));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(MappingError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(MappingError::Transport(
            "mapping call ended without a reply".to_string(),
        )),
    }
}

/// Run schema inference for `sample` within the retry policy.
pub fn infer_schema(
    mapper: &Arc<dyn SchemaMapper>,
    sample: Vec<Vec<String>>,
    known: &KnownHeaders,
    policy: &RetryPolicy,
) -> PipelineResult<InferredMapping> {
    let mut warnings = Vec::new();
    let mut rows = fit_to_budget(mapper.as_ref(), sample, known, policy.token_budget, &mut warnings)?;
    let mut state = RetryState::new(rows.len());

    loop {
        info!(
            attempt = state.attempt + 1,
            max_attempts = policy.max_attempts,
            rows = rows.len(),
            "schema mapping attempt"
        );
        let request = MappingRequest {
            sample_rows: rows.clone(),
            known_headers: known.descriptions(),
        };
        let error = match call_with_timeout(mapper, request, policy.attempt_timeout) {
            Ok(response) => {
                let usage = response.usage;
                match parse_mapping_response(&response.text) {
                    Ok(mapping) => {
                        info!(
                            matched = mapping.matched_columns_count,
                            total = mapping.total_columns,
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "schema mapping received"
                        );
                        return Ok(InferredMapping {
                            mapping,
                            usage,
                            attempts: state.attempt + 1,
                            rows_sent: rows.len(),
                            warnings,
                        });
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        warn!(attempt = state.attempt + 1, error = %error, "schema mapping attempt failed");
        warnings.push(format!(
            "Schema mapping attempt {} failed: {error}",
            state.attempt + 1
        ));
        match state.on_failure(error, policy) {
            RetryDecision::Abort => return Err(state.into_error()),
            RetryDecision::RetryAfter { delay, sample_len } => {
                rows.truncate(sample_len);
                if !delay.is_zero() {
                    info!(delay_secs = delay.as_secs_f64(), "waiting before retry");
                    thread::sleep(delay);
                }
            }
        }
    }
}

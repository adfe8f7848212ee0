//! Pipeline configuration.
//!
//! Every field has a default, so an empty file (or [`PipelineConfig::default`]) is a valid
//! configuration. Files are read as TOML or JSON depending on their extension.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Main configuration for the ingestion pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub classifier: ClassifierConfig,
    pub sampler: SamplerConfig,
    pub mapping: MappingConfig,
    pub normalizer: NormalizerConfig,
    pub worker: WorkerConfig,
}

/// Directory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Files are picked up from here.
    pub inbound_dir: PathBuf,
    /// Normalized CSV outputs.
    pub output_dir: PathBuf,
    /// Line-oriented JSON mirrors of the normalized rows.
    pub json_output_dir: PathBuf,
    /// Invalid-rows side files.
    pub invalid_dir: PathBuf,
    /// Files rejected by classification are moved here.
    pub quarantine_dir: PathBuf,
    /// Per-run log files.
    pub logs_dir: PathBuf,
    /// Optional known-header dictionary; the bundled one is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_headers: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            inbound_dir: PathBuf::from("data/inbound"),
            output_dir: PathBuf::from("data/output"),
            json_output_dir: PathBuf::from("data/be_output"),
            invalid_dir: PathBuf::from("data/invalid"),
            quarantine_dir: PathBuf::from("data/not_tabular"),
            logs_dir: PathBuf::from("logs"),
            known_headers: None,
        }
    }
}

impl PathsConfig {
    /// All paths rooted under `root`, using the default sub-directory names.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let d = Self::default();
        Self {
            inbound_dir: root.join(d.inbound_dir),
            output_dir: root.join(d.output_dir),
            json_output_dir: root.join(d.json_output_dir),
            invalid_dir: root.join(d.invalid_dir),
            quarantine_dir: root.join(d.quarantine_dir),
            logs_dir: root.join(d.logs_dir),
            known_headers: None,
        }
    }
}

/// Encoding/tabular/known-header classification knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum share (0-1) of sampled lines that must share the modal delimiter pattern.
    pub tabular_min_ratio: f64,
    /// Known-header match percentage (0-100) at or above which schema inference is skipped.
    pub known_header_threshold: f64,
    /// Upper bound on lines inspected by the tabular heuristic.
    pub max_sample_lines: usize,
    /// Lines always inspected from the top of the file.
    pub head_lines: usize,
    /// Bytes fed to statistical encoding detection.
    pub encoding_probe_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            tabular_min_ratio: 0.10,
            known_header_threshold: 90.0,
            max_sample_lines: 10_000,
            head_lines: 50,
            encoding_probe_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Data rows extracted after the first row.
    pub max_rows: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { max_rows: 1000 }
    }
}

/// External schema-mapping service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Estimated request size above which the sample is shrunk before calling.
    pub token_budget: usize,
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    /// Cap applied to server-provided retry delays.
    pub max_retry_delay_secs: u64,
    pub input_token_price_per_million: f64,
    pub output_token_price_per_million: f64,
    /// Endpoint used by the HTTP adapter (feature `http-mapper`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            token_budget: 180_000,
            max_attempts: 3,
            attempt_timeout_secs: 180,
            max_retry_delay_secs: 120,
            input_token_price_per_million: 0.30,
            output_token_price_per_million: 2.50,
            endpoint: None,
        }
    }
}

impl MappingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub write_json_mirror: bool,
    /// Columns with fewer non-empty values are skipped by the repetitive-pattern pass.
    pub qa_min_values: usize,
    pub qa_min_substring_len: usize,
    /// A substring is flagged when it occurs in more than this share of rows.
    pub qa_row_ratio: f64,
    /// Values are truncated to this many characters before substring enumeration.
    pub qa_max_value_chars: usize,
    /// Distinct substrings tracked per column; substrings first seen after the cap is reached
    /// are not counted.
    pub qa_max_distinct_substrings: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            write_json_mirror: true,
            qa_min_values: 3,
            qa_min_substring_len: 3,
            qa_row_ratio: 0.5,
            qa_max_value_chars: 256,
            qa_max_distinct_substrings: 500_000,
        }
    }
}

/// Sequential worker pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub idle_poll_secs: u64,
    pub between_runs_secs: u64,
    pub error_backoff_secs: u64,
    /// Priority given to runs enqueued by the inbound scan (lower runs first).
    pub default_priority: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_secs: 5,
            between_runs_secs: 1,
            error_backoff_secs: 10,
            default_priority: 3,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "json" => Self::from_json(&contents)?,
            _ => Self::from_toml(&contents)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> PipelineResult<Self> {
        toml::from_str(contents).map_err(|e| PipelineError::Config {
            message: e.to_string(),
        })
    }

    pub fn from_json(contents: &str) -> PipelineResult<Self> {
        serde_json::from_str(contents).map_err(|e| PipelineError::Config {
            message: e.to_string(),
        })
    }

    pub fn to_toml(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config {
            message: e.to_string(),
        })
    }

    /// Validate value ranges.
    pub fn validate(&self) -> PipelineResult<()> {
        let c = &self.classifier;
        if !(c.tabular_min_ratio > 0.0 && c.tabular_min_ratio <= 1.0) {
            return Err(config_err(format!(
                "classifier.tabular_min_ratio must be in (0, 1], got {}",
                c.tabular_min_ratio
            )));
        }
        if !(0.0..=100.0).contains(&c.known_header_threshold) {
            return Err(config_err(format!(
                "classifier.known_header_threshold must be in [0, 100], got {}",
                c.known_header_threshold
            )));
        }
        if c.max_sample_lines == 0 || c.encoding_probe_bytes == 0 {
            return Err(config_err(
                "classifier.max_sample_lines and classifier.encoding_probe_bytes must be > 0",
            ));
        }
        if self.sampler.max_rows == 0 {
            return Err(config_err("sampler.max_rows must be > 0"));
        }
        if self.mapping.max_attempts == 0 {
            return Err(config_err("mapping.max_attempts must be > 0"));
        }
        if self.mapping.token_budget == 0 {
            return Err(config_err("mapping.token_budget must be > 0"));
        }
        let n = &self.normalizer;
        if !(n.qa_row_ratio > 0.0 && n.qa_row_ratio < 1.0) {
            return Err(config_err(format!(
                "normalizer.qa_row_ratio must be in (0, 1), got {}",
                n.qa_row_ratio
            )));
        }
        if n.qa_max_distinct_substrings == 0 {
            return Err(config_err("normalizer.qa_max_distinct_substrings must be > 0"));
        }
        Ok(())
    }

    /// Create every configured directory.
    pub fn ensure_directories(&self) -> PipelineResult<()> {
        let p = &self.paths;
        for dir in [
            &p.inbound_dir,
            &p.output_dir,
            &p.json_output_dir,
            &p.invalid_dir,
            &p.quarantine_dir,
            &p.logs_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn config_err(message: impl Into<String>) -> PipelineError {
    PipelineError::Config {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineConfig;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.classifier.known_header_threshold, 90.0);
        assert_eq!(cfg.classifier.tabular_min_ratio, 0.10);
        assert_eq!(cfg.mapping.attempt_timeout_secs, 180);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = PipelineConfig::from_toml(
            r#"
            [classifier]
            known_header_threshold = 75.0

            [paths]
            inbound_dir = "/srv/inbound"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.classifier.known_header_threshold, 75.0);
        assert_eq!(cfg.classifier.head_lines, 50);
        assert_eq!(cfg.paths.inbound_dir.to_str(), Some("/srv/inbound"));
        assert_eq!(cfg.sampler.max_rows, 1000);
    }

    #[test]
    fn json_config_is_accepted() {
        let cfg = PipelineConfig::from_json(r#"{"sampler": {"max_rows": 10}}"#).unwrap();
        assert_eq!(cfg.sampler.max_rows, 10);
    }

    #[test]
    fn out_of_range_ratio_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.classifier.tabular_min_ratio = 0.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tabular_min_ratio"));
    }

    #[test]
    fn toml_round_trips_through_print() {
        let cfg = PipelineConfig::default();
        let text = cfg.to_toml().unwrap();
        assert_eq!(PipelineConfig::from_toml(&text).unwrap(), cfg);
    }
}

//! Drives one file through classification, sampling, schema mapping and normalization.
//!
//! Every stage transition is written to the run store before the next stage starts, so a run
//! that dies mid-way leaves an inspectable partial history. The known-header fast path and the
//! inferred path are selected once, right after classification.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, info_span, warn};

use super::run::{Run, RunId, RunStatus, Stage, StageStatus};
use super::store::RunStore;
use crate::classifier::{KnownHeaders, classify_file};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ingestion::observability::{LogLevel, RunContext, RunLog, RunObserver, TracingObserver};
use crate::mapping::{RetryPolicy, SchemaMapper, estimated_cost, infer_schema};
use crate::normalizer::{Normalizer, OutputPaths};
use crate::sampler::extract_sample;
use crate::types::{
    ClassificationResult, HeaderMetadata, NormalizationOutcome, SchemaMapping, TokenUsage,
};

/// How the schema mapping of a run was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPath {
    /// Known-header match at or above the threshold; sampling and mapping are skipped.
    FastPath,
    /// Sample rows were sent to the schema-mapping service.
    Inferred,
}

impl SchemaPath {
    /// Pick the path for a classified file. Decided once per run.
    pub fn select(cls: &ClassificationResult, threshold: f64) -> Self {
        if cls.total_columns_count > 0 && cls.known_header_percentage >= threshold {
            SchemaPath::FastPath
        } else {
            SchemaPath::Inferred
        }
    }
}

/// Mapping derived directly from the known-header match of the first row.
pub fn fast_path_mapping(cls: &ClassificationResult, known: &KnownHeaders) -> SchemaMapping {
    let mut mapping = SchemaMapping {
        matched_columns_count: cls.known_columns_count,
        input_has_header: true,
        total_columns: cls.total_columns_count,
        column_separators: cls.separators.clone(),
        ..Default::default()
    };
    for (i, header) in cls.standardized_headers.iter().enumerate() {
        mapping.header_mapping.insert(i, header.clone());
        mapping.normalization_map.insert(
            header.clone(),
            cls.normalize_flags.get(i).copied().unwrap_or(false),
        );
        let meta = match known.get(header) {
            Some(h) => HeaderMetadata {
                is_known: true,
                description: h.description.clone(),
            },
            None => HeaderMetadata::default(),
        };
        mapping.header_metadata.insert(header.clone(), meta);
    }
    mapping
}

/// Output of a successful stage.
struct StageOutput<T> {
    value: T,
    warnings: Vec<String>,
}

impl<T> StageOutput<T> {
    fn new(value: T, warnings: Vec<String>) -> Self {
        Self { value, warnings }
    }
}

/// A stage body failure, with the warnings gathered before it.
struct StageError {
    error: PipelineError,
    warnings: Vec<String>,
}

impl From<PipelineError> for StageError {
    fn from(error: PipelineError) -> Self {
        Self {
            error,
            warnings: Vec::new(),
        }
    }
}

/// The stage that aborted a run.
struct Failure {
    stage: Stage,
    error: PipelineError,
}

/// Run-scoped handles: the store-backed run id, the observer and the run's own log sink.
struct RunScope<'a> {
    store: &'a dyn RunStore,
    observer: &'a dyn RunObserver,
    log: RunLog,
    ctx: RunContext,
}

impl RunScope<'_> {
    fn id(&self) -> RunId {
        self.ctx.run_id
    }

    fn patch(&self, mut f: impl FnMut(&mut Run)) -> PipelineResult<Run> {
        Ok(self.store.update(self.id(), &mut f)?)
    }

    fn message(&self, level: LogLevel, message: &str) {
        self.observer.on_message(&self.ctx, level, message);
        self.log.on_message(&self.ctx, level, message);
    }

    fn transition(
        &self,
        stage: Stage,
        status: StageStatus,
        warnings: &[String],
        error_message: Option<&str>,
    ) -> PipelineResult<Run> {
        let now = Utc::now();
        let run = self.patch(|r| r.record_stage(stage, status, warnings, error_message, now))?;
        self.observer.on_stage(&self.ctx, stage, status, error_message);
        self.log.on_stage(&self.ctx, stage, status, error_message);
        Ok(run)
    }

    fn skip(&self, stage: Stage) -> Result<(), Failure> {
        self.transition(stage, StageStatus::Skipped, &[], None)
            .map(|_| ())
            .map_err(|error| Failure { stage, error })
    }

    /// Mark `stage` running, execute `body`, then record `ok` or `error`.
    fn run_stage<T>(
        &self,
        stage: Stage,
        body: impl FnOnce(&Self) -> Result<StageOutput<T>, StageError>,
    ) -> Result<T, Failure> {
        self.transition(stage, StageStatus::Running, &[], None)
            .map_err(|error| Failure { stage, error })?;
        match body(self) {
            Ok(out) => {
                self.transition(stage, StageStatus::Ok, &out.warnings, None)
                    .map_err(|error| Failure { stage, error })?;
                Ok(out.value)
            }
            Err(StageError { error, warnings }) => {
                let msg = error.to_string();
                if let Err(e) = self.transition(stage, StageStatus::Error, &warnings, Some(&msg)) {
                    error!(stage = %stage, error = %e, "could not record stage failure");
                }
                Err(Failure { stage, error })
            }
        }
    }
}

/// Sequential pipeline driver.
pub struct Orchestrator {
    config: PipelineConfig,
    known: Arc<KnownHeaders>,
    store: Arc<dyn RunStore>,
    mapper: Option<Arc<dyn SchemaMapper>>,
    observer: Arc<dyn RunObserver>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("known_headers", &self.known.len())
            .field("mapper", &self.mapper.is_some())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, known: Arc<KnownHeaders>, store: Arc<dyn RunStore>) -> Self {
        Self {
            config,
            known,
            store,
            mapper: None,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Schema-mapping service used on the inferred path. Without one, inferred runs fail at
    /// the schema-mapping stage.
    pub fn with_mapper(mut self, mapper: Arc<dyn SchemaMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn known_headers(&self) -> &KnownHeaders {
        &self.known
    }

    /// Enqueue `filename` with the configured default priority (idempotent).
    pub fn enqueue(&self, filename: &str) -> PipelineResult<RunId> {
        Ok(self
            .store
            .enqueue(filename, self.config.worker.default_priority)?)
    }

    /// Process the file at `path` end to end and return the terminal run.
    ///
    /// Stage failures do not produce an `Err`: they are recorded on the returned run (status
    /// `error`, failing stage and message). `Err` means the run store itself failed.
    pub fn process_file(&self, path: &Path) -> PipelineResult<Run> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::Unreadable {
                message: format!("path has no file name: {}", path.display()),
            })?;

        let run = self
            .store
            .begin(&filename, self.config.worker.default_priority)?;
        let span = info_span!("run", run_id = %run.id, filename = %filename);
        let _entered = span.enter();

        let scope = RunScope {
            store: self.store.as_ref(),
            observer: self.observer.as_ref(),
            log: RunLog::open(&self.config.paths.logs_dir, run.id, &filename),
            ctx: RunContext {
                run_id: run.id,
                filename: filename.clone(),
            },
        };
        scope.message(LogLevel::Info, &format!("Starting pipeline for file: {filename}"));

        let finished = match self.execute(&scope, path) {
            Ok(outcome) => self.finish_ok(&scope, &outcome)?,
            Err(failure) => self.finish_failed(&scope, path, failure)?,
        };
        self.observer.on_finished(&scope.ctx, &finished);
        scope.log.on_finished(&scope.ctx, &finished);
        Ok(finished)
    }

    fn execute(&self, scope: &RunScope<'_>, path: &Path) -> Result<NormalizationOutcome, Failure> {
        let cls = scope.run_stage(Stage::Classification, |s| self.classify(s, path))?;

        let mapping = match SchemaPath::select(&cls, self.config.classifier.known_header_threshold) {
            SchemaPath::FastPath => {
                scope.message(
                    LogLevel::Info,
                    &format!(
                        "Automatic classification for {} with known percentage: {}%",
                        scope.ctx.filename, cls.known_header_percentage
                    ),
                );
                let mapping = fast_path_mapping(&cls, &self.known);
                scope.skip(Stage::Sampling)?;
                scope.skip(Stage::SchemaMapping)?;
                let stored = mapping.clone();
                scope
                    .patch(|r| {
                        r.schema_mapping = Some(stored.clone());
                        r.tokens = TokenUsage::default();
                        r.estimated_cost = 0.0;
                    })
                    .map_err(|error| Failure {
                        stage: Stage::SchemaMapping,
                        error,
                    })?;
                mapping
            }
            SchemaPath::Inferred => {
                let rows = scope.run_stage(Stage::Sampling, |s| self.sample(s, path, &cls))?;
                scope.run_stage(Stage::SchemaMapping, |s| self.infer(s, rows))?
            }
        };

        scope.run_stage(Stage::Normalization, |s| self.normalize(s, path, &cls, &mapping))
    }

    fn classify(
        &self,
        scope: &RunScope<'_>,
        path: &Path,
    ) -> Result<StageOutput<ClassificationResult>, StageError> {
        let cls = classify_file(path, &self.config.classifier, &self.known);
        scope.patch(|r| {
            r.original_file_size = cls.file_size;
            r.original_row_count = Some(cls.row_count);
            r.encoding = cls.encoding.clone();
            r.known_header_percentage = Some(cls.known_header_percentage);
        })?;
        if let Some(error) = cls.to_error() {
            return Err(StageError {
                error,
                warnings: cls.warnings,
            });
        }
        let warnings = cls.warnings.clone();
        Ok(StageOutput::new(cls, warnings))
    }

    fn sample(
        &self,
        scope: &RunScope<'_>,
        path: &Path,
        cls: &ClassificationResult,
    ) -> Result<StageOutput<Vec<Vec<String>>>, StageError> {
        let sample = extract_sample(path, cls.encoding.as_deref(), &self.config.sampler)?;
        scope.patch(|r| r.sample_rows = Some(sample.rows.clone()))?;
        Ok(StageOutput::new(sample.rows, sample.warnings))
    }

    fn infer(
        &self,
        scope: &RunScope<'_>,
        rows: Vec<Vec<String>>,
    ) -> Result<StageOutput<SchemaMapping>, StageError> {
        let mapper = self
            .mapper
            .as_ref()
            .ok_or_else(|| PipelineError::MappingServiceFailed {
                attempts: 0,
                message: "no schema-mapping service configured".to_string(),
            })?;
        let policy = RetryPolicy::from(&self.config.mapping);
        let inferred = infer_schema(mapper, rows, &self.known, &policy)?;
        let cost = estimated_cost(inferred.usage, &self.config.mapping);
        scope.patch(|r| {
            r.tokens = inferred.usage;
            r.estimated_cost = cost;
            r.schema_mapping = Some(inferred.mapping.clone());
        })?;
        scope.message(
            LogLevel::Info,
            &format!(
                "Schema mapping used {} input / {} output tokens ({} total, estimated cost ${cost:.6}) after {} attempt(s) with {} sample rows",
                inferred.usage.input_tokens,
                inferred.usage.output_tokens,
                inferred.usage.total(),
                inferred.attempts,
                inferred.rows_sent
            ),
        );
        Ok(StageOutput::new(inferred.mapping, inferred.warnings))
    }

    fn normalize(
        &self,
        scope: &RunScope<'_>,
        path: &Path,
        cls: &ClassificationResult,
        mapping: &SchemaMapping,
    ) -> Result<StageOutput<NormalizationOutcome>, StageError> {
        let paths = OutputPaths::for_input(
            path,
            &self.config.paths,
            self.config.normalizer.write_json_mirror,
        );
        let outcome = Normalizer::new(mapping, &self.known, &self.config.normalizer)
            .normalize_file(path, cls.encoding.as_deref(), &paths)?;

        for p in &outcome.repetitive_patterns {
            scope.message(
                LogLevel::Warning,
                &format!(
                    "Repetitive pattern detected in column {} '{}': substring '{}' appears in {}/{} rows ({:.1}% of all rows)",
                    p.column_index,
                    p.header,
                    p.substring,
                    p.occurrences,
                    p.total_rows,
                    p.percentage()
                ),
            );
        }

        let mut invalid = outcome.skipped_line_numbers.clone();
        invalid.sort_unstable();
        scope.patch(|r| {
            r.final_file_size = Some(outcome.output_size);
            r.final_row_count = Some(outcome.rows_written);
            r.valid_row_percentage = r
                .original_row_count
                .filter(|&n| n > 0)
                .map(|n| round2(outcome.rows_written as f64 / n as f64 * 100.0));
            r.invalid_line_numbers = invalid.clone();
        })?;
        let warnings = outcome.warnings.clone();
        Ok(StageOutput::new(outcome, warnings))
    }

    fn finish_ok(&self, scope: &RunScope<'_>, outcome: &NormalizationOutcome) -> PipelineResult<Run> {
        let now = Utc::now();
        let run = scope.patch(|r| match r.stage_stats.implied_status() {
            Some(RunStatus::Ok) => r.finish(RunStatus::Ok, None, now),
            _ => r.finish(
                RunStatus::Error,
                Some("pipeline ended without every stage resolving to ok or skipped".to_string()),
                now,
            ),
        })?;
        if run.status != RunStatus::Ok {
            scope.message(
                LogLevel::Error,
                &format!("Normalization not completed for {}, not marking as ok.", run.filename),
            );
            return Ok(run);
        }

        let name = &run.filename;
        let pct = run
            .valid_row_percentage
            .map(|p| p.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        for line in [
            format!("Successfully processed {name}"),
            format!("Processing statistics for {name}:"),
            format!("  - Original input lines: {}", run.original_row_count.unwrap_or(0)),
            format!("  - Original non-empty lines processed: {}", outcome.rows_read),
            format!(
                "  - Invalid lines (blank/malformed): {}",
                outcome.skipped_line_numbers.len()
            ),
            format!("  - Lines written to normalized output: {}", outcome.rows_written),
            format!("  - Valid row percentage: {pct}%"),
            format!("  - Processing duration: {}ms", run.duration_ms.unwrap_or(0)),
        ] {
            scope.message(LogLevel::Info, &line);
        }
        Ok(run)
    }

    fn finish_failed(&self, scope: &RunScope<'_>, path: &Path, failure: Failure) -> PipelineResult<Run> {
        let Failure { stage, error } = failure;
        let name = scope.ctx.filename.clone();
        error!(
            %stage,
            severity = ?error.severity(),
            attributed_stage = ?error.stage(),
            error = %error,
            "run failed"
        );
        scope.message(LogLevel::Error, &format!("Pipeline failed for {name}: {error}"));

        if stage == Stage::Classification {
            match self.quarantine(path, &name) {
                Ok(dest) => scope.message(
                    LogLevel::Warning,
                    &format!("Moved {name} to {}", dest.display()),
                ),
                Err(e) => warn!(file = %path.display(), error = %e, "could not quarantine file"),
            }
        }

        let message = format!("{stage}: {error}");
        let now = Utc::now();
        let run = scope.patch(|r| r.finish(RunStatus::Error, Some(message.clone()), now))?;
        scope.message(
            LogLevel::Error,
            &format!(
                "Pipeline processing for {name} ended with ERRORS (run ID: {}). Check the log file for details.",
                run.id
            ),
        );
        Ok(run)
    }

    /// Move a rejected file into the quarantine directory (never deletes it).
    fn quarantine(&self, path: &Path, filename: &str) -> std::io::Result<PathBuf> {
        let dir = &self.config.paths.quarantine_dir;
        std::fs::create_dir_all(dir)?;
        let dest = dir.join(filename);
        if std::fs::rename(path, &dest).is_err() {
            // Cross-device moves.
            std::fs::copy(path, &dest)?;
            std::fs::remove_file(path)?;
        }
        info!(from = %path.display(), to = %dest.display(), "quarantined file");
        Ok(dest)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

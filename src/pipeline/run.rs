//! Run record and per-stage history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{SchemaMapping, TokenUsage};

/// Opaque run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle: `enqueued -> running -> (ok | error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Enqueued,
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Ok | RunStatus::Error)
    }
}

/// The four ordered sub-stages of a running run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classification,
    Sampling,
    SchemaMapping,
    Normalization,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Classification,
        Stage::Sampling,
        Stage::SchemaMapping,
        Stage::Normalization,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Classification => "classification",
            Stage::Sampling => "sampling",
            Stage::SchemaMapping => "schema_mapping",
            Stage::Normalization => "normalization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Ok,
    Error,
    Skipped,
}

impl StageStatus {
    /// `ok` or `skipped`.
    pub fn is_success(self) -> bool {
        matches!(self, StageStatus::Ok | StageStatus::Skipped)
    }
}

/// History of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
}

/// Fixed-size stage history, indexed by [`Stage`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    records: [Option<StageRecord>; 4],
}

impl StageStats {
    pub fn get(&self, stage: Stage) -> Option<&StageRecord> {
        self.records[stage.index()].as_ref()
    }

    /// Recorded stages in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageRecord)> {
        Stage::ALL
            .into_iter()
            .filter_map(|s| self.records[s.index()].as_ref().map(|r| (s, r)))
    }

    pub fn is_empty(&self) -> bool {
        self.records.iter().all(Option::is_none)
    }

    /// Record a transition for `stage` at time `now`.
    ///
    /// `running` sets the start time once; `ok`/`error` set the end time. Warnings are
    /// appended to any already recorded; an error message replaces the previous one.
    pub fn record(
        &mut self,
        stage: Stage,
        status: StageStatus,
        warnings: &[String],
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let slot = &mut self.records[stage.index()];
        let rec = slot.get_or_insert_with(|| StageRecord {
            status,
            start_time: None,
            end_time: None,
            warnings: Vec::new(),
            error_message: None,
        });
        rec.status = status;
        match status {
            StageStatus::Running => {
                if rec.start_time.is_none() {
                    rec.start_time = Some(now);
                }
            }
            StageStatus::Ok | StageStatus::Error => rec.end_time = Some(now),
            StageStatus::Skipped => {}
        }
        rec.warnings.extend(warnings.iter().cloned());
        if let Some(msg) = error_message {
            rec.error_message = Some(msg.to_string());
        }
    }

    /// Earliest recorded stage start.
    pub fn first_start(&self) -> Option<DateTime<Utc>> {
        self.iter().filter_map(|(_, r)| r.start_time).min()
    }

    /// Terminal status implied by the stage history, if the history is terminal.
    ///
    /// `error` as soon as any stage failed; `ok` only when all four stages resolved to `ok` or
    /// `skipped`; `None` otherwise.
    pub fn implied_status(&self) -> Option<RunStatus> {
        if self
            .iter()
            .any(|(_, r)| r.status == StageStatus::Error)
        {
            return Some(RunStatus::Error);
        }
        let all_done = self
            .records
            .iter()
            .all(|r| r.as_ref().is_some_and(|r| r.status.is_success()));
        all_done.then_some(RunStatus::Ok)
    }
}

/// One attempt to process a single input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub filename: String,
    /// Lower values are dequeued first.
    pub priority: u8,
    /// Monotonic insertion sequence assigned by the store; breaks priority ties.
    pub sequence: u64,
    pub status: RunStatus,
    pub inserted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// `"<stage>: <message>"` of the failing stage.
    pub error_message: Option<String>,
    pub stage_stats: StageStats,

    pub original_file_size: Option<u64>,
    pub original_row_count: Option<usize>,
    pub encoding: Option<String>,
    pub known_header_percentage: Option<f64>,
    pub final_file_size: Option<u64>,
    pub final_row_count: Option<usize>,
    pub valid_row_percentage: Option<f64>,
    pub invalid_line_numbers: Vec<usize>,

    pub tokens: TokenUsage,
    pub estimated_cost: f64,
    pub schema_mapping: Option<SchemaMapping>,
    pub sample_rows: Option<Vec<Vec<String>>>,
}

impl Run {
    pub fn new(filename: impl Into<String>, priority: u8, sequence: u64) -> Self {
        Self {
            id: RunId::new(),
            filename: filename.into(),
            priority,
            sequence,
            status: RunStatus::Enqueued,
            inserted_at: Utc::now(),
            start_time: None,
            end_time: None,
            duration_ms: None,
            error_message: None,
            stage_stats: StageStats::default(),
            original_file_size: None,
            original_row_count: None,
            encoding: None,
            known_header_percentage: None,
            final_file_size: None,
            final_row_count: None,
            valid_row_percentage: None,
            invalid_line_numbers: Vec::new(),
            tokens: TokenUsage::default(),
            estimated_cost: 0.0,
            schema_mapping: None,
            sample_rows: None,
        }
    }

    /// Forget results of a previous attempt so the run can start again from classification.
    pub fn reset_for_rerun(&mut self) {
        let id = self.id;
        let filename = std::mem::take(&mut self.filename);
        let (priority, sequence, inserted_at) = (self.priority, self.sequence, self.inserted_at);
        *self = Self::new(filename, priority, sequence);
        self.id = id;
        self.inserted_at = inserted_at;
    }

    /// Record a stage transition; the first `running` transition also stamps the run start.
    pub fn record_stage(
        &mut self,
        stage: Stage,
        status: StageStatus,
        warnings: &[String],
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.stage_stats
            .record(stage, status, warnings, error_message, now);
        if status == StageStatus::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    /// Close the run with a terminal status and compute its duration.
    pub fn finish(&mut self, status: RunStatus, error_message: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error_message = error_message;
        self.end_time = Some(now);
        let start = self.stage_stats.first_start().or(self.start_time);
        self.duration_ms = start.map(|s| (now - s).num_milliseconds());
    }

    /// Whether a terminal status agrees with the stage history.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            RunStatus::Ok | RunStatus::Error => {
                self.stage_stats.implied_status() == Some(self.status)
            }
            RunStatus::Enqueued | RunStatus::Running => true,
        }
    }
}

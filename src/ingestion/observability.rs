//! Per-run observation: stage transitions, run completion, and the per-run log file.
//!
//! A [`RunLog`] is opened by the orchestrator for the duration of one `process_file` call and
//! handed to whatever needs to record run-scoped messages. It is closed when dropped.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::run::{Run, RunId, Stage, StageStatus};

/// Level of a run-scoped message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Identity of the run being observed.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub filename: String,
}

/// Observer interface for run progress.
pub trait RunObserver: Send + Sync {
    /// Called after a stage transition has been persisted.
    fn on_stage(&self, _ctx: &RunContext, _stage: Stage, _status: StageStatus, _detail: Option<&str>) {}

    /// Free-form run-scoped message.
    fn on_message(&self, _ctx: &RunContext, _level: LogLevel, _message: &str) {}

    /// Called once the run reached a terminal status.
    fn on_finished(&self, _ctx: &RunContext, _run: &Run) {}
}

/// Fans callbacks out to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn RunObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl RunObserver for CompositeObserver {
    fn on_stage(&self, ctx: &RunContext, stage: Stage, status: StageStatus, detail: Option<&str>) {
        for o in &self.observers {
            o.on_stage(ctx, stage, status, detail);
        }
    }

    fn on_message(&self, ctx: &RunContext, level: LogLevel, message: &str) {
        for o in &self.observers {
            o.on_message(ctx, level, message);
        }
    }

    fn on_finished(&self, ctx: &RunContext, run: &Run) {
        for o in &self.observers {
            o.on_finished(ctx, run);
        }
    }
}

/// Forwards run events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_stage(&self, ctx: &RunContext, stage: Stage, status: StageStatus, detail: Option<&str>) {
        match status {
            StageStatus::Error => error!(
                run_id = %ctx.run_id,
                file = %ctx.filename,
                stage = %stage,
                detail = detail.unwrap_or(""),
                "stage failed"
            ),
            _ => info!(run_id = %ctx.run_id, file = %ctx.filename, stage = %stage, ?status, "pipeline stage"),
        }
    }

    fn on_message(&self, ctx: &RunContext, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(run_id = %ctx.run_id, "{message}"),
            LogLevel::Warning => warn!(run_id = %ctx.run_id, "{message}"),
            LogLevel::Error => error!(run_id = %ctx.run_id, "{message}"),
        }
    }

    fn on_finished(&self, ctx: &RunContext, run: &Run) {
        info!(
            run_id = %ctx.run_id,
            file = %ctx.filename,
            status = ?run.status,
            duration_ms = run.duration_ms.unwrap_or(0),
            "run finished"
        );
    }
}

/// Context-scoped log file for a single run, at `<logs_dir>/<run_id>_<filename>.log`.
///
/// Writes are best-effort: a sink that cannot be opened or written silently drops lines.
#[derive(Debug)]
pub struct RunLog {
    file: Mutex<Option<File>>,
}

impl RunLog {
    pub fn path_for(logs_dir: &Path, run_id: RunId, filename: &str) -> PathBuf {
        logs_dir.join(format!("{run_id}_{filename}.log"))
    }

    /// Open (append) the log file for `run_id`.
    pub fn open(logs_dir: &Path, run_id: RunId, filename: &str) -> Self {
        let path = Self::path_for(logs_dir, run_id, filename);
        let file = std::fs::create_dir_all(logs_dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
            .map_err(|e| warn!(path = %path.display(), error = %e, "could not open run log"))
            .ok();
        Self {
            file: Mutex::new(file),
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(
                f,
                "{} - {} - {message}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level.label()
            );
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }
}

impl RunObserver for RunLog {
    fn on_stage(&self, _ctx: &RunContext, stage: Stage, status: StageStatus, detail: Option<&str>) {
        let status = match status {
            StageStatus::Running => "running",
            StageStatus::Ok => "ok",
            StageStatus::Error => "error",
            StageStatus::Skipped => "skipped",
        };
        match detail {
            Some(d) => self.info(&format!("Pipeline stage {stage}: {status} ({d})")),
            None => self.info(&format!("Pipeline stage {stage}: {status}")),
        }
    }

    fn on_message(&self, _ctx: &RunContext, level: LogLevel, message: &str) {
        self.log(level, message);
    }

    fn on_finished(&self, ctx: &RunContext, run: &Run) {
        self.info(&format!(
            "Run {} for {} finished with status {:?} in {}ms",
            ctx.run_id,
            ctx.filename,
            run.status,
            run.duration_ms.unwrap_or(0)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("tabular_ingest_{tag}_{nanos}"))
    }

    #[test]
    fn run_log_appends_lines_to_named_file() {
        let dir = unique_dir("runlog");
        let id = RunId::new();
        {
            let log = RunLog::open(&dir, id, "people.csv");
            log.info("hello");
            log.warn("careful");
        }
        let path = RunLog::path_for(&dir, id, "people.csv");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_people.csv.log"));
        assert!(text.contains("INFO - hello"));
        assert!(text.contains("WARNING - careful"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[derive(Default)]
    struct Recording {
        stages: Mutex<Vec<(Stage, StageStatus)>>,
    }

    impl RunObserver for Recording {
        fn on_stage(&self, _ctx: &RunContext, stage: Stage, status: StageStatus, _d: Option<&str>) {
            self.stages.lock().unwrap().push((stage, status));
        }
    }

    #[test]
    fn composite_fans_out() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let observers: Vec<Arc<dyn RunObserver>> = vec![a.clone(), b.clone()];
        let composite = CompositeObserver::new(observers);
        let ctx = RunContext {
            run_id: RunId::new(),
            filename: "x.csv".to_string(),
        };
        composite.on_stage(&ctx, Stage::Sampling, StageStatus::Skipped, None);
        assert_eq!(a.stages.lock().unwrap().len(), 1);
        assert_eq!(b.stages.lock().unwrap()[0], (Stage::Sampling, StageStatus::Skipped));
    }
}

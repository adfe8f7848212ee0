//! Single sequential worker and the inbound-directory scan.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::orchestrator::Orchestrator;
use super::run::{Run, RunId};
use super::store::StoreError;
use crate::error::{PipelineError, PipelineResult};
use crate::ingestion::format::is_ingestible;

/// Enqueue every supported file directly inside `dir` that has no run yet.
///
/// Files that already have a run (whatever its status) are left alone; re-running them is an
/// explicit `process_file` call. Returns the ids of newly enqueued runs, in file-name order.
pub fn scan_inbound(orchestrator: &Orchestrator, dir: &Path) -> PipelineResult<Vec<RunId>> {
    let mut enqueued = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && is_ingestible(e.path()))
    {
        let filename = entry.file_name().to_string_lossy().into_owned();
        if orchestrator.store().find_by_filename(&filename)?.is_some() {
            continue;
        }
        let id = orchestrator.enqueue(&filename)?;
        debug!(file = %filename, run_id = %id, "enqueued");
        enqueued.push(id);
    }
    if !enqueued.is_empty() {
        info!(count = enqueued.len(), dir = %dir.display(), "enqueued inbound files");
    }
    Ok(enqueued)
}

/// Polls the run store for the oldest `enqueued` run and processes one file at a time.
#[derive(Debug)]
pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    shutdown: Arc<AtomicBool>,
    scan_inbound: bool,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            shutdown: Arc::new(AtomicBool::new(false)),
            scan_inbound: false,
        }
    }

    /// Also scan the inbound directory before every poll.
    pub fn with_inbound_scan(mut self, enabled: bool) -> Self {
        self.scan_inbound = enabled;
        self
    }

    /// Flag that stops [`Worker::run`] once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Process the next enqueued run, if any.
    ///
    /// A run whose file is already being processed elsewhere is left in the queue and the next
    /// one is tried.
    pub fn run_once(&self) -> PipelineResult<Option<Run>> {
        if self.scan_inbound {
            scan_inbound(&self.orchestrator, &self.orchestrator.config().paths.inbound_dir)?;
        }
        let inbound = &self.orchestrator.config().paths.inbound_dir;
        for next in self.orchestrator.store().enqueued()? {
            info!(run_id = %next.id, file = %next.filename, priority = next.priority, "dequeued run");
            match self.orchestrator.process_file(&inbound.join(&next.filename)) {
                Ok(run) => return Ok(Some(run)),
                Err(PipelineError::Store(StoreError::Conflict(reason))) => {
                    warn!(run_id = %next.id, file = %next.filename, %reason, "run busy, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Loop until the shutdown flag is set.
    pub fn run(&self) {
        let pacing = &self.orchestrator.config().worker;
        info!("worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            let pause = match self.run_once() {
                Ok(Some(_)) => pacing.between_runs_secs,
                Ok(None) => pacing.idle_poll_secs,
                Err(e) => {
                    error!(error = %e, "worker iteration failed");
                    pacing.error_backoff_secs
                }
            };
            self.sleep(Duration::from_secs(pause));
        }
        info!("worker stopped");
    }

    /// Sleep in short slices so a shutdown request is honored promptly.
    fn sleep(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let mut left = total;
        while !left.is_zero() && !self.shutdown.load(Ordering::Relaxed) {
            let step = left.min(slice);
            thread::sleep(step);
            left -= step;
        }
    }
}

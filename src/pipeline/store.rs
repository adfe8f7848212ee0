//! Run-store contract and an in-memory implementation.
//!
//! The store is the only place runs are mutated. Every mutation goes through a closure applied
//! under the store's lock, so a read-modify-write of a run (and of its stage history) is atomic
//! relative to any other mutation.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use super::run::{Run, RunId, RunStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("{0}")]
    Conflict(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Persistence contract consumed by the orchestrator and worker.
pub trait RunStore: Send + Sync {
    /// Create a new `enqueued` run.
    fn create(&self, filename: &str, priority: u8) -> Result<RunId, StoreError>;

    /// Enqueue `filename` unless a non-terminal run for it already exists, in which case that
    /// run's id is returned.
    fn enqueue(&self, filename: &str, priority: u8) -> Result<RunId, StoreError>;

    /// Claim a run for processing `filename` and mark it `running`.
    ///
    /// Reuses the oldest `enqueued` run for the filename, else the most recent `error` run (with
    /// its history cleared), else creates one. Fails with [`StoreError::Conflict`] if a run for
    /// the filename is already `running`.
    fn begin(&self, filename: &str, priority: u8) -> Result<Run, StoreError>;

    fn get(&self, id: RunId) -> Result<Run, StoreError>;

    /// Most recently inserted run for `filename`.
    fn find_by_filename(&self, filename: &str) -> Result<Option<Run>, StoreError>;

    /// Apply `f` to the stored run atomically and return the updated copy.
    fn update(&self, id: RunId, f: &mut dyn FnMut(&mut Run)) -> Result<Run, StoreError>;

    /// Oldest `enqueued` run ordered by (priority, insertion order).
    fn next_enqueued(&self) -> Result<Option<Run>, StoreError>;

    fn list(&self) -> Result<Vec<Run>, StoreError>;

    /// Every `enqueued` run, ordered like [`RunStore::next_enqueued`].
    fn enqueued(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self
            .list()?
            .into_iter()
            .filter(|r| r.status == RunStatus::Enqueued)
            .collect();
        runs.sort_by_key(|r| (r.priority, r.sequence));
        Ok(runs)
    }
}

#[derive(Debug, Default)]
struct Inner {
    runs: Vec<Run>,
    next_sequence: u64,
}

impl Inner {
    fn insert(&mut self, filename: &str, priority: u8) -> &mut Run {
        let run = Run::new(filename, priority, self.next_sequence);
        self.next_sequence += 1;
        self.runs.push(run);
        let last = self.runs.len() - 1;
        &mut self.runs[last]
    }

    fn position(&self, id: RunId) -> Option<usize> {
        self.runs.iter().position(|r| r.id == id)
    }

    fn oldest_with(&self, filename: &str, status: RunStatus) -> Option<usize> {
        self.runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.filename == filename && r.status == status)
            .min_by_key(|(_, r)| r.sequence)
            .map(|(i, _)| i)
    }
}

/// Mutex-guarded, process-local run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    inner: Mutex<Inner>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("run store mutex poisoned".to_string()))
    }
}

impl RunStore for InMemoryRunStore {
    fn create(&self, filename: &str, priority: u8) -> Result<RunId, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.insert(filename, priority).id)
    }

    fn enqueue(&self, filename: &str, priority: u8) -> Result<RunId, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .runs
            .iter()
            .find(|r| r.filename == filename && !r.status.is_terminal())
        {
            return Ok(existing.id);
        }
        Ok(inner.insert(filename, priority).id)
    }

    fn begin(&self, filename: &str, priority: u8) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        if inner
            .runs
            .iter()
            .any(|r| r.filename == filename && r.status == RunStatus::Running)
        {
            return Err(StoreError::Conflict(format!(
                "a run for '{filename}' is already running"
            )));
        }

        let idx = if let Some(i) = inner.oldest_with(filename, RunStatus::Enqueued) {
            i
        } else if let Some(i) = inner
            .runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.filename == filename && r.status == RunStatus::Error)
            .max_by_key(|(_, r)| r.sequence)
            .map(|(i, _)| i)
        {
            inner.runs[i].reset_for_rerun();
            i
        } else {
            inner.insert(filename, priority);
            inner.runs.len() - 1
        };

        let run = &mut inner.runs[idx];
        run.status = RunStatus::Running;
        Ok(run.clone())
    }

    fn get(&self, id: RunId) -> Result<Run, StoreError> {
        let inner = self.lock()?;
        inner
            .position(id)
            .map(|i| inner.runs[i].clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn find_by_filename(&self, filename: &str) -> Result<Option<Run>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.filename == filename)
            .max_by_key(|r| r.sequence)
            .cloned())
    }

    fn update(&self, id: RunId, f: &mut dyn FnMut(&mut Run)) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        let idx = inner.position(id).ok_or(StoreError::NotFound(id))?;
        let run = &mut inner.runs[idx];
        f(run);
        Ok(run.clone())
    }

    fn next_enqueued(&self) -> Result<Option<Run>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Enqueued)
            .min_by_key(|r| (r.priority, r.sequence))
            .cloned())
    }

    fn list(&self) -> Result<Vec<Run>, StoreError> {
        let inner = self.lock()?;
        let mut runs = inner.runs.clone();
        runs.sort_by_key(|r| r.sequence);
        Ok(runs)
    }
}

//! Run lifecycle: run records, the run store, the orchestrator and the worker.

pub mod orchestrator;
pub mod run;
pub mod store;
pub mod worker;

pub use orchestrator::{Orchestrator, SchemaPath, fast_path_mapping};
pub use run::{Run, RunId, RunStatus, Stage, StageRecord, StageStats, StageStatus};
pub use store::{InMemoryRunStore, RunStore, StoreError};
pub use worker::{Worker, scan_inbound};

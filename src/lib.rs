//! `tabular-ingest` is a staged ingestion pipeline for arbitrary delimited and spreadsheet files.
//!
//! Each file is driven through four stages:
//!
//! 1. **Classification** ([`classifier::classify_file`]): encoding resolution, a delimiter-pattern
//!    heuristic deciding whether the file is tabular, and known-header matching of the first row.
//! 2. **Sampling** ([`sampler::extract_sample`]): the first row plus up to 1,000 rows.
//! 3. **Schema mapping** ([`mapping::infer_schema`]): an external [`mapping::SchemaMapper`] turns
//!    the sample into a [`types::SchemaMapping`], under a bounded retry policy.
//! 4. **Normalization** ([`normalizer::Normalizer`]): rewrites the file into a fixed-schema CSV,
//!    with per-row validation and an invalid-rows side file.
//!
//! When the first row matches the known-header dictionary strongly enough (90% by default),
//! sampling and schema mapping are skipped and the mapping is built directly from the match.
//!
//! ## What you can ingest
//!
//! - **Delimited text**: `.csv`, `.tsv`, `.psv`, `.dat`, `.data`, `.txt`, in any encoding the
//!   classifier can resolve (UTF-8 first, then statistical detection, UTF-16/32, latin-1)
//! - **Spreadsheets** (Cargo feature `excel`, on by default): `.xlsx`, `.xls`, `.xlsm`, `.ods`
//!
//! ## Quick example: classify a file
//!
//! ```no_run
//! use tabular_ingest::classifier::{KnownHeaders, classify_file};
//! use tabular_ingest::config::ClassifierConfig;
//!
//! # fn main() -> Result<(), tabular_ingest::PipelineError> {
//! let known = KnownHeaders::bundled()?;
//! let res = classify_file("contacts.csv".as_ref(), &ClassifierConfig::default(), &known);
//! println!(
//!     "tabular={} encoding={:?} known={}%",
//!     res.is_tabular, res.encoding, res.known_header_percentage
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Running the pipeline
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tabular_ingest::classifier::KnownHeaders;
//! use tabular_ingest::config::PipelineConfig;
//! use tabular_ingest::pipeline::{InMemoryRunStore, Orchestrator, RunStatus};
//!
//! # fn main() -> Result<(), tabular_ingest::PipelineError> {
//! let config = PipelineConfig::default();
//! let orchestrator = Orchestrator::new(
//!     config,
//!     Arc::new(KnownHeaders::bundled()?),
//!     Arc::new(InMemoryRunStore::new()),
//! );
//! let run = orchestrator.process_file("data/inbound/contacts.csv".as_ref())?;
//! if run.status == RunStatus::Error {
//!     eprintln!("{}", run.error_message.unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`classifier`]: encoding/tabular classification and the known-header dictionary
//! - [`sampler`]: bounded row extraction
//! - [`mapping`]: schema-mapping service contract, reply parsing and retry loop
//! - [`normalizer`]: row splitting, field transforms and the repetitive-pattern pass
//! - [`pipeline`]: run records, run store, orchestrator and worker
//! - [`ingestion`]: file kinds, encodings, spreadsheet reading and run observers
//! - [`config`]: configuration loading
//! - [`error`]: error types shared by every stage

pub mod classifier;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod mapping;
pub mod normalizer;
pub mod pipeline;
pub mod sampler;
pub mod types;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, Severity};

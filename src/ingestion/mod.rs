//! File-level plumbing shared by the pipeline stages.
//!
//! - [`format`]: supported input kinds by extension
//! - [`encoding`]: text encoding resolution and line reading
//! - `excel`: spreadsheet reading (feature `excel`)
//! - [`observability`]: run observers and the per-run log sink

pub mod encoding;
#[cfg(feature = "excel")]
pub mod excel;
pub mod format;
pub mod observability;

pub use encoding::{DecodedText, TextEncoding, read_lines, resolve_encoding};
pub use format::{FileKind, is_ingestible};
pub use observability::{
    CompositeObserver, LogLevel, RunContext, RunLog, RunObserver, TracingObserver,
};

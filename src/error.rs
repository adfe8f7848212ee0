use thiserror::Error;

use crate::pipeline::run::Stage;

/// Convenience result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error type returned by pipeline functions.
///
/// This is a single error enum shared by every stage. Per-row problems
/// ([`PipelineError::ColumnCountMismatch`]) are recovered locally by the normalizer and only show
/// up in the invalid-rows side file; everything else is fatal to the run that raised it.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Underlying I/O error (e.g. permission denied, disk full).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reading/writing error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "excel")]
    /// Spreadsheet reading error (feature-gated behind `excel`).
    #[error("excel error: {0}")]
    Excel(#[from] calamine::Error),

    /// The file extension is not on the supported allow-list.
    #[error("Unsupported file type: {extension}")]
    UnsupportedType { extension: String },

    /// The input file does not exist.
    #[error("File not found")]
    FileNotFound,

    /// The input file is zero bytes, or has no non-whitespace content.
    #[error("{message}")]
    EmptyFile { message: String },

    /// No candidate encoding produced a non-empty line.
    #[error("{message}")]
    EncodingExhausted { message: String },

    /// The delimiter heuristic rejected the file.
    #[error("{message}")]
    NotTabular { message: String },

    /// The file exists but could not be read as the declared kind.
    #[error("{message}")]
    Unreadable { message: String },

    /// Sampling produced no rows to send to schema inference.
    #[error("sample is empty: {message}")]
    SampleEmpty { message: String },

    /// Every mapping attempt timed out.
    #[error("schema mapping timed out after {attempts} attempt(s): {message}")]
    MappingServiceTimeout { attempts: u32, message: String },

    /// The mapping service kept rejecting requests for quota/rate limits.
    #[error("schema mapping quota exceeded after {attempts} attempt(s): {message}")]
    MappingServiceQuotaExceeded { attempts: u32, message: String },

    /// The mapping service answered with something that is not a usable mapping.
    #[error("schema mapping response malformed after {attempts} attempt(s): {message}")]
    MappingServiceMalformed { attempts: u32, message: String },

    /// Any other mapping-service failure (client error, transport error, no service configured).
    #[error("schema mapping failed after {attempts} attempt(s): {message}")]
    MappingServiceFailed { attempts: u32, message: String },

    /// The resolved mapping does not reference a single known header.
    #[error(
        "No known headers matched in the file. At least one known header must be present to process the file."
    )]
    NoKnownHeaderMatched,

    /// A row split into the wrong number of columns.
    #[error("Column count mismatch (got {got}, expected {expected})")]
    ColumnCountMismatch { got: usize, expected: usize },

    /// A value could not be serialized (JSON mirror, stored blobs).
    #[error("serialization failure: {message}")]
    SerializationFailure { message: String },

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {message}")]
    Config { message: String },

    /// The run store rejected an operation.
    #[error("run store error: {0}")]
    Store(#[from] crate::pipeline::store::StoreError),
}

/// Severity classification used when logging failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Recovered locally; the run continues.
    Warning,
    /// The run fails, but the infrastructure is healthy.
    Error,
    /// Typically I/O or store failures.
    Critical,
}

impl PipelineError {
    /// Severity used for logging and alerting.
    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::Io(_) | PipelineError::Store(_) => Severity::Critical,
            PipelineError::Csv(err) => match err.kind() {
                csv::ErrorKind::Io(_) => Severity::Critical,
                _ => Severity::Error,
            },
            PipelineError::ColumnCountMismatch { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// The pipeline stage an error is naturally attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::UnsupportedType { .. }
            | PipelineError::FileNotFound
            | PipelineError::EmptyFile { .. }
            | PipelineError::EncodingExhausted { .. }
            | PipelineError::NotTabular { .. }
            | PipelineError::Unreadable { .. } => Some(Stage::Classification),
            PipelineError::SampleEmpty { .. } => Some(Stage::Sampling),
            PipelineError::MappingServiceTimeout { .. }
            | PipelineError::MappingServiceQuotaExceeded { .. }
            | PipelineError::MappingServiceMalformed { .. }
            | PipelineError::MappingServiceFailed { .. } => Some(Stage::SchemaMapping),
            PipelineError::NoKnownHeaderMatched | PipelineError::ColumnCountMismatch { .. } => {
                Some(Stage::Normalization)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationFailure {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineError, Severity};
    use crate::pipeline::run::Stage;

    #[test]
    fn column_mismatch_message_matches_invalid_rows_reason() {
        let err = PipelineError::ColumnCountMismatch { got: 5, expected: 4 };
        assert_eq!(err.to_string(), "Column count mismatch (got 5, expected 4)");
        assert_eq!(err.severity(), Severity::Warning);
    }

    #[test]
    fn io_errors_are_critical() {
        let err = PipelineError::Io(std::io::Error::other("disk gone"));
        assert_eq!(err.severity(), Severity::Critical);
        assert_eq!(err.stage(), None);
    }

    #[test]
    fn classification_failures_are_attributed_to_classification() {
        let err = PipelineError::EmptyFile {
            message: "File is empty".to_string(),
        };
        assert_eq!(err.stage(), Some(Stage::Classification));
        assert_eq!(err.to_string(), "File is empty");
    }
}

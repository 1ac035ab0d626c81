//! Pipeline error taxonomy.
//!
//! Every pipeline failure maps to one [`ErrorKind`]. Per-document failures are
//! folded into that document's [`ProcessingResult`](corpus_harness_core::models::ProcessingResult)
//! via [`PipelineError::info`]; only [`PipelineError::Input`] and
//! [`PipelineError::Storage`] escape a whole multi-document operation.

use corpus_harness_core::models::{ErrorInfo, ErrorKind, InvalidTransition, ProcessingResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid filename / document id. Raised before any mutation.
    #[error("invalid input: {0}")]
    Input(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A store or the source filesystem could not be reached.
    #[error("storage unavailable: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Input(_) => ErrorKind::Input,
            PipelineError::Conversion(_) => ErrorKind::Conversion,
            PipelineError::Embedding(_) => ErrorKind::Embedding,
            PipelineError::Consistency(_) => ErrorKind::Consistency,
            PipelineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Structured form recorded on a manifest entry or processing result.
    pub fn info(&self) -> ErrorInfo {
        let message = match self {
            PipelineError::Input(m)
            | PipelineError::Conversion(m)
            | PipelineError::Embedding(m)
            | PipelineError::Consistency(m) => m.clone(),
            PipelineError::Storage(e) => format!("{:#}", e),
        };
        ErrorInfo::new(self.kind(), message)
    }

    /// Whether this error must abort a multi-document operation rather than
    /// being recorded against one document.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Storage(_))
    }
}

/// Fold one document's outcome into a bulk operation: fatal errors
/// propagate, anything else becomes a failed [`ProcessingResult`].
pub fn settle(
    document_id: &str,
    filename: &str,
    outcome: PipelineResult<ProcessingResult>,
) -> PipelineResult<ProcessingResult> {
    match outcome {
        Ok(result) => Ok(result),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => Ok(ProcessingResult::failed(document_id, filename, err.info())),
    }
}

impl From<InvalidTransition> for PipelineError {
    fn from(err: InvalidTransition) -> Self {
        PipelineError::Consistency(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(err.into())
    }
}

//! Pipeline error taxonomy.
//!
//! Every stage failure is a [`StageError`]. The orchestrator only cares
//! about one property: whether the error is terminal (retrying the same
//! input cannot succeed) or retryable (the fault is transient). Terminal
//! errors move the task straight to `Failed`; retryable ones are
//! re-enqueued with backoff up to the configured attempt budget.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// Declared format is not one of pdf/docx/html.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Bytes cannot be decoded as the declared format.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    /// Document parsed to zero extractable text.
    #[error("document contains no extractable text")]
    EmptyContent,

    /// Language-specific tokenization could not be applied.
    #[error("unsupported language: {0}")]
    LanguageUnsupported(String),

    /// The requested feature_version configuration is not available.
    #[error("no extractor configuration for feature version '{0}'")]
    VocabularyMismatch(String),

    /// Model snapshot not loaded/loadable for the requested version.
    /// Retryable: the snapshot may become available.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Malformed feature input reached the model. Indicates an upstream
    /// extractor/version mismatch, so retrying cannot help.
    #[error("inference error: {0}")]
    InferenceError(String),

    /// Search index could not be reached. Retryable.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// Index rejected the payload as malformed. Pipeline bug upstream.
    #[error("index rejected payload: {0}")]
    IndexRejected(String),

    /// Stage exceeded its configured timeout. Treated as retryable.
    #[error("stage '{stage}' timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    /// Transient storage/cache I/O failure. Retryable.
    #[error("storage error: {0}")]
    Storage(String),

    /// Task was cancelled externally between stages.
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// Terminal errors are never retried automatically; the task moves to
    /// `Failed` regardless of remaining attempt budget.
    pub fn is_terminal(&self) -> bool {
        match self {
            StageError::UnsupportedFormat(_)
            | StageError::CorruptInput(_)
            | StageError::EmptyContent
            | StageError::LanguageUnsupported(_)
            | StageError::VocabularyMismatch(_)
            | StageError::InferenceError(_)
            | StageError::IndexRejected(_)
            | StageError::Cancelled => true,
            StageError::ModelUnavailable(_)
            | StageError::IndexUnavailable(_)
            | StageError::Timeout { .. }
            | StageError::Storage(_) => false,
        }
    }
}

impl From<sqlx::Error> for StageError {
    fn from(e: sqlx::Error) -> Self {
        StageError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        StageError::Storage(e.to_string())
    }
}

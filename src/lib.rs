use thiserror::Error;

pub type Result<T> = std::result::Result<T, StudyError>;

#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Embedding service error: {0}")]
    EmbeddingService(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Generation service error: {0}")]
    GenerationService(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StudyError {
    /// Errors that indicate a programming or configuration fault and must
    /// never be recovered from by a fallback path.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. } | Self::Config(_))
    }

    /// Wrap a storage failure, keeping its context chain
    #[inline]
    pub(crate) fn database(error: anyhow::Error) -> Self {
        Self::Database(format!("{error:#}"))
    }

    /// Text that can be shown to an end user in place of the raw error.
    #[inline]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "The document could not be read.",
            Self::Validation(_) => "The request was not valid.",
            Self::Cancelled => "The request was cancelled.",
            Self::GenerationService(_) | Self::EmbeddingService(_) => {
                "The tutor could not finish this response. Please try again."
            }
            _ => "Something went wrong while preparing this response.",
        }
    }
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod feedback;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod retrieval;


#[cfg(test)]
pub(crate) mod test_support;

use thiserror::Error;

/// Failures raised by adapters and the per-image stage runner.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("adapter unavailable: {0}")]
    Unavailable(String),

    #[error("{stage} produced no usable result")]
    EmptyResult { stage: &'static str },

    #[error("Translation count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("translation failed: {0}")]
    TranslationFailed(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Whether a fallback strategy is worth trying after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::CountMismatch { .. }
                | StageError::Rejected(_)
                | StageError::Transport(_)
                | StageError::MalformedResponse(_)
                | StageError::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        StageError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::MalformedResponse(err.to_string())
    }
}

impl From<image::ImageError> for StageError {
    fn from(err: image::ImageError) -> Self {
        StageError::InvalidInput(err.to_string())
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_failures() {
        assert!(
            StageError::CountMismatch {
                expected: 3,
                actual: 2
            }
            .is_retryable()
        );
        assert!(StageError::Rejected("blocked".into()).is_retryable());
        assert!(StageError::Transport("503".into()).is_retryable());
        assert!(!StageError::InvalidInput("bad image".into()).is_retryable());
        assert!(!StageError::Unavailable("no key".into()).is_retryable());
    }

    #[test]
    fn count_mismatch_message() {
        let err = StageError::CountMismatch {
            expected: 4,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Translation count mismatch: expected 4, got 3"
        );
    }
}

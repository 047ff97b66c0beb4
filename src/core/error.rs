use thiserror::Error;

/// Errors returned synchronously by the public orchestration API.
///
/// Failures that happen while a job executes are never surfaced here; they
/// are written to the job record and announced as `job:failed`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("job {0} is already finished and cannot be cancelled")]
    NotCancellable(String),
    #[error("backend failure: {0}")]
    BackendFailure(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidInput(_) => "invalid_input",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::NotCancellable(_) => "not_cancellable",
            OrchestratorError::BackendFailure(_) => "backend_failure",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

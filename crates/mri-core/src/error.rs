use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy shared across the orchestration substrate. Each variant
/// names one of the kinds in the error handling design; `http_status`
/// provides the boundary mapping used by the server crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("input invalid: {0}")]
    InputInvalid(String),

    #[error("model checkpoint missing: {0}")]
    MissingModel(String),

    #[error("session not found: {0}")]
    UnknownSession(Uuid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("accelerator exhausted after retry")]
    Oom,

    #[error("predictor failure: {0}")]
    PredictFailure(String),

    #[error("external tool exited non-zero: {0}")]
    Subprocess(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("expected output missing: {0}")]
    MissingOutput(String),

    #[error("shared state unreachable: {0}")]
    SharedState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InputInvalid(_) => "input_invalid",
            CoreError::MissingModel(_) => "missing_model",
            CoreError::UnknownSession(_) => "io",
            CoreError::Io(_) => "io",
            CoreError::Oom => "oom",
            CoreError::PredictFailure(_) => "predict_failure",
            CoreError::Subprocess(_) => "subprocess",
            CoreError::Timeout => "timeout",
            CoreError::MissingOutput(_) => "missing_output",
            CoreError::SharedState(_) => "shared_state",
            CoreError::Other(_) => "io",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::InputInvalid(_) => 400,
            CoreError::UnknownSession(_) => 404,
            CoreError::MissingModel(_) | CoreError::MissingOutput(_) => 404,
            CoreError::Oom
            | CoreError::PredictFailure(_)
            | CoreError::Subprocess(_)
            | CoreError::Timeout => 422,
            CoreError::SharedState(_) => 503,
            CoreError::Io(_) | CoreError::Other(_) => 500,
        }
    }

    /// Fatal to the single step but the job may still complete other steps.
    pub fn is_step_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::MissingModel(_)
                | CoreError::Io(_)
                | CoreError::Oom
                | CoreError::PredictFailure(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

use thiserror::Error;
use tribunal_common::types::OutcomeKind;

/// Failures of the sandbox machinery itself, never of the submission
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to launch sandbox: {0}")]
    Spawn(String),

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("unreadable sandbox report: {0}")]
    Protocol(String),

    #[error("sandbox io: {0}")]
    Io(#[from] std::io::Error),
}

/// Judging error taxonomy. Everything except `Internal` describes the submission.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Syntax error: {0}")]
    Parse(String),

    #[error("Your code must define a '{0}' function")]
    MissingEntryPoint(String),

    #[error("Runtime error: {0}")]
    RuntimeFailure(String),

    #[error("Execution timed out after {0}ms")]
    Timeout(u64),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Execution is not supported for language '{0}'")]
    UnsupportedLanguage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal judge error: {0}")]
    Internal(String),
}

impl JudgeError {
    pub fn outcome(&self) -> OutcomeKind {
        match self {
            JudgeError::Parse(_) => OutcomeKind::ParseError,
            JudgeError::MissingEntryPoint(_) => OutcomeKind::MissingEntryPoint,
            JudgeError::RuntimeFailure(_) => OutcomeKind::RuntimeFailure,
            JudgeError::Timeout(_) => OutcomeKind::Timeout,
            JudgeError::ResourceLimitExceeded(_) => OutcomeKind::ResourceLimitExceeded,
            JudgeError::UnsupportedLanguage(_) => OutcomeKind::UnsupportedLanguage,
            JudgeError::InvalidRequest(_) => OutcomeKind::InvalidRequest,
            JudgeError::Internal(_) => OutcomeKind::JudgeError,
        }
    }
}

impl From<SandboxError> for JudgeError {
    fn from(err: SandboxError) -> Self {
        JudgeError::Internal(err.to_string())
    }
}

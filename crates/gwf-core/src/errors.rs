use crate::status::StatusCode;

/// Failure raised while evaluating or acting on a pull request.
///
/// The dispatcher routes each variant differently: `UserFacing` becomes an
/// idempotent PR comment and the job still completes, `Transient` is retried
/// with backoff, `Fatal` fails the job with a recorded cause, and `NotMyJob`
/// exits silently.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("status {code}: {context}")]
    UserFacing {
        code: StatusCode,
        /// Parameters for the rendered message, consumed by the messenger.
        context: serde_json::Value,
    },

    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),

    /// The pull request's destination is not a branch this robot manages.
    #[error("not my job: {0}")]
    NotMyJob(String),
}

impl EvalError {
    pub fn status(code: StatusCode) -> Self {
        EvalError::UserFacing { code, context: serde_json::json!({}) }
    }

    pub fn status_with(code: StatusCode, context: serde_json::Value) -> Self {
        EvalError::UserFacing { code, context }
    }

    pub fn code(&self) -> Option<StatusCode> {
        match self {
            EvalError::UserFacing { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for EvalError {
    fn from(e: anyhow::Error) -> Self {
        EvalError::Fatal(e)
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

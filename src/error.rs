use thiserror::Error;

/// Everything that can end a turn early.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("no action call found in model output: {0:?}")]
    UnparsableAction(String),

    #[error("unknown action intent '{0}'")]
    UnknownIntent(String),

    #[error("no element carries uid '{0}' on the current page")]
    ElementNotFound(String),

    #[error("retrieval service error: {0}")]
    RetrievalService(String),

    #[error("generation service error: {0}")]
    GenerationService(String),

    #[error("candidate group {group} mixes queries: {first:?} vs {other:?}")]
    InconsistentQuery {
        group: String,
        first: String,
        other: String,
    },

    #[error("session has been closed")]
    SessionClosed,

    #[error("browser error: {0:#}")]
    Browser(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Fatal errors point at a bug in the harness itself and must stop the
    /// session. Everything else is reported and the session keeps going.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarnessError::InconsistentQuery { .. })
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

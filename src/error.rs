use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures surfaced by the inference core.
///
/// Every variant maps to a stable wire code (see [`CoreError::code`]) so the
/// bridge can hand the host something it can switch on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("all {capacity} generation slots are busy")]
    Overload { capacity: usize },

    #[error("failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("not enough memory to load model: {0}")]
    ResourceExhausted(String),

    #[error("model handle {handle} has {active} active session(s)")]
    Busy { handle: u64, active: usize },

    #[error("runtime fault: {0}")]
    Runtime(String),

    #[error("invalid model handle {handle}: {reason}")]
    InvalidHandle { handle: u64, reason: &'static str },

    #[error("malformed payload: {0}")]
    Protocol(String),

    #[error("download failed: {0}")]
    Download(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Overload { .. } => "OVERLOAD_ERROR",
            CoreError::ModelLoad { .. } => "MODEL_LOAD_ERROR",
            CoreError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            CoreError::Busy { .. } => "BUSY",
            CoreError::Runtime(_) => "RUNTIME_ERROR",
            CoreError::InvalidHandle { .. } => "INVALID_HANDLE",
            CoreError::Protocol(_) => "PROTOCOL_ERROR",
            CoreError::Download(_) => "DOWNLOAD_ERROR",
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Overload { .. } | CoreError::Busy { .. })
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CoreError::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

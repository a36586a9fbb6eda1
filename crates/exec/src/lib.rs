//! External assistant backend invocation and child-process helpers.

mod command;
mod events;
pub mod process;

use async_trait::async_trait;

use askd_core::ErrorCode;

pub use command::CommandBackend;
pub use events::parse_events;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutput {
    pub answer: String,
    /// Concatenated reasoning trace; empty when the backend emitted none.
    pub reasoning: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend tool not found: {program}")]
    NotFound { program: String },
    #[error("backend timed out after {secs}s")]
    TimedOut { secs: u64 },
    #[error("backend exited with non-zero status {code}: {stderr}")]
    NonZeroExit { code: String, stderr: String },
    #[error("backend reported an error: {0}")]
    Reported(String),
    #[error("backend produced no answer")]
    EmptyResponse,
    #[error("backend io: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::BackendNotFound,
            Self::TimedOut { .. } => ErrorCode::BackendTimeout,
            _ => ErrorCode::BackendFailed,
        }
    }
}

/// Something that turns a prompt into an answer.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<BackendOutput, BackendError>;
}

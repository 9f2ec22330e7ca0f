//! Agent error types.

use thiserror::Error;

/// Result type for sandboxed file operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced to the remote side as `fs:error` events.
///
/// Every failure path renders to a human-readable message; nothing here
/// crosses the websocket boundary as a panic or a dropped request.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The path escapes the sandbox root or contains forbidden components.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target of a listing is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Any other filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

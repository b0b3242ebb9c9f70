//! Error taxonomy for the connection and execution core.
//!
//! Failures local to one server or one invocation are reported as values and
//! recorded on the affected entity (connection state, execution record)
//! rather than propagated as process-wide failures.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the core's public operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or missing server configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Spawn failure, handshake failure, or transport crash.
    #[error("server '{server}' connection failed: {reason}")]
    Connection { server: String, reason: String },

    /// No configured server with the given id.
    #[error("unknown server: {0}")]
    ServerNotFound(String),

    /// No connected server exposes the requested tool.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A bare tool name matched more than one connected server.
    #[error("ambiguous tool name '{name}': provided by {candidates:?}")]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    /// The tool is listed but its input schema is absent or malformed.
    #[error("tool '{name}' is not callable: {reason}")]
    ToolNotCallable { name: String, reason: String },

    /// The owning connection dropped between resolution and dispatch.
    #[error("server '{0}' is not available")]
    ServerUnavailable(String),

    /// A dispatched call exceeded its timeout.
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// Malformed protocol traffic or a server-side error object.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Whether this error represents a timeout treated as cancellation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::ExecutionTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Connection {
            server: "weather".to_string(),
            reason: "spawn failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server 'weather' connection failed: spawn failed"
        );
    }

    #[test]
    fn test_is_timeout() {
        assert!(CoreError::ExecutionTimeout(Duration::from_secs(1)).is_timeout());
        assert!(!CoreError::ToolNotFound("x".to_string()).is_timeout());
    }
}

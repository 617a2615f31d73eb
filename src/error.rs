//! Error taxonomy (§7).
//!
//! Grounded on `examples/Jitpomi-dogrs/dog-blob/src/error.rs` — the closest
//! precedent in the retrieval pack for a typed storage-engine error enum.
//! The teacher (`dickwu-r2`) returns `Result<T, String>` everywhere; this
//! crate's public surface needs the recoverable/non-recoverable
//! distinction from §7, which a bare `String` cannot carry.

use thiserror::Error;

/// Result type used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no such session: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend/object-store server error ({status}): {message}")]
    HttpServer { status: u16, message: String },

    #[error("backend/object-store client error ({status}): {message}")]
    HttpClient { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the engine is permitted to retry the operation that produced
    /// this error without user intervention (§7 "Recoverable error").
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::HttpServer { .. }
        )
    }
}

impl From<turso::Error> for EngineError {
    fn from(e: turso::Error) -> Self {
        EngineError::Internal(format!("store error: {e}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(format!("filesystem error: {e}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            EngineError::Transport(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
                EngineError::HttpServer {
                    status: status.as_u16(),
                    message: e.to_string(),
                }
            } else {
                EngineError::HttpClient {
                    status: status.as_u16(),
                    message: e.to_string(),
                }
            }
        } else {
            EngineError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_server_errors_are_recoverable() {
        assert!(EngineError::Transport("x".into()).recoverable());
        assert!(EngineError::HttpServer {
            status: 503,
            message: "x".into()
        }
        .recoverable());
    }

    #[test]
    fn client_and_protocol_errors_are_not_recoverable() {
        assert!(!EngineError::HttpClient {
            status: 403,
            message: "x".into()
        }
        .recoverable());
        assert!(!EngineError::Protocol("x".into()).recoverable());
        assert!(!EngineError::Internal("x".into()).recoverable());
        assert!(!EngineError::Cancelled.recoverable());
    }
}

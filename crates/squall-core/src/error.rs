//! Error types for squall-core

use thiserror::Error;

/// Result type alias for squall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the squall HTTP server core
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid HTTP method
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// Unparsable request line or headers
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Request head exceeds the buffering limit
    #[error("Request head too large: {size} bytes exceeds limit of {limit} bytes")]
    HeadTooLarge { size: usize, limit: usize },

    /// Route registration failure, reported at registration time and never
    /// deferred to request time
    #[error("Route registration: {0}")]
    Registration(#[from] squall_router::InsertError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Dynamic responder or middleware failure
    #[error("Responder error: {0}")]
    Responder(String),

    /// Fatal reactor failure, surfaced to the process supervisor
    #[error("Reactor error: {0}")]
    Reactor(String),
}

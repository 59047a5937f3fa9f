//! Error types for the causeway engine

use causeway_core::{SessionErrorCode, SessionResponseEx};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Generic message returned to unauthenticated clients; the authority's
/// detail must not leak before the client has proven its identity.
pub const ACCESS_ERROR_MESSAGE: &str = "Access Error.";

/// Errors that can occur in the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong session key, or access denied at session creation
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Authority-level failure on an authorized session; carries the
    /// authority response verbatim
    #[error("{response}")]
    Session {
        response: Box<SessionResponseEx>,
        request_id: Option<String>,
    },

    /// UDP proxy worker quota reached
    #[error("UDP client quota reached with {worker_count} workers")]
    UdpClientQuota { worker_count: usize },

    /// The access authority could not be reached
    #[error("access authority unreachable: {0}")]
    Access(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation on a disposed component
    #[error("component is disposed")]
    Disposed,

    /// Protocol error
    #[error("protocol error: {0}")]
    Core(causeway_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// An unauthorized error with a caller-visible message
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized {
            message: message.into(),
        }
    }

    /// The unauthorized error shown when access is denied at creation;
    /// carries only the fixed [`ACCESS_ERROR_MESSAGE`]
    pub fn unauthorized_generic() -> Self {
        Error::unauthorized(ACCESS_ERROR_MESSAGE)
    }

    /// A session error carrying the authority response
    pub fn session(response: SessionResponseEx, request_id: Option<String>) -> Self {
        Error::Session {
            response: Box::new(response),
            request_id,
        }
    }

    /// The authority error code carried by this error, if any
    pub fn session_error_code(&self) -> Option<SessionErrorCode> {
        match self {
            Error::Session { response, .. } => Some(response.response.error_code),
            _ => None,
        }
    }

    /// Check whether this error reports a closed session
    pub fn is_session_closed(&self) -> bool {
        self.session_error_code() == Some(SessionErrorCode::SessionClosed)
    }
}

impl From<causeway_core::Error> for Error {
    fn from(err: causeway_core::Error) -> Self {
        match err {
            causeway_core::Error::Authority(message) => Error::Access(message),
            other => Error::Core(other),
        }
    }
}

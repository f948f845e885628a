use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Failures of the socket connection lifecycle.
///
/// The type is `Clone` because a single in-flight connection attempt is shared by every
/// concurrent caller of [`ConnectionManager::connect`](crate::services::connection::ConnectionManager::connect).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// No auth token was supplied and none is stored.
    #[error("missing auth token")]
    MissingToken,
    /// The server refused the handshake because of the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The server did not acknowledge the connection in time.
    #[error("connection timed out")]
    Timeout,
    /// Transport-level failure (DNS, TCP, TLS, WebSocket).
    #[error("transport error: {0}")]
    Transport(String),
    /// No live link is available to carry an outbound command.
    #[error("not connected")]
    NotConnected,
    /// An outbound command could not be encoded.
    #[error("failed to encode command: {0}")]
    Encode(String),
}

impl ConnectionError {
    /// Whether the reconnection policy should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionError::Timeout | ConnectionError::Transport(_))
    }
}

/// Errors surfaced by the duel session handle.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("session closed")]
    Closed,
    /// The command could not be forwarded to the server.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// An answer was selected outside of the question phase.
    #[error("no question is currently open")]
    NoActiveQuestion,
    /// The current question already has a submission.
    #[error("question already answered")]
    AlreadyAnswered,
    /// The selected letter is not one of the presented options.
    #[error("invalid answer: {0}")]
    InvalidAnswer(String),
}

/// Errors raised by the REST client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP client could not be initialised.
    #[error("failed to build HTTP client")]
    ClientBuilder {
        #[source]
        /// Underlying builder failure.
        source: reqwest::Error,
    },
    /// No auth token is stored.
    #[error("missing auth token")]
    MissingToken,
    /// The request could not be sent.
    #[error("failed to send request to `{path}`")]
    Request {
        /// Endpoint path.
        path: String,
        #[source]
        /// Underlying HTTP client failure.
        source: reqwest::Error,
    },
    /// The server answered with an unexpected status.
    #[error("unexpected response status {status} for `{path}`")]
    Status {
        /// Endpoint path.
        path: String,
        /// Returned status.
        status: StatusCode,
    },
    /// The response body could not be decoded.
    #[error("failed to decode response for `{path}`")]
    Decode {
        /// Endpoint path.
        path: String,
        #[source]
        /// Underlying decoding failure.
        source: reqwest::Error,
    },
    /// Refreshing the auth token failed; stored credentials were cleared.
    #[error("session expired, please sign in again")]
    SessionExpired,
    /// Reading or writing stored credentials failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

use thiserror::Error;

use crate::message::Status;

/// Result type alias for load operations.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Errors surfaced by the load client.
///
/// Every per-session failure is captured into that session's result; none of
/// these abort the whole run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The transport could not produce a stream.
    #[error("connect error: {0}")]
    Connect(String),

    /// Writing an envelope to the stream failed.
    #[error("send error: {0}")]
    Send(String),

    /// Reading an acknowledgment from the stream failed.
    #[error("recv error: {0}")]
    Recv(String),

    /// The remote endpoint acknowledged a message with a non-success status.
    #[error("unexpected status: {status} - {info}")]
    ProtocolRejection {
        /// Status reported by the remote endpoint.
        status: Status,
        /// Diagnostic text attached to the acknowledgment.
        info: String,
    },

    /// The load parameters are unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A session task died without reporting a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LoadError {
    /// Whether the error was raised before the stream existed.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Whether the remote endpoint answered with a non-success status.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::ProtocolRejection { .. })
    }
}

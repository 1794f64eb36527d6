//! Client error types.

use std::io;

use thiserror::Error;

use chatline_core::{ConnectionState, SnapshotError, TracingError};
use chatline_protocol::EncodingError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Socket-level failures. These drive the connection into `Reconnecting`
/// or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The socket could not be opened.
    #[error("failed to connect to {url}: {reason}")]
    Open { url: String, reason: String },

    /// The peer closed the socket with a non-normal code.
    #[error("socket closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    /// The socket reported an error.
    #[error("socket error: {0}")]
    Socket(String),

    /// A frame could not be handed to the socket.
    #[error("send failed: {0}")]
    Send(String),

    /// The operation is not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: ConnectionState,
        operation: &'static str,
    },
}

impl ConnectionError {
    pub fn socket(reason: impl Into<String>) -> Self {
        Self::Socket(reason.into())
    }

    pub fn send(reason: impl Into<String>) -> Self {
        Self::Send(reason.into())
    }

    pub fn invalid_state(state: ConnectionState, operation: &'static str) -> Self {
        Self::InvalidState { state, operation }
    }
}

/// Why a single outgoing envelope was not sent.
#[derive(Debug, Error)]
pub enum SendError {
    /// The envelope could not be encoded; retrying will not help.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The connection is down or the socket rejected the frame.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// An outgoing message that ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message {id} not delivered after {attempts} attempt(s): {reason}")]
pub struct DeliveryFailure {
    pub id: String,
    pub attempts: u32,
    pub reason: String,
}

/// A router handler failed on one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// The handler was given a payload it does not handle.
    #[error("`{kind}` handler cannot process a `{found}` payload")]
    UnexpectedPayload { kind: &'static str, found: String },

    /// The handler returned an error.
    #[error("`{kind}` handler failed: {message}")]
    Handler { kind: String, message: String },

    /// The handler panicked.
    #[error("`{kind}` handler panicked: {message}")]
    Panicked { kind: String, message: String },
}

impl ProcessingError {
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Rejected outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("message text is empty")]
    EmptyText,

    #[error("sender handle is empty")]
    EmptyHandle,

    #[error("no outgoing message with id {0}")]
    UnknownMessage(String),

    #[error("message {id} is {status}, only failed messages can be retried")]
    NotFailed { id: String, status: String },
}

/// Top-level client error.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Delivery failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryFailure),

    /// Rejected submit or retry.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// Snapshot save or load failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Logging could not be initialised.
    #[error(transparent)]
    Tracing(#[from] TracingError),

    /// The session loop has stopped.
    #[error("session is closed")]
    SessionClosed,
}

impl ClientError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

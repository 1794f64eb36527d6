//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding an outgoing envelope.
///
/// An encoding error is fatal to the single send that produced it, never to
/// the connection.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Failed to serialize the payload to JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encoded frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Errors that can occur while decoding and validating an incoming frame.
///
/// A validation error drops the offending frame; the connection is unaffected.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Empty frame received.
    #[error("empty message")]
    EmptyMessage,

    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame is not valid JSON.
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Frame is valid JSON but not an object.
    #[error("expected a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    /// The `type` field is present but is not a string.
    #[error("`type` must be a string")]
    InvalidType,

    /// A field has the wrong shape for the envelope kind.
    #[error("invalid `{kind}` envelope: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A required field is missing or empty.
    #[error("`{kind}` envelope requires a non-empty `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    /// A pong that does not answer any outstanding ping.
    #[error("pong timestamp {timestamp} does not match an outstanding ping")]
    UnmatchedPong { timestamp: u64 },
}

/// Any protocol-level failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Outgoing envelope could not be encoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Incoming frame failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

//! Wire envelopes and the JSON codec for chatline.
//!
//! Client and server exchange JSON objects over a WebSocket connection at
//! `/ws`, one object per text frame.
//!
//! # Envelope Structure
//!
//! Every frame carries a `type` field naming the [`EnvelopeKind`] plus the
//! fields of that kind:
//! - `chat`: `handle`, `text`, optional `id` and `timestamp`
//! - `user_join` / `user_leave`: `handle`
//! - `user_list`: `users` (array of handles or `{ "handle": ... }` objects)
//! - `ping` / `pong`: `timestamp` (epoch milliseconds)
//!
//! A frame without `type` is a `chat` frame. Unknown types are preserved as
//! [`Payload::Unknown`].
//!
//! # Example
//!
//! ```rust
//! use chatline_protocol::{Envelope, EnvelopeCodec, Payload};
//!
//! let mut codec = EnvelopeCodec::new();
//! let frame = codec.encode(&Envelope::user_join("alice")).unwrap();
//! let decoded = codec.decode(frame.as_bytes()).unwrap();
//! assert!(matches!(decoded.payload(), Payload::UserJoin(p) if p.handle == "alice"));
//! ```

mod codec;
mod error;
mod types;

pub use codec::EnvelopeCodec;
pub use error::{EncodingError, ProtocolError, ProtocolResult, ValidationError};
pub use types::{
    AckPayload, ChatPayload, Envelope, EnvelopeKind, ErrorPayload, HeartbeatPayload, Payload,
    PresencePayload, StatusPayload, SystemPayload, TypingPayload, UserEntry, UserListPayload,
};

/// WebSocket endpoint path on the serving host.
pub const ENDPOINT_PATH: &str = "/ws";

/// Maximum encoded frame size (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket close code for a normal, intentional closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

//! JSON envelope codec.
//!
//! Each WebSocket text frame carries exactly one JSON object:
//!
//! ```text
//! { "type": "chat", "handle": "alice", "text": "hi", "id": "..." }
//! ```
//!
//! A frame without `type` is decoded as `chat`. Frames with an unrecognized
//! `type` decode to [`Payload::Unknown`] so newer servers stay compatible.

use std::collections::VecDeque;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{EncodingError, ValidationError};
use crate::types::{Envelope, EnvelopeKind, Payload};

/// Number of sent ping timestamps remembered for pong validation.
const PING_LEDGER_CAPACITY: usize = 16;

/// Encodes and decodes envelopes, tracking outstanding pings.
///
/// # Example
///
/// ```rust
/// use chatline_protocol::{Envelope, EnvelopeCodec, EnvelopeKind};
///
/// let mut codec = EnvelopeCodec::new();
/// let frame = codec.encode(&Envelope::chat("alice", "hi", None, None)).unwrap();
/// let decoded = codec.decode(frame.as_bytes()).unwrap();
/// assert_eq!(decoded.kind(), EnvelopeKind::Chat);
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_message_size: usize,
    outstanding_pings: VecDeque<u64>,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Creates a codec with the default size limit.
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Creates a codec with a custom size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            outstanding_pings: VecDeque::with_capacity(PING_LEDGER_CAPACITY),
        }
    }

    /// Returns ping timestamps still waiting for a pong, oldest first.
    pub fn outstanding_pings(&self) -> impl Iterator<Item = u64> + '_ {
        self.outstanding_pings.iter().copied()
    }

    /// Encodes an envelope into a JSON text frame.
    ///
    /// Encoding a ping records its timestamp so the matching pong validates.
    pub fn encode(&mut self, envelope: &Envelope) -> Result<String, EncodingError> {
        let payload = envelope.payload();
        let body = match payload {
            Payload::Chat(p) => to_object(p)?,
            Payload::System(p) => to_object(p)?,
            Payload::UserJoin(p) | Payload::UserLeave(p) => to_object(p)?,
            Payload::UserList(p) => to_object(p)?,
            Payload::Typing(p) => to_object(p)?,
            Payload::Status(p) => to_object(p)?,
            Payload::Ack(p) => to_object(p)?,
            Payload::Error(p) => to_object(p)?,
            Payload::Ping(p) | Payload::Pong(p) => to_object(p)?,
            Payload::Unknown { fields, .. } => fields.clone(),
        };

        let mut object = Map::with_capacity(body.len() + 1);
        object.insert("type".into(), Value::from(payload.type_name()));
        for (key, value) in body {
            if key != "type" {
                object.insert(key, value);
            }
        }

        let frame = serde_json::to_string(&Value::Object(object))?;
        if frame.len() > self.max_message_size {
            return Err(EncodingError::MessageTooLarge {
                size: frame.len(),
                max: self.max_message_size,
            });
        }

        if let Payload::Ping(p) = payload {
            if self.outstanding_pings.len() == PING_LEDGER_CAPACITY {
                self.outstanding_pings.pop_front();
            }
            self.outstanding_pings.push_back(p.timestamp);
        }

        Ok(frame)
    }

    /// Decodes and validates a single frame.
    pub fn decode(&mut self, data: &[u8]) -> Result<Envelope, ValidationError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(ValidationError::EmptyMessage);
        }
        if data.len() > self.max_message_size {
            return Err(ValidationError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }

        let value: Value = serde_json::from_slice(data).map_err(ValidationError::Malformed)?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(ValidationError::NotAnObject {
                    found: json_type_name(&other),
                });
            }
        };

        let type_name = match object.remove("type") {
            None | Some(Value::Null) => EnvelopeKind::Chat.as_str().to_string(),
            Some(Value::String(name)) => name,
            Some(_) => return Err(ValidationError::InvalidType),
        };

        let payload = match EnvelopeKind::from_wire(&type_name) {
            Some(kind) => parse_known(kind, object)?,
            None => Payload::Unknown {
                kind: type_name,
                fields: object,
            },
        };

        validate(&payload)?;

        if let Payload::Pong(p) = &payload {
            let position = self
                .outstanding_pings
                .iter()
                .position(|ts| *ts == p.timestamp)
                .ok_or(ValidationError::UnmatchedPong {
                    timestamp: p.timestamp,
                })?;
            self.outstanding_pings.remove(position);
        }

        Ok(Envelope::inbound(payload, Utc::now()))
    }
}

fn to_object<T: Serialize>(payload: &T) -> Result<Map<String, Value>, EncodingError> {
    match serde_json::to_value(payload)? {
        Value::Object(object) => Ok(object),
        _ => Ok(Map::new()),
    }
}

fn from_object<T: DeserializeOwned>(
    kind: EnvelopeKind,
    object: Map<String, Value>,
) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(object)).map_err(|source| {
        ValidationError::InvalidPayload {
            kind: kind.as_str(),
            source,
        }
    })
}

fn parse_known(kind: EnvelopeKind, object: Map<String, Value>) -> Result<Payload, ValidationError> {
    let payload = match kind {
        EnvelopeKind::Chat => Payload::Chat(from_object(kind, object)?),
        EnvelopeKind::System => Payload::System(from_object(kind, object)?),
        EnvelopeKind::UserJoin => Payload::UserJoin(from_object(kind, object)?),
        EnvelopeKind::UserLeave => Payload::UserLeave(from_object(kind, object)?),
        EnvelopeKind::UserList => {
            if !object.get("users").is_some_and(Value::is_array) {
                return Err(ValidationError::MissingField {
                    kind: kind.as_str(),
                    field: "users",
                });
            }
            Payload::UserList(from_object(kind, object)?)
        }
        EnvelopeKind::Typing => Payload::Typing(from_object(kind, object)?),
        EnvelopeKind::Status => Payload::Status(from_object(kind, object)?),
        EnvelopeKind::Ack => Payload::Ack(from_object(kind, object)?),
        EnvelopeKind::Error => Payload::Error(from_object(kind, object)?),
        EnvelopeKind::Ping | EnvelopeKind::Pong => {
            if !object.get("timestamp").is_some_and(Value::is_u64) {
                return Err(ValidationError::MissingField {
                    kind: kind.as_str(),
                    field: "timestamp",
                });
            }
            let heartbeat = from_object(kind, object)?;
            if kind == EnvelopeKind::Ping {
                Payload::Ping(heartbeat)
            } else {
                Payload::Pong(heartbeat)
            }
        }
        EnvelopeKind::Unknown => unreachable!("unknown kinds have no wire name"),
    };
    Ok(payload)
}

fn require(kind: EnvelopeKind, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            kind: kind.as_str(),
            field,
        });
    }
    Ok(())
}

/// Checks the per-kind required fields.
fn validate(payload: &Payload) -> Result<(), ValidationError> {
    let kind = payload.kind();
    match payload {
        Payload::Chat(p) => {
            require(kind, "handle", &p.handle)?;
            require(kind, "text", &p.text)
        }
        Payload::System(p) => require(kind, "text", &p.text),
        Payload::UserJoin(p) | Payload::UserLeave(p) => require(kind, "handle", &p.handle),
        Payload::UserList(p) => p
            .users
            .iter()
            .try_for_each(|entry| require(kind, "handle", &entry.handle)),
        Payload::Typing(p) => require(kind, "handle", &p.handle),
        Payload::Status(p) => require(kind, "status", &p.status),
        Payload::Ack(p) => require(kind, "id", &p.id),
        Payload::Error(_)
        | Payload::Ping(_)
        | Payload::Pong(_)
        | Payload::Unknown { .. } => Ok(()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

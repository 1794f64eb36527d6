//! Envelope and payload types for the chatline wire protocol.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of an envelope, as carried in the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnvelopeKind {
    Chat,
    System,
    UserJoin,
    UserLeave,
    UserList,
    Typing,
    Status,
    Ack,
    Error,
    Ping,
    Pong,
    /// Any `type` this client does not know about.
    Unknown,
}

impl EnvelopeKind {
    /// Every kind with a fixed wire name.
    pub const KNOWN: [EnvelopeKind; 11] = [
        Self::Chat,
        Self::System,
        Self::UserJoin,
        Self::UserLeave,
        Self::UserList,
        Self::Typing,
        Self::Status,
        Self::Ack,
        Self::Error,
        Self::Ping,
        Self::Pong,
    ];

    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::System => "system",
            Self::UserJoin => "user_join",
            Self::UserLeave => "user_leave",
            Self::UserList => "user_list",
            Self::Typing => "typing",
            Self::Status => "status",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }

    /// Looks up a kind by wire name. Returns `None` for unrecognized names.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::KNOWN.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deserializes a timestamp given either as RFC 3339 text or as epoch
/// milliseconds.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct TimestampVisitor;

    impl<'de> de::Visitor<'de> for TimestampVisitor {
        type Value = Option<DateTime<Utc>>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an RFC 3339 timestamp or epoch milliseconds")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            DateTime::parse_from_rfc3339(value)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            i64::try_from(value)
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(Some)
                .ok_or_else(|| E::custom("timestamp out of range"))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            DateTime::<Utc>::from_timestamp_millis(value)
                .map(Some)
                .ok_or_else(|| E::custom("timestamp out of range"))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
            self.visit_i64(value as i64)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// A chat line sent by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Sender handle.
    #[serde(default)]
    pub handle: String,
    /// Message body.
    #[serde(default)]
    pub text: String,
    /// Message id (client-generated for outgoing, server-assigned otherwise).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// When the message was written.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "flexible_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A server-authored notice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPayload {
    #[serde(default)]
    pub text: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "flexible_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of `user_join` and `user_leave`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(default)]
    pub handle: String,
}

/// One entry of a `user_list` roster.
///
/// Servers send either bare handle strings or `{ "handle": ... }` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserEntry {
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl UserEntry {
    /// Creates an entry with just a handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            status: None,
        }
    }
}

impl<'de> Deserialize<'de> for UserEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de;

        struct EntryVisitor;

        impl<'de> de::Visitor<'de> for EntryVisitor {
            type Value = UserEntry;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a handle string or an object with a `handle` field")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<UserEntry, E> {
                Ok(UserEntry::new(value))
            }

            fn visit_map<M: de::MapAccess<'de>>(self, mut map: M) -> Result<UserEntry, M::Error> {
                let mut handle: Option<String> = None;
                let mut status: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "handle" => handle = Some(map.next_value()?),
                        "status" => status = map.next_value()?,
                        _ => {
                            map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }
                let handle = handle.ok_or_else(|| de::Error::missing_field("handle"))?;
                Ok(UserEntry { handle, status })
            }
        }

        deserializer.deserialize_any(EntryVisitor)
    }
}

/// Full roster of connected users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserListPayload {
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// Typing indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub handle: String,
    #[serde(default, alias = "isTyping")]
    pub is_typing: bool,
}

/// Presence or server status update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// User the status applies to; absent for server-wide status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Status keyword (`online`, `offline`, or anything server-defined).
    #[serde(default)]
    pub status: String,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Server acknowledgement of a chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default)]
    pub id: String,
}

/// Server-reported error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Id of the client message the error refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Ping / pong payload; `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub timestamp: u64,
}

/// Type-specific envelope contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chat(ChatPayload),
    System(SystemPayload),
    UserJoin(PresencePayload),
    UserLeave(PresencePayload),
    UserList(UserListPayload),
    Typing(TypingPayload),
    Status(StatusPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Ping(HeartbeatPayload),
    Pong(HeartbeatPayload),
    /// A `type` this client does not understand, kept verbatim.
    Unknown {
        kind: String,
        fields: Map<String, Value>,
    },
}

impl Payload {
    /// Returns the kind of this payload.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Chat(_) => EnvelopeKind::Chat,
            Self::System(_) => EnvelopeKind::System,
            Self::UserJoin(_) => EnvelopeKind::UserJoin,
            Self::UserLeave(_) => EnvelopeKind::UserLeave,
            Self::UserList(_) => EnvelopeKind::UserList,
            Self::Typing(_) => EnvelopeKind::Typing,
            Self::Status(_) => EnvelopeKind::Status,
            Self::Ack(_) => EnvelopeKind::Ack,
            Self::Error(_) => EnvelopeKind::Error,
            Self::Ping(_) => EnvelopeKind::Ping,
            Self::Pong(_) => EnvelopeKind::Pong,
            Self::Unknown { .. } => EnvelopeKind::Unknown,
        }
    }

    /// Returns the wire `type` name, including unknown names verbatim.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Unknown { kind, .. } => kind,
            other => other.kind().as_str(),
        }
    }
}

/// A typed, immutable unit of wire data.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    payload: Payload,
    received_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Creates an outgoing envelope stamped with the current time.
    pub fn outbound(payload: Payload) -> Self {
        Self {
            payload,
            received_at: None,
            sent_at: Some(Utc::now()),
        }
    }

    /// Creates an incoming envelope stamped with the time it was received.
    pub fn inbound(payload: Payload, received_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            received_at: Some(received_at),
            sent_at: None,
        }
    }

    /// Creates a chat envelope.
    pub fn chat(
        handle: impl Into<String>,
        text: impl Into<String>,
        id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self::outbound(Payload::Chat(ChatPayload {
            handle: handle.into(),
            text: text.into(),
            id,
            timestamp,
        }))
    }

    /// Creates a `user_join` announcement.
    pub fn user_join(handle: impl Into<String>) -> Self {
        Self::outbound(Payload::UserJoin(PresencePayload {
            handle: handle.into(),
        }))
    }

    /// Creates a `user_leave` announcement.
    pub fn user_leave(handle: impl Into<String>) -> Self {
        Self::outbound(Payload::UserLeave(PresencePayload {
            handle: handle.into(),
        }))
    }

    /// Creates a typing indicator.
    pub fn typing(handle: impl Into<String>, is_typing: bool) -> Self {
        Self::outbound(Payload::Typing(TypingPayload {
            handle: handle.into(),
            is_typing,
        }))
    }

    /// Creates a heartbeat ping.
    pub fn ping(timestamp: u64) -> Self {
        Self::outbound(Payload::Ping(HeartbeatPayload { timestamp }))
    }

    /// Creates a heartbeat pong.
    pub fn pong(timestamp: u64) -> Self {
        Self::outbound(Payload::Pong(HeartbeatPayload { timestamp }))
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the envelope, returning the payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Returns a new envelope with the payload replaced and timestamps kept.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            received_at: self.received_at,
            sent_at: self.sent_at,
        }
    }

    /// Returns the kind of this envelope.
    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    /// When the envelope was received, for incoming envelopes.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    /// When the envelope was created for sending, for outgoing envelopes.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    /// Returns the sender/subject handle carried by the envelope, if any.
    pub fn handle(&self) -> Option<&str> {
        let handle = match &self.payload {
            Payload::Chat(p) => Some(p.handle.as_str()),
            Payload::UserJoin(p) | Payload::UserLeave(p) => Some(p.handle.as_str()),
            Payload::Typing(p) => Some(p.handle.as_str()),
            Payload::Status(p) => p.handle.as_deref(),
            Payload::Unknown { fields, .. } => fields.get("handle").and_then(Value::as_str),
            _ => None,
        };
        handle.filter(|h| !h.trim().is_empty())
    }

    /// Returns the text carried by the envelope, if any.
    pub fn text(&self) -> Option<&str> {
        let text = match &self.payload {
            Payload::Chat(p) => Some(p.text.as_str()),
            Payload::System(p) => Some(p.text.as_str()),
            Payload::Status(p) => p.text.as_deref(),
            Payload::Unknown { fields, .. } => fields.get("text").and_then(Value::as_str),
            _ => None,
        };
        text.filter(|t| !t.trim().is_empty())
    }

    /// Returns the message id carried by the envelope, if any.
    pub fn message_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::Chat(p) => p.id.as_deref(),
            Payload::Ack(p) => Some(p.id.as_str()),
            Payload::Error(p) => p.id.as_deref(),
            Payload::Unknown { fields, .. } => fields.get("id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Reinterprets an envelope carrying a handle and text as a chat message.
    ///
    /// Returns `None` when either field is absent or blank.
    pub fn as_chat(&self) -> Option<Envelope> {
        let handle = self.handle()?.trim().to_string();
        let text = self.text()?.to_string();
        if let Payload::Chat(_) = self.payload {
            return Some(self.clone());
        }
        let id = self.message_id().map(str::to_string);
        Some(self.with_payload(Payload::Chat(ChatPayload {
            handle,
            text,
            id,
            timestamp: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_roundtrip() {
        for kind in EnvelopeKind::KNOWN {
            assert_eq!(EnvelopeKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(EnvelopeKind::from_wire("reaction"), None);
        assert_eq!(EnvelopeKind::from_wire("unknown"), None);
    }

    #[test]
    fn user_entry_accepts_string_or_object() {
        let json = r#"{"users":["alice",{"handle":"bob","status":"away","extra":1}]}"#;
        let list: UserListPayload = serde_json::from_str(json).unwrap();
        assert_eq!(list.users[0], UserEntry::new("alice"));
        assert_eq!(list.users[1].handle, "bob");
        assert_eq!(list.users[1].status.as_deref(), Some("away"));
    }

    #[test]
    fn user_entry_object_without_handle_errors() {
        let json = r#"{"users":[{"status":"away"}]}"#;
        let result: Result<UserListPayload, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn typing_accepts_camel_case_alias() {
        let typing: TypingPayload =
            serde_json::from_str(r#"{"handle":"a","isTyping":true}"#).unwrap();
        assert!(typing.is_typing);
    }

    #[test]
    fn chat_timestamp_accepts_text_or_millis() {
        let text: ChatPayload =
            serde_json::from_str(r#"{"handle":"a","text":"b","timestamp":"2026-01-02T03:04:05Z"}"#)
                .unwrap();
        let millis: ChatPayload =
            serde_json::from_str(r#"{"handle":"a","text":"b","timestamp":1767323045000}"#).unwrap();
        assert_eq!(text.timestamp, millis.timestamp);
        assert!(text.timestamp.is_some());

        let null: ChatPayload =
            serde_json::from_str(r#"{"handle":"a","text":"b","timestamp":null}"#).unwrap();
        assert_eq!(null.timestamp, None);
    }

    #[test]
    fn handle_and_text_ignore_blank_values() {
        let envelope = Envelope::chat("  ", "hello", None, None);
        assert_eq!(envelope.handle(), None);
        assert_eq!(envelope.text(), Some("hello"));
    }

    #[test]
    fn unknown_payload_coerces_to_chat() {
        let mut fields = Map::new();
        fields.insert("handle".into(), Value::from("carol"));
        fields.insert("text".into(), Value::from("hi"));
        fields.insert("id".into(), Value::from("m-1"));
        let envelope = Envelope::inbound(
            Payload::Unknown {
                kind: "shout".into(),
                fields,
            },
            Utc::now(),
        );

        let chat = envelope.as_chat().unwrap();
        match chat.payload() {
            Payload::Chat(p) => {
                assert_eq!(p.handle, "carol");
                assert_eq!(p.text, "hi");
                assert_eq!(p.id.as_deref(), Some("m-1"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(chat.received_at(), envelope.received_at());
    }

    #[test]
    fn unknown_payload_without_text_does_not_coerce() {
        let mut fields = Map::new();
        fields.insert("handle".into(), Value::from("carol"));
        let envelope = Envelope::inbound(
            Payload::Unknown {
                kind: "wave".into(),
                fields,
            },
            Utc::now(),
        );
        assert!(envelope.as_chat().is_none());
        assert_eq!(envelope.payload().type_name(), "wave");
    }

    #[test]
    fn blank_handle_or_text_does_not_coerce() {
        let unknown = |handle: &str, text: &str| {
            let mut fields = Map::new();
            fields.insert("handle".into(), Value::from(handle));
            fields.insert("text".into(), Value::from(text));
            Envelope::inbound(
                Payload::Unknown {
                    kind: "reaction".into(),
                    fields,
                },
                Utc::now(),
            )
        };
        assert!(unknown("", "").as_chat().is_none());
        assert!(unknown("   ", "hi").as_chat().is_none());
        assert!(unknown("carol", " \t").as_chat().is_none());

        let chat = Envelope::inbound(
            Payload::Chat(ChatPayload {
                handle: " ".into(),
                text: "hi".into(),
                id: None,
                timestamp: None,
            }),
            Utc::now(),
        );
        assert!(chat.as_chat().is_none());

        let coerced = unknown(" carol ", "hi").as_chat().unwrap();
        assert_eq!(coerced.handle(), Some("carol"));
    }
}

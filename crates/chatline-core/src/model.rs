//! Users and chat messages as held by the state store.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Pattern for `@handle` mentions inside message text.
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_][A-Za-z0-9_.\-]{0,63})").expect("Invalid mention regex")
});

/// Number of hex characters kept from the handle digest.
const USER_ID_LEN: usize = 16;

/// Stable user identifier derived from a handle.
///
/// Handles compare case-insensitively, so `Alice` and `alice ` map to the
/// same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Derives the id for a handle.
    pub fn from_handle(handle: &str) -> Self {
        let folded = handle.trim().to_lowercase();
        let digest = Sha256::digest(folded.as_bytes());
        let mut hex = String::with_capacity(USER_ID_LEN);
        for byte in digest.iter().take(USER_ID_LEN / 2) {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Online presence of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Online,
    Offline,
}

/// A participant in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub handle: String,
    pub presence: Presence,
    /// When the user was last seen leaving.
    pub last_seen: Option<DateTime<Utc>>,
    /// Last time the user joined or spoke.
    pub last_activity: DateTime<Utc>,
}

impl User {
    /// Creates an online user.
    pub fn new(handle: impl Into<String>, now: DateTime<Utc>) -> Self {
        let handle = handle.into().trim().to_string();
        Self {
            id: UserId::from_handle(&handle),
            handle,
            presence: Presence::Online,
            last_seen: None,
            last_activity: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.presence == Presence::Online
    }
}

/// What kind of line a message renders as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Chat,
    System,
    Join,
    Leave,
}

/// Delivery progress of a message.
///
/// Only messages the local user sent move through these states; received
/// messages are always [`DeliveryStatus::Acked`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sending,
    Sent,
    Acked,
    Failed,
    Queued,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Acked => "acked",
            Self::Failed => "failed",
            Self::Queued => "queued",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_handle: String,
    pub text: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub is_self: bool,
    pub delivery_status: DeliveryStatus,
    /// Handles mentioned as `@handle`, in order of first appearance.
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl ChatMessage {
    /// A message received from another participant.
    pub fn received(
        id: impl Into<String>,
        sender_handle: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            sender_handle: sender_handle.into(),
            mentions: extract_mentions(&text),
            text,
            kind: MessageKind::Chat,
            timestamp,
            is_self: false,
            delivery_status: DeliveryStatus::Acked,
        }
    }

    /// A message typed by the local user, not yet delivered.
    pub fn outgoing(
        id: impl Into<String>,
        sender_handle: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            is_self: true,
            delivery_status: DeliveryStatus::Pending,
            ..Self::received(id, sender_handle, text, timestamp)
        }
    }

    /// A system line such as "alice joined".
    pub fn system(
        id: impl Into<String>,
        kind: MessageKind,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            sender_handle: String::new(),
            text: text.into(),
            kind,
            timestamp,
            is_self: false,
            delivery_status: DeliveryStatus::Acked,
            mentions: Vec::new(),
        }
    }

    /// Whether the text mentions `handle` (case-insensitive).
    pub fn mentions_handle(&self, handle: &str) -> bool {
        self.mentions.iter().any(|m| m.eq_ignore_ascii_case(handle.trim()))
    }
}

/// Extracts `@handle` mentions, deduplicated case-insensitively.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in MENTION_RE.captures_iter(text) {
        let handle = caps[1].trim_end_matches(['.', '-']);
        if handle.is_empty() {
            continue;
        }
        if !found.iter().any(|h| h.eq_ignore_ascii_case(handle)) {
            found.push(handle.to_string());
        }
    }
    found
}

//! Typed publish/subscribe for store events.
//!
//! Listeners run synchronously, in subscription order. A panicking listener
//! is caught and logged so the remaining listeners still see the event.

use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use tracing::warn;

use crate::model::{ChatMessage, DeliveryStatus, User};
use crate::status::ConnectionStatus;

/// An event that can be dispatched through an [`EventBus`].
pub trait BusEvent {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

struct Listener<E: BusEvent> {
    id: ListenerId,
    /// `None` listens to every kind.
    kind: Option<E::Kind>,
    callback: Callback<E>,
}

/// Synchronous event dispatcher.
pub struct EventBus<E: BusEvent> {
    next_id: u64,
    listeners: Vec<Listener<E>>,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            listeners: Vec::new(),
        }
    }

    /// Subscribes to one kind of event.
    pub fn on<F>(&mut self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.subscribe(Some(kind), Box::new(callback))
    }

    /// Subscribes to every event.
    pub fn on_any<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.subscribe(None, Box::new(callback))
    }

    fn subscribe(&mut self, kind: Option<E::Kind>, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push(Listener { id, kind, callback });
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Delivers `event` to every matching listener.
    ///
    /// Returns the number of listeners that panicked.
    pub fn emit(&mut self, event: &E) -> usize {
        let kind = event.kind();
        let mut panicked = 0;
        for listener in &mut self.listeners {
            if listener.kind.is_some_and(|k| k != kind) {
                continue;
            }
            let callback = &mut listener.callback;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                panicked += 1;
                warn!(listener = listener.id.0, kind = ?kind, "Event listener panicked");
            }
        }
        panicked
    }
}

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// Events published by the state store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    MessageAdded {
        message: ChatMessage,
        index: usize,
        total: usize,
    },
    /// Oldest messages dropped to stay within the bound.
    MessagesEvicted {
        messages: Vec<ChatMessage>,
        evicted_total: u64,
        total: usize,
    },
    MessageUpdated {
        message: ChatMessage,
        previous: DeliveryStatus,
    },
    UserAdded(User),
    UserRemoved(User),
    UserUpdated(User),
    ConnectionStatusChanged(ConnectionStatus),
    TypingChanged {
        handle: String,
        is_typing: bool,
    },
    /// An outgoing message ran out of retries.
    DeliveryFailed {
        id: String,
        attempts: u32,
        reason: String,
    },
    /// A router handler failed on one envelope.
    ProcessingError {
        kind: String,
        error: String,
    },
    Notice {
        level: NoticeLevel,
        text: String,
    },
}

/// Discriminant of [`StoreEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageAdded,
    MessagesEvicted,
    MessageUpdated,
    UserAdded,
    UserRemoved,
    UserUpdated,
    ConnectionStatusChanged,
    TypingChanged,
    DeliveryFailed,
    ProcessingError,
    Notice,
}

impl BusEvent for StoreEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::MessageAdded { .. } => EventKind::MessageAdded,
            Self::MessagesEvicted { .. } => EventKind::MessagesEvicted,
            Self::MessageUpdated { .. } => EventKind::MessageUpdated,
            Self::UserAdded(_) => EventKind::UserAdded,
            Self::UserRemoved(_) => EventKind::UserRemoved,
            Self::UserUpdated(_) => EventKind::UserUpdated,
            Self::ConnectionStatusChanged(_) => EventKind::ConnectionStatusChanged,
            Self::TypingChanged { .. } => EventKind::TypingChanged,
            Self::DeliveryFailed { .. } => EventKind::DeliveryFailed,
            Self::ProcessingError { .. } => EventKind::ProcessingError,
            Self::Notice { .. } => EventKind::Notice,
        }
    }
}

impl StoreEvent {
    pub fn notice(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self::Notice {
            level,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn typing(handle: &str) -> StoreEvent {
        StoreEvent::TypingChanged {
            handle: handle.to_string(),
            is_typing: true,
        }
    }

    #[test]
    fn listeners_filter_by_kind() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        bus.on(EventKind::TypingChanged, move |e: &StoreEvent| {
            s.lock().unwrap().push(e.kind());
        });
        let s = Arc::clone(&seen);
        bus.on_any(move |e: &StoreEvent| {
            s.lock().unwrap().push(e.kind());
        });

        bus.emit(&typing("bob"));
        bus.emit(&StoreEvent::notice(NoticeLevel::Info, "hi"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                EventKind::TypingChanged,
                EventKind::TypingChanged,
                EventKind::Notice
            ]
        );
    }

    #[test]
    fn off_removes_listener() {
        let mut bus: EventBus<StoreEvent> = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let id = bus.on_any(move |_| *c.lock().unwrap() += 1);

        bus.emit(&typing("a"));
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&typing("a"));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let mut bus: EventBus<StoreEvent> = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.on_any(|_| panic!("listener failure"));
        let r = Arc::clone(&reached);
        bus.on_any(move |_| *r.lock().unwrap() = true);

        let panicked = bus.emit(&typing("a"));

        assert_eq!(panicked, 1);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let value = serde_json::to_value(StoreEvent::notice(NoticeLevel::Warning, "slow")).unwrap();
        insta::assert_json_snapshot!(value, @r#"
        {
          "event": "notice",
          "level": "warning",
          "text": "slow"
        }
        "#);

        let value = serde_json::to_value(typing("bob")).unwrap();
        assert_eq!(value["event"], "typing_changed");
        assert_eq!(value["is_typing"], true);
    }
}

//! Canonical in-memory model of the conversation.
//!
//! The store holds a bounded, insertion-ordered sequence of messages and the
//! set of known users. Every mutation commits first and then publishes its
//! event through the store's [`EventBus`].

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::events::{BusEvent, EventBus, EventKind, ListenerId, StoreEvent};
use crate::model::{ChatMessage, DeliveryStatus, User, UserId};

/// Default bound on retained messages.
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

/// Store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Messages retained before the oldest are evicted.
    pub max_messages: usize,
    /// Refuse a message whose id is already present.
    pub dedup_by_id: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            dedup_by_id: true,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max.max(1);
        self
    }

    #[must_use]
    pub fn with_dedup_by_id(mut self, dedup: bool) -> Self {
        self.dedup_by_id = dedup;
        self
    }
}

/// The single source of truth for users and messages.
#[derive(Debug)]
pub struct StateStore {
    config: StoreConfig,
    messages: VecDeque<ChatMessage>,
    ids: HashSet<String>,
    users: BTreeMap<UserId, User>,
    evicted_total: u64,
    bus: EventBus<StoreEvent>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl StateStore {
    pub fn new(mut config: StoreConfig) -> Self {
        config.max_messages = config.max_messages.max(1);
        Self {
            messages: VecDeque::with_capacity(config.max_messages.min(DEFAULT_MAX_MESSAGES) + 1),
            config,
            ids: HashSet::new(),
            users: BTreeMap::new(),
            evicted_total: 0,
            bus: EventBus::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // Subscriptions

    pub fn on<F>(&mut self, kind: EventKind, callback: F) -> ListenerId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        self.bus.on(kind, callback)
    }

    pub fn on_any<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        self.bus.on_any(callback)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.bus.off(id)
    }

    /// Publishes an event that is not tied to a store mutation.
    pub fn emit(&mut self, event: StoreEvent) {
        trace!(kind = ?event.kind(), "Emitting store event");
        self.bus.emit(&event);
    }

    // Messages

    /// Appends a message, evicting the oldest if the bound is exceeded.
    ///
    /// Returns false when the id is already present and deduplication is on;
    /// nothing is emitted in that case.
    pub fn add_message(&mut self, message: ChatMessage) -> bool {
        if !self.push_message(message.clone()) {
            return false;
        }
        let evicted = self.evict_overflow();
        let total = self.messages.len();
        self.emit_evicted(evicted);
        self.bus.emit(&StoreEvent::MessageAdded {
            message,
            index: total - 1,
            total,
        });
        true
    }

    /// Appends messages in order with a single eviction pass.
    ///
    /// Emits at most one `MessagesEvicted` for the whole batch, followed by
    /// one `MessageAdded` for each added message that is still retained.
    /// Returns how many messages were added.
    pub fn add_messages<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        let mut added = Vec::new();
        for message in messages {
            if self.push_message(message.clone()) {
                added.push(message);
            }
        }
        if added.is_empty() {
            return 0;
        }
        let count = added.len();
        let evicted = self.evict_overflow();
        let evicted_ids: HashSet<&str> = evicted.iter().map(|m| m.id.as_str()).collect();
        let total = self.messages.len();
        let retained: Vec<ChatMessage> = added
            .into_iter()
            .filter(|m| !evicted_ids.contains(m.id.as_str()))
            .collect();
        self.emit_evicted(evicted);

        let first_index = total - retained.len();
        for (offset, message) in retained.into_iter().enumerate() {
            self.bus.emit(&StoreEvent::MessageAdded {
                message,
                index: first_index + offset,
                total,
            });
        }
        count
    }

    fn push_message(&mut self, message: ChatMessage) -> bool {
        if self.config.dedup_by_id && self.ids.contains(&message.id) {
            debug!(id = %message.id, "Dropping duplicate message");
            return false;
        }
        self.ids.insert(message.id.clone());
        self.messages.push_back(message);
        true
    }

    fn evict_overflow(&mut self) -> Vec<ChatMessage> {
        let overflow = self.messages.len().saturating_sub(self.config.max_messages);
        if overflow == 0 {
            return Vec::new();
        }
        let evicted: Vec<ChatMessage> = self.messages.drain(..overflow).collect();
        for message in &evicted {
            self.ids.remove(&message.id);
        }
        self.evicted_total += evicted.len() as u64;
        debug!(
            count = evicted.len(),
            evicted_total = self.evicted_total,
            "Evicted oldest messages"
        );
        evicted
    }

    fn emit_evicted(&mut self, evicted: Vec<ChatMessage>) {
        if evicted.is_empty() {
            return;
        }
        self.bus.emit(&StoreEvent::MessagesEvicted {
            messages: evicted,
            evicted_total: self.evicted_total,
            total: self.messages.len(),
        });
    }

    /// Changes the delivery status of a message.
    ///
    /// Returns false if the message is gone or already has that status.
    pub fn update_message_status(&mut self, id: &str, status: DeliveryStatus) -> bool {
        let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == id) else {
            return false;
        };
        if message.delivery_status == status {
            return false;
        }
        let previous = message.delivery_status;
        message.delivery_status = status;
        let message = message.clone();
        trace!(id, %previous, %status, "Message status changed");
        self.bus.emit(&StoreEvent::MessageUpdated { message, previous });
        true
    }

    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().rev().find(|m| m.id == id)
    }

    pub fn contains_message(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Messages in `start..end`, clamped to the current length.
    pub fn slice(&self, start: usize, end: usize) -> impl Iterator<Item = &ChatMessage> {
        let end = end.min(self.messages.len());
        let start = start.min(end);
        self.messages.range(start..end)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of messages evicted since the store was created.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    // Users

    /// Inserts a user, or replaces the existing entry with the same id.
    ///
    /// Emits `UserAdded` for a new user and `UserUpdated` otherwise.
    pub fn add_user(&mut self, user: User) {
        let event = if self.users.contains_key(&user.id) {
            StoreEvent::UserUpdated(user.clone())
        } else {
            StoreEvent::UserAdded(user.clone())
        };
        debug!(handle = %user.handle, "Adding user");
        self.users.insert(user.id.clone(), user);
        self.bus.emit(&event);
    }

    pub fn remove_user(&mut self, handle: &str) -> Option<User> {
        let user = self.users.remove(&UserId::from_handle(handle))?;
        debug!(handle = %user.handle, "Removed user");
        self.bus.emit(&StoreEvent::UserRemoved(user.clone()));
        Some(user)
    }

    /// Applies `update` to the user with `handle` and emits `UserUpdated`.
    pub fn update_user<F>(&mut self, handle: &str, update: F) -> Option<User>
    where
        F: FnOnce(&mut User),
    {
        let user = self.users.get_mut(&UserId::from_handle(handle))?;
        update(user);
        let user = user.clone();
        self.bus.emit(&StoreEvent::UserUpdated(user.clone()));
        Some(user)
    }

    pub fn user(&self, handle: &str) -> Option<&User> {
        self.users.get(&UserId::from_handle(handle))
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;
    use crate::model::Presence;

    fn msg(i: usize) -> ChatMessage {
        ChatMessage::received(format!("m{i}"), "bob", format!("text {i}"), Utc::now())
    }

    fn recorder(store: &mut StateStore) -> Arc<Mutex<Vec<StoreEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.on_any(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn add_message_emits_after_commit() {
        let mut store = StateStore::default();
        let events = recorder(&mut store);

        assert!(store.add_message(msg(1)));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StoreEvent::MessageAdded {
                message,
                index,
                total,
            } => {
                assert_eq!(message.id, "m1");
                assert_eq!(*index, 0);
                assert_eq!(*total, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn bound_holds_after_every_add() {
        let mut store = StateStore::new(StoreConfig::default().with_max_messages(10));
        for i in 0..35 {
            store.add_message(msg(i));
            assert!(store.len() <= 10);
        }
        let ids: Vec<_> = store.messages().map(|m| m.id.clone()).collect();
        let expected: Vec<_> = (25..35).map(|i| format!("m{i}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(store.evicted_total(), 25);
    }

    #[test]
    fn zero_bound_from_config_keeps_one_message() {
        let config: StoreConfig = serde_json::from_str(r#"{"max_messages":0}"#).unwrap();
        let mut store = StateStore::new(config);
        assert_eq!(store.config().max_messages, 1);

        assert!(store.add_message(msg(1)));
        assert!(store.add_message(msg(2)));
        let ids: Vec<_> = store.messages().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m2".to_string()]);
    }

    #[test]
    fn single_add_evicts_oldest() {
        let mut store = StateStore::new(StoreConfig::default().with_max_messages(2));
        store.add_message(msg(1));
        store.add_message(msg(2));
        let events = recorder(&mut store);

        store.add_message(msg(3));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            StoreEvent::MessagesEvicted { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].id, "m1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(&events[1], StoreEvent::MessageAdded { index: 1, total: 2, .. }));
    }

    #[test]
    fn batch_of_1050_evicts_oldest_50_in_one_event() {
        let mut store = StateStore::default();
        let evictions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evictions);
        store.on(EventKind::MessagesEvicted, move |e| {
            if let StoreEvent::MessagesEvicted { messages, .. } = e {
                sink.lock().unwrap().push(messages.clone());
            }
        });

        let added = store.add_messages((0..1050).map(msg));

        assert_eq!(added, 1050);
        assert_eq!(store.len(), 1000);
        let evictions = evictions.lock().unwrap();
        assert_eq!(evictions.len(), 1);
        let evicted_ids: Vec<_> = evictions[0].iter().map(|m| m.id.clone()).collect();
        let expected: Vec<_> = (0..50).map(|i| format!("m{i}")).collect();
        assert_eq!(evicted_ids, expected);
        assert_eq!(store.messages().next().map(|m| m.id.as_str()), Some("m50"));
    }

    #[test]
    fn batch_added_events_use_final_indices() {
        let mut store = StateStore::new(StoreConfig::default().with_max_messages(3));
        let events = recorder(&mut store);

        store.add_messages((0..5).map(msg));

        let added: Vec<(String, usize)> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::MessageAdded { message, index, .. } => {
                    Some((message.id.clone(), *index))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            added,
            vec![("m2".to_string(), 0), ("m3".to_string(), 1), ("m4".to_string(), 2)]
        );
    }

    #[test]
    fn duplicate_id_is_refused() {
        let mut store = StateStore::default();
        let events = recorder(&mut store);

        assert!(store.add_message(msg(1)));
        assert!(!store.add_message(msg(1)));

        assert_eq!(store.len(), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn duplicates_allowed_when_dedup_disabled() {
        let mut store = StateStore::new(StoreConfig::default().with_dedup_by_id(false));
        store.add_message(msg(1));
        store.add_message(msg(1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn evicted_id_can_be_added_again() {
        let mut store = StateStore::new(StoreConfig::default().with_max_messages(1));
        store.add_message(msg(1));
        store.add_message(msg(2));
        assert!(!store.contains_message("m1"));
        assert!(store.add_message(msg(1)));
    }

    #[test]
    fn update_message_status_reports_previous() {
        let mut store = StateStore::default();
        store.add_message(ChatMessage::outgoing("out", "me", "hi", Utc::now()));
        let events = recorder(&mut store);

        assert!(store.update_message_status("out", DeliveryStatus::Sending));
        assert!(!store.update_message_status("out", DeliveryStatus::Sending));
        assert!(!store.update_message_status("missing", DeliveryStatus::Sent));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StoreEvent::MessageUpdated { message, previous } => {
                assert_eq!(*previous, DeliveryStatus::Pending);
                assert_eq!(message.delivery_status, DeliveryStatus::Sending);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            store.message("out").map(|m| m.delivery_status),
            Some(DeliveryStatus::Sending)
        );
    }

    #[test]
    fn users_keyed_by_case_folded_handle() {
        let mut store = StateStore::default();
        let events = recorder(&mut store);

        store.add_user(User::new("Alice", Utc::now()));
        store.add_user(User::new("alice", Utc::now()));

        assert_eq!(store.user_count(), 1);
        let kinds: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(BusEvent::kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::UserAdded, EventKind::UserUpdated]);
    }

    #[test]
    fn update_and_remove_user() {
        let mut store = StateStore::default();
        store.add_user(User::new("bob", Utc::now()));

        let updated = store.update_user("BOB", |u| u.presence = Presence::Offline);
        assert_eq!(updated.map(|u| u.presence), Some(Presence::Offline));
        assert!(store.update_user("nobody", |_| {}).is_none());

        let removed = store.remove_user("bob");
        assert_eq!(removed.map(|u| u.handle), Some("bob".to_string()));
        assert!(store.remove_user("bob").is_none());
        assert!(store.user("bob").is_none());
    }

    #[test]
    fn faulty_listener_does_not_block_mutation_events() {
        let mut store = StateStore::default();
        store.on(EventKind::MessageAdded, |_| panic!("renderer bug"));
        let events = recorder(&mut store);

        store.add_message(msg(1));

        assert_eq!(store.len(), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn slice_is_clamped() {
        let mut store = StateStore::default();
        store.add_messages((0..5).map(msg));
        let ids: Vec<_> = store.slice(3, 99).map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);
        assert_eq!(store.slice(7, 2).count(), 0);
    }
}

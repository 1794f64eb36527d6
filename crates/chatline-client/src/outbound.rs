//! Outbound delivery pipeline.
//!
//! Every message the local user submits is appended to the store right away
//! and tracked here until the server acknowledges it or it runs out of
//! retries. Entries leave in submission order, across reconnects.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatline_core::{ChatMessage, DeliveryStatus, StateStore, StoreEvent};
use chatline_protocol::Envelope;

use crate::connection::Outlet;
use crate::error::{DeliveryFailure, SendError, SubmitError};

/// Delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Transmit attempts before a message is marked failed.
    pub max_retries: u32,
    /// Base retry delay in milliseconds; attempt `n` waits `n` times this.
    pub retry_delay_ms: u64,
    /// Keep messages at `sent` until the server acknowledges them.
    pub await_ack: bool,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2000,
            await_ack: true,
        }
    }
}

impl OutboundConfig {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_await_ack(mut self, await_ack: bool) -> Self {
        self.await_ack = await_ack;
        self
    }

    /// Delay before the retry following failure number `retry_count`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(retry_count)))
    }
}

/// Where an entry is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for the connection or for entries ahead of it.
    Queued,
    /// A transmit failed; retried at `retry_at`.
    Waiting { retry_at: Instant },
    /// Handed to the socket, awaiting the server's ack.
    Sent,
    /// Out of retries, or rejected. Only a manual retry moves it again.
    Failed,
}

#[derive(Debug)]
struct OutboundEntry {
    message: ChatMessage,
    retry_count: u32,
    state: EntryState,
}

enum AttemptResult {
    Sent,
    /// Acked without waiting for the server; the entry was removed.
    Completed,
    Deferred,
    Failed,
}

/// Queue of outgoing messages not yet acknowledged.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    config: OutboundConfig,
    entries: VecDeque<OutboundEntry>,
}

impl OutboundQueue {
    pub fn new(config: OutboundConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &OutboundConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_state(&self, id: &str) -> Option<EntryState> {
        self.find(id).map(|i| self.entries[i].state)
    }

    pub fn retry_count(&self, id: &str) -> Option<u32> {
        self.find(id).map(|i| self.entries[i].retry_count)
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn has_active_ahead(&self, index: usize) -> bool {
        self.entries
            .iter()
            .take(index)
            .any(|e| matches!(e.state, EntryState::Queued | EntryState::Waiting { .. }))
    }

    /// Creates an outgoing message, appends it to the store and sends it if
    /// possible. Returns the new message id.
    pub fn submit(
        &mut self,
        text: &str,
        handle: &str,
        store: &mut StateStore,
        outlet: &mut dyn Outlet,
        now: Instant,
    ) -> Result<String, SubmitError> {
        if text.trim().is_empty() {
            return Err(SubmitError::EmptyText);
        }
        if handle.trim().is_empty() {
            return Err(SubmitError::EmptyHandle);
        }

        let id = Uuid::new_v4().to_string();
        let mut message = ChatMessage::outgoing(id.clone(), handle.trim(), text, Utc::now());
        if !outlet.is_open() {
            message.delivery_status = DeliveryStatus::Queued;
        }
        store.add_message(message.clone());
        debug!(id = %id, status = %message.delivery_status, "Submitted message");

        let open = outlet.is_open();
        self.entries.push_back(OutboundEntry {
            message,
            retry_count: 0,
            state: EntryState::Queued,
        });
        let index = self.entries.len() - 1;

        if !open {
            return Ok(id);
        }
        if self.has_active_ahead(index) {
            store.update_message_status(&id, DeliveryStatus::Queued);
            self.flush(store, outlet, now);
        } else {
            self.attempt_send(index, store, outlet, now);
        }
        self.forget_evicted(store);
        Ok(id)
    }

    /// Drops `sent` entries whose message is no longer in the store.
    ///
    /// The store is bounded; once a message has been evicted nothing can
    /// show its acknowledgement, so waiting for one is pointless.
    pub fn forget_evicted(&mut self, store: &StateStore) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.state != EntryState::Sent || store.contains_message(&e.message.id));
        let forgotten = before - self.entries.len();
        if forgotten > 0 {
            debug!(count = forgotten, "Forgot unacknowledged messages evicted from the store");
        }
        forgotten
    }

    /// Sends queued entries in submission order.
    ///
    /// Stops at the first entry waiting for a retry, and after a transmit
    /// failure, so later entries never overtake earlier ones.
    pub fn flush(&mut self, store: &mut StateStore, outlet: &mut dyn Outlet, now: Instant) {
        let mut index = 0;
        while index < self.entries.len() {
            match self.entries[index].state {
                EntryState::Sent | EntryState::Failed => index += 1,
                EntryState::Waiting { .. } => break,
                EntryState::Queued => {
                    if !outlet.is_open() {
                        break;
                    }
                    match self.attempt_send(index, store, outlet, now) {
                        AttemptResult::Completed => {}
                        AttemptResult::Sent | AttemptResult::Failed => index += 1,
                        AttemptResult::Deferred => break,
                    }
                }
            }
        }
    }

    /// Moves every unacknowledged entry back to the queue and flushes.
    ///
    /// Called when the connection (re)opens; no attempt is consumed. A `sent`
    /// frame may have died with the previous socket, so it goes out again.
    pub fn resume(&mut self, store: &mut StateStore, outlet: &mut dyn Outlet, now: Instant) {
        for entry in &mut self.entries {
            if matches!(entry.state, EntryState::Waiting { .. } | EntryState::Sent) {
                entry.state = EntryState::Queued;
                store.update_message_status(&entry.message.id, DeliveryStatus::Queued);
            }
        }
        self.flush(store, outlet, now);
    }

    fn attempt_send(
        &mut self,
        index: usize,
        store: &mut StateStore,
        outlet: &mut dyn Outlet,
        now: Instant,
    ) -> AttemptResult {
        let (id, envelope) = {
            let message = &self.entries[index].message;
            (
                message.id.clone(),
                Envelope::chat(
                    message.sender_handle.clone(),
                    message.text.clone(),
                    Some(message.id.clone()),
                    Some(message.timestamp),
                ),
            )
        };
        store.update_message_status(&id, DeliveryStatus::Sending);

        match outlet.transmit(&envelope, now) {
            Ok(()) => {
                if self.config.await_ack {
                    self.entries[index].state = EntryState::Sent;
                    store.update_message_status(&id, DeliveryStatus::Sent);
                    debug!(id = %id, "Message sent");
                    AttemptResult::Sent
                } else {
                    self.entries.remove(index);
                    store.update_message_status(&id, DeliveryStatus::Acked);
                    debug!(id = %id, "Message sent, no ack expected");
                    AttemptResult::Completed
                }
            }
            Err(SendError::Encoding(e)) => {
                let entry = &mut self.entries[index];
                entry.retry_count += 1;
                entry.state = EntryState::Failed;
                let attempts = entry.retry_count;
                self.fail(&id, attempts, e.to_string(), store);
                AttemptResult::Failed
            }
            Err(SendError::Connection(e)) => {
                let entry = &mut self.entries[index];
                entry.retry_count += 1;
                let attempts = entry.retry_count;
                if attempts < self.config.max_retries {
                    let delay = self.config.retry_delay(attempts);
                    entry.state = EntryState::Waiting {
                        retry_at: now + delay,
                    };
                    store.update_message_status(&id, DeliveryStatus::Pending);
                    info!(
                        id = %id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retry scheduled"
                    );
                    AttemptResult::Deferred
                } else {
                    entry.state = EntryState::Failed;
                    self.fail(&id, attempts, e.to_string(), store);
                    AttemptResult::Failed
                }
            }
        }
    }

    fn fail(&self, id: &str, attempts: u32, reason: String, store: &mut StateStore) {
        let failure = DeliveryFailure {
            id: id.to_string(),
            attempts,
            reason,
        };
        warn!(error = %failure, "Delivery failed");
        store.update_message_status(id, DeliveryStatus::Failed);
        store.emit(StoreEvent::DeliveryFailed {
            id: failure.id,
            attempts: failure.attempts,
            reason: failure.reason,
        });
    }

    /// Fires due retries. An entry whose retry comes due while the outlet is
    /// closed goes back to the queue without consuming an attempt.
    pub fn tick(&mut self, store: &mut StateStore, outlet: &mut dyn Outlet, now: Instant) {
        let mut due = false;
        for entry in &mut self.entries {
            if let EntryState::Waiting { retry_at } = entry.state
                && retry_at <= now
            {
                entry.state = EntryState::Queued;
                store.update_message_status(&entry.message.id, DeliveryStatus::Queued);
                due = true;
            }
        }
        if due && outlet.is_open() {
            self.flush(store, outlet, now);
        }
    }

    /// Earliest pending retry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| match e.state {
                EntryState::Waiting { retry_at } => Some(retry_at),
                _ => None,
            })
            .min()
    }

    /// Manually retries a failed message with a fresh retry budget.
    pub fn retry(
        &mut self,
        id: &str,
        store: &mut StateStore,
        outlet: &mut dyn Outlet,
        now: Instant,
    ) -> Result<(), SubmitError> {
        let index = self
            .find(id)
            .ok_or_else(|| SubmitError::UnknownMessage(id.to_string()))?;
        let entry = &mut self.entries[index];
        if entry.state != EntryState::Failed {
            let status = store
                .message(id)
                .map(|m| m.delivery_status)
                .unwrap_or_default();
            return Err(SubmitError::NotFailed {
                id: id.to_string(),
                status: status.to_string(),
            });
        }

        info!(id, "Retrying failed message");
        entry.retry_count = 0;
        entry.state = EntryState::Queued;
        if outlet.is_open() {
            self.attempt_send(index, store, outlet, now);
        } else {
            store.update_message_status(id, DeliveryStatus::Queued);
        }
        Ok(())
    }

    /// The server acknowledged `id`. Returns false if it is not tracked.
    pub fn acknowledge(&mut self, id: &str, store: &mut StateStore) -> bool {
        let Some(index) = self.find(id) else {
            return false;
        };
        self.entries.remove(index);
        store.update_message_status(id, DeliveryStatus::Acked);
        debug!(id, "Message acknowledged");
        true
    }

    /// An echo of one of our messages arrived without an id. Acknowledges the
    /// oldest `sent` entry with the same text and returns its id.
    pub fn acknowledge_echo(&mut self, text: &str, store: &mut StateStore) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|e| e.state == EntryState::Sent && e.message.text == text)?;
        let id = self.entries[index].message.id.clone();
        self.acknowledge(&id, store);
        Some(id)
    }

    /// The server refused `id`.
    pub fn reject(&mut self, id: &str, reason: &str, store: &mut StateStore) -> bool {
        let Some(index) = self.find(id) else {
            return false;
        };
        let entry = &mut self.entries[index];
        entry.state = EntryState::Failed;
        let attempts = entry.retry_count.max(1);
        self.fail(id, attempts, reason.to_string(), store);
        true
    }

    /// Messages the server has not acknowledged, for the session snapshot.
    pub fn pending_snapshot(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .map(|e| {
                let status = match e.state {
                    EntryState::Failed => DeliveryStatus::Failed,
                    EntryState::Queued | EntryState::Waiting { .. } | EntryState::Sent => {
                        DeliveryStatus::Queued
                    }
                };
                ChatMessage {
                    delivery_status: status,
                    ..e.message.clone()
                }
            })
            .collect()
    }

    /// Re-enqueues messages from a snapshot. Failed messages stay failed;
    /// everything else comes back queued.
    pub fn restore(&mut self, messages: Vec<ChatMessage>, store: &mut StateStore) -> usize {
        let mut restored = 0;
        for mut message in messages {
            if !message.is_self || self.find(&message.id).is_some() {
                continue;
            }
            let (state, status) = if message.delivery_status == DeliveryStatus::Failed {
                (EntryState::Failed, DeliveryStatus::Failed)
            } else {
                (EntryState::Queued, DeliveryStatus::Queued)
            };
            message.delivery_status = status;
            if store.contains_message(&message.id) {
                store.update_message_status(&message.id, status);
            } else {
                store.add_message(message.clone());
            }
            self.entries.push_back(OutboundEntry {
                message,
                retry_count: 0,
                state,
            });
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "Restored pending messages");
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chatline_core::{ConnectionState, EventKind, StoreConfig};
    use chatline_protocol::{EncodingError, Payload};

    use super::*;
    use crate::error::ConnectionError;

    #[derive(Default)]
    struct FakeOutlet {
        open: bool,
        failures: u32,
        too_large: bool,
        attempts: u32,
        sent: Vec<Envelope>,
    }

    impl FakeOutlet {
        fn open() -> Self {
            Self {
                open: true,
                ..Self::default()
            }
        }

        fn sent_texts(&self) -> Vec<String> {
            self.sent
                .iter()
                .filter_map(|e| e.text().map(str::to_string))
                .collect()
        }
    }

    impl Outlet for FakeOutlet {
        fn is_open(&self) -> bool {
            self.open
        }

        fn transmit(&mut self, envelope: &Envelope, _now: Instant) -> Result<(), SendError> {
            self.attempts += 1;
            if self.too_large {
                return Err(EncodingError::MessageTooLarge { size: 10, max: 1 }.into());
            }
            if !self.open {
                return Err(ConnectionError::invalid_state(ConnectionState::Idle, "send").into());
            }
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ConnectionError::send("connection reset").into());
            }
            self.sent.push(envelope.clone());
            Ok(())
        }
    }

    fn record_updates(store: &mut StateStore) -> Arc<Mutex<Vec<(String, DeliveryStatus)>>> {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        store.on(EventKind::MessageUpdated, move |event| {
            if let StoreEvent::MessageUpdated { message, .. } = event {
                sink.lock()
                    .unwrap()
                    .push((message.text.clone(), message.delivery_status));
            }
        });
        updates
    }

    fn status(store: &StateStore, id: &str) -> DeliveryStatus {
        store.message(id).unwrap().delivery_status
    }

    #[test]
    fn submit_rejects_blank_text_and_handle() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();

        assert_eq!(
            queue.submit("   ", "me", &mut store, &mut outlet, now),
            Err(SubmitError::EmptyText)
        );
        assert_eq!(
            queue.submit("hi", " ", &mut store, &mut outlet, now),
            Err(SubmitError::EmptyHandle)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn submit_while_open_sends_immediately() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();

        let id = queue
            .submit("hello", "me", &mut store, &mut outlet, Instant::now())
            .unwrap();

        assert_eq!(status(&store, &id), DeliveryStatus::Sent);
        assert!(store.message(&id).unwrap().is_self);
        assert_eq!(queue.entry_state(&id), Some(EntryState::Sent));
        let Payload::Chat(chat) = outlet.sent[0].payload() else {
            panic!("expected chat payload");
        };
        assert_eq!(chat.id.as_deref(), Some(id.as_str()));
        assert_eq!(chat.handle, "me");
    }

    #[test]
    fn without_await_ack_messages_complete_on_send() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::new(OutboundConfig::default().with_await_ack(false));

        let id = queue
            .submit("hello", "me", &mut store, &mut outlet, Instant::now())
            .unwrap();

        assert_eq!(status(&store, &id), DeliveryStatus::Acked);
        assert!(queue.is_empty());
    }

    #[test]
    fn queued_messages_flush_in_order_on_open() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::default();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();

        let ids: Vec<String> = ["one", "two", "three"]
            .iter()
            .map(|t| queue.submit(t, "me", &mut store, &mut outlet, now).unwrap())
            .collect();
        for id in &ids {
            assert_eq!(status(&store, id), DeliveryStatus::Queued);
        }

        let updates = record_updates(&mut store);
        outlet.open = true;
        queue.flush(&mut store, &mut outlet, now);

        assert_eq!(outlet.sent_texts(), vec!["one", "two", "three"]);
        let expected: Vec<(String, DeliveryStatus)> = ["one", "two", "three"]
            .iter()
            .flat_map(|t| {
                [
                    (t.to_string(), DeliveryStatus::Sending),
                    (t.to_string(), DeliveryStatus::Sent),
                ]
            })
            .collect();
        assert_eq!(*updates.lock().unwrap(), expected);
    }

    #[test]
    fn new_submit_waits_behind_queued_entries() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();

        outlet.failures = 1;
        let first = queue.submit("first", "me", &mut store, &mut outlet, now).unwrap();
        assert!(matches!(
            queue.entry_state(&first),
            Some(EntryState::Waiting { .. })
        ));

        let second = queue.submit("second", "me", &mut store, &mut outlet, now).unwrap();
        assert_eq!(queue.entry_state(&second), Some(EntryState::Queued));
        assert!(outlet.sent.is_empty());

        queue.tick(&mut store, &mut outlet, now + Duration::from_secs(2));
        assert_eq!(outlet.sent_texts(), vec!["first", "second"]);
    }

    #[test]
    fn three_transmit_failures_mark_failed() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        outlet.failures = u32::MAX;
        let mut queue = OutboundQueue::default();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        store.on(EventKind::DeliveryFailed, move |event| {
            if let StoreEvent::DeliveryFailed { attempts, .. } = event {
                sink.lock().unwrap().push(*attempts);
            }
        });

        let start = Instant::now();
        let id = queue.submit("hello", "me", &mut store, &mut outlet, start).unwrap();
        assert_eq!(status(&store, &id), DeliveryStatus::Pending);
        assert_eq!(queue.next_deadline(), Some(start + Duration::from_secs(2)));

        queue.tick(&mut store, &mut outlet, start + Duration::from_secs(2));
        assert_eq!(queue.retry_count(&id), Some(2));
        assert_eq!(queue.next_deadline(), Some(start + Duration::from_secs(6)));

        queue.tick(&mut store, &mut outlet, start + Duration::from_secs(6));
        assert_eq!(status(&store, &id), DeliveryStatus::Failed);
        assert_eq!(queue.entry_state(&id), Some(EntryState::Failed));
        assert_eq!(*failures.lock().unwrap(), vec![3]);

        assert_eq!(queue.next_deadline(), None);
        queue.tick(&mut store, &mut outlet, start + Duration::from_secs(600));
        queue.flush(&mut store, &mut outlet, start + Duration::from_secs(600));
        assert_eq!(outlet.attempts, 3);
    }

    #[test]
    fn due_retry_while_closed_does_not_consume_attempt() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        outlet.failures = 1;
        let mut queue = OutboundQueue::default();
        let now = Instant::now();

        let id = queue.submit("hello", "me", &mut store, &mut outlet, now).unwrap();
        outlet.open = false;
        queue.tick(&mut store, &mut outlet, now + Duration::from_secs(5));

        assert_eq!(queue.entry_state(&id), Some(EntryState::Queued));
        assert_eq!(status(&store, &id), DeliveryStatus::Queued);
        assert_eq!(queue.retry_count(&id), Some(1));
        assert_eq!(outlet.attempts, 1);

        outlet.open = true;
        queue.resume(&mut store, &mut outlet, now + Duration::from_secs(6));
        assert_eq!(status(&store, &id), DeliveryStatus::Sent);
    }

    #[test]
    fn encoding_failure_fails_immediately() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        outlet.too_large = true;
        let mut queue = OutboundQueue::default();

        let id = queue
            .submit("hello", "me", &mut store, &mut outlet, Instant::now())
            .unwrap();

        assert_eq!(status(&store, &id), DeliveryStatus::Failed);
        assert_eq!(queue.next_deadline(), None);
        assert_eq!(outlet.attempts, 1);
    }

    #[test]
    fn manual_retry_resets_budget() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        outlet.failures = 3;
        let mut queue = OutboundQueue::default();
        let start = Instant::now();

        let id = queue.submit("hello", "me", &mut store, &mut outlet, start).unwrap();
        queue.tick(&mut store, &mut outlet, start + Duration::from_secs(2));
        queue.tick(&mut store, &mut outlet, start + Duration::from_secs(6));
        assert_eq!(status(&store, &id), DeliveryStatus::Failed);

        queue.retry(&id, &mut store, &mut outlet, start + Duration::from_secs(7)).unwrap();
        assert_eq!(status(&store, &id), DeliveryStatus::Sent);
        assert_eq!(queue.retry_count(&id), Some(0));
    }

    #[test]
    fn retry_requires_failed_entry() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();
        let id = queue.submit("hello", "me", &mut store, &mut outlet, now).unwrap();

        assert_eq!(
            queue.retry(&id, &mut store, &mut outlet, now),
            Err(SubmitError::NotFailed {
                id: id.clone(),
                status: "sent".to_string(),
            })
        );
        assert_eq!(
            queue.retry("nope", &mut store, &mut outlet, now),
            Err(SubmitError::UnknownMessage("nope".to_string()))
        );
    }

    #[test]
    fn acknowledge_and_reject() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();
        let a = queue.submit("a", "me", &mut store, &mut outlet, now).unwrap();
        let b = queue.submit("b", "me", &mut store, &mut outlet, now).unwrap();

        assert!(queue.acknowledge(&a, &mut store));
        assert_eq!(status(&store, &a), DeliveryStatus::Acked);
        assert!(!queue.acknowledge(&a, &mut store));

        assert!(queue.reject(&b, "rate limited", &mut store));
        assert_eq!(status(&store, &b), DeliveryStatus::Failed);
        assert_eq!(queue.entry_state(&b), Some(EntryState::Failed));
    }

    #[test]
    fn pending_snapshot_and_restore() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::default();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();
        let queued = queue.submit("later", "me", &mut store, &mut outlet, now).unwrap();

        let pending = queue.pending_snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, queued);

        let mut fresh_store = StateStore::default();
        let mut fresh = OutboundQueue::default();
        assert_eq!(fresh.restore(pending.clone(), &mut fresh_store), 1);
        assert_eq!(fresh.restore(pending, &mut fresh_store), 0);
        assert_eq!(status(&fresh_store, &queued), DeliveryStatus::Queued);

        outlet.open = true;
        fresh.flush(&mut fresh_store, &mut outlet, now);
        assert_eq!(status(&fresh_store, &queued), DeliveryStatus::Sent);
    }

    #[test]
    fn unacked_sent_messages_go_out_again_on_reopen() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();
        let first = queue.submit("first", "me", &mut store, &mut outlet, now).unwrap();
        let second = queue.submit("second", "me", &mut store, &mut outlet, now).unwrap();
        assert!(queue.acknowledge(&first, &mut store));
        assert_eq!(queue.entry_state(&second), Some(EntryState::Sent));

        let pending = queue.pending_snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_status, DeliveryStatus::Queued);

        outlet.open = false;
        queue.resume(&mut store, &mut outlet, now);
        assert_eq!(status(&store, &second), DeliveryStatus::Queued);

        outlet.open = true;
        queue.resume(&mut store, &mut outlet, now + Duration::from_secs(1));
        assert_eq!(outlet.sent_texts(), vec!["first", "second", "second"]);
        assert_eq!(status(&store, &second), DeliveryStatus::Sent);
        assert_eq!(queue.retry_count(&second), Some(0));
    }

    #[test]
    fn evicted_sent_entries_are_forgotten() {
        let mut store = StateStore::new(StoreConfig::default().with_max_messages(10));
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();

        for i in 0..50 {
            queue
                .submit(&format!("m{i}"), "me", &mut store, &mut outlet, now)
                .unwrap();
        }

        assert_eq!(store.len(), 10);
        assert_eq!(queue.len(), 10);
        assert!(store.messages().all(|m| queue.entry_state(&m.id) == Some(EntryState::Sent)));
    }

    #[test]
    fn echo_without_id_acks_oldest_matching_entry() {
        let mut store = StateStore::default();
        let mut outlet = FakeOutlet::open();
        let mut queue = OutboundQueue::default();
        let now = Instant::now();
        let a = queue.submit("same", "me", &mut store, &mut outlet, now).unwrap();
        let b = queue.submit("same", "me", &mut store, &mut outlet, now).unwrap();

        assert_eq!(queue.acknowledge_echo("same", &mut store), Some(a.clone()));
        assert_eq!(status(&store, &a), DeliveryStatus::Acked);
        assert_eq!(status(&store, &b), DeliveryStatus::Sent);
        assert_eq!(queue.acknowledge_echo("other", &mut store), None);
    }
}

//! Grace period between a `user_leave` and the user's removal.

use std::collections::BTreeMap;

use tokio::time::Instant;

use chatline_core::UserId;

/// Departures waiting for their grace period to end.
///
/// A `user_join` for the same handle before the deadline cancels the
/// departure, so brief reconnects never show up as leave/join pairs.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    departures: BTreeMap<UserId, (String, Instant)>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules removal of `handle` at `at`, replacing any earlier schedule.
    pub fn schedule_departure(&mut self, handle: &str, at: Instant) {
        self.departures
            .insert(UserId::from_handle(handle), (handle.to_string(), at));
    }

    /// Returns true if a departure was pending.
    pub fn cancel_departure(&mut self, handle: &str) -> bool {
        self.departures.remove(&UserId::from_handle(handle)).is_some()
    }

    pub fn is_departing(&self, handle: &str) -> bool {
        self.departures.contains_key(&UserId::from_handle(handle))
    }

    pub fn pending(&self) -> usize {
        self.departures.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.departures.values().map(|(_, at)| *at).min()
    }

    /// Removes and returns every handle whose grace period ended by `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<UserId> = self
            .departures
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| self.departures.remove(&id))
            .map(|(handle, _)| handle)
            .collect()
    }
}

//! Message router.
//!
//! Every decoded envelope goes through the same pipeline:
//!
//! 1. filters: any filter returning false drops the envelope
//! 2. middleware, in registration order
//! 3. the handler registered for the envelope's kind
//!
//! Envelopes of a kind with no handler are handed to the fallback (unknown
//! kinds only), then coerced to `chat` when they carry a handle and text,
//! and dropped otherwise. A failing or panicking handler affects only its
//! own envelope; the failure is published as a `ProcessingError` event.

mod handlers;
mod presence;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chatline_core::{ChatMessage, MessageKind, StateStore, StoreEvent};
use chatline_protocol::{Envelope, EnvelopeKind};

use crate::error::ProcessingError;

pub use presence::PresenceTracker;

/// Router settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Seconds a departed user stays listed before removal.
    pub leave_grace_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            leave_grace_secs: 30,
        }
    }
}

impl RouterConfig {
    pub fn leave_grace(&self) -> Duration {
        Duration::from_secs(self.leave_grace_secs)
    }
}

/// What handling an envelope produced, for the session to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A message was appended to the store.
    Stored { id: String },
    /// A chat message whose id is already in the store.
    Duplicate { id: String },
    /// Our own chat message came back without an id; nothing was stored.
    Echo {
        handle: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Handled without anything further to do.
    Handled,
    /// The server acknowledged one of our messages.
    Acked { id: String },
    /// The server reported an error, optionally about one of our messages.
    ServerError { message: String, id: Option<String> },
    /// The server pinged us.
    PingReceived(u64),
    /// The server answered our heartbeat.
    Pong(u64),
}

/// What a handler can touch.
pub struct RouteContext<'a> {
    pub store: &'a mut StateStore,
    pub presence: &'a mut PresenceTracker,
    pub self_handle: Option<&'a str>,
    pub config: &'a RouterConfig,
    pub now: Instant,
}

impl RouteContext<'_> {
    /// Whether `handle` is the local user.
    pub fn is_self(&self, handle: &str) -> bool {
        self.self_handle
            .is_some_and(|me| me.trim().eq_ignore_ascii_case(handle.trim()))
    }
}

pub type Handler = Box<
    dyn FnMut(&Envelope, &mut RouteContext<'_>) -> Result<RouteOutcome, ProcessingError> + Send,
>;
pub type Filter = Box<dyn Fn(&Envelope) -> bool + Send>;
pub type Middleware = Box<dyn FnMut(Envelope) -> Envelope + Send>;

enum Target {
    Kind(EnvelopeKind),
    Fallback,
}

/// Routes envelopes to handlers and owns presence bookkeeping.
pub struct Router {
    config: RouterConfig,
    handlers: HashMap<EnvelopeKind, Handler>,
    filters: Vec<Filter>,
    middleware: Vec<Middleware>,
    fallback: Option<Handler>,
    presence: PresenceTracker,
    self_handle: Option<String>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("Router")
            .field("handlers", &kinds)
            .field("filters", &self.filters.len())
            .field("middleware", &self.middleware.len())
            .field("fallback", &self.fallback.is_some())
            .field("presence", &self.presence)
            .field("self_handle", &self.self_handle)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl Router {
    /// Creates a router with the default handler for every known kind.
    pub fn new(config: RouterConfig) -> Self {
        let mut router = Self::empty(config);
        handlers::install(&mut router);
        router
    }

    /// Creates a router with no handlers.
    pub fn empty(config: RouterConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
            filters: Vec::new(),
            middleware: Vec::new(),
            fallback: None,
            presence: PresenceTracker::new(),
            self_handle: None,
        }
    }

    /// Sets the local user's handle; join/leave lines are never shown for it.
    pub fn set_self_handle(&mut self, handle: Option<String>) {
        self.self_handle = handle.map(|h| h.trim().to_string());
    }

    pub fn self_handle(&self) -> Option<&str> {
        self.self_handle.as_deref()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Registers `handler` for `kind`, replacing any earlier one.
    pub fn register_handler<F>(&mut self, kind: EnvelopeKind, handler: F)
    where
        F: FnMut(&Envelope, &mut RouteContext<'_>) -> Result<RouteOutcome, ProcessingError>
            + Send
            + 'static,
    {
        if self.handlers.insert(kind, Box::new(handler)).is_some() {
            debug!(%kind, "Replaced handler");
        }
    }

    /// Handler for kinds this client does not know.
    pub fn set_fallback<F>(&mut self, handler: F)
    where
        F: FnMut(&Envelope, &mut RouteContext<'_>) -> Result<RouteOutcome, ProcessingError>
            + Send
            + 'static,
    {
        self.fallback = Some(Box::new(handler));
    }

    pub fn add_filter<F>(&mut self, filter: F)
    where
        F: Fn(&Envelope) -> bool + Send + 'static,
    {
        self.filters.push(Box::new(filter));
    }

    pub fn add_middleware<F>(&mut self, middleware: F)
    where
        F: FnMut(Envelope) -> Envelope + Send + 'static,
    {
        self.middleware.push(Box::new(middleware));
    }

    /// Runs one envelope through the pipeline.
    ///
    /// Returns `None` when the envelope was filtered, dropped, or its
    /// handler failed.
    pub fn process(
        &mut self,
        envelope: Envelope,
        store: &mut StateStore,
        now: Instant,
    ) -> Option<RouteOutcome> {
        if let Some(index) = self.filters.iter().position(|filter| !filter(&envelope)) {
            debug!(kind = %envelope.payload().type_name(), filter = index, "Envelope filtered out");
            return None;
        }

        let mut envelope = envelope;
        for middleware in &mut self.middleware {
            envelope = middleware(envelope);
        }

        let kind = envelope.kind();
        let (target, envelope) = if self.handlers.contains_key(&kind) {
            (Target::Kind(kind), envelope)
        } else if kind == EnvelopeKind::Unknown && self.fallback.is_some() {
            (Target::Fallback, envelope)
        } else if self.handlers.contains_key(&EnvelopeKind::Chat)
            && let Some(chat) = envelope.as_chat()
        {
            trace!(kind = %envelope.payload().type_name(), "Treating envelope as chat");
            (Target::Kind(EnvelopeKind::Chat), chat)
        } else {
            warn!(kind = %envelope.payload().type_name(), "No handler for envelope, dropping");
            return None;
        };

        let handler = match target {
            Target::Kind(kind) => self.handlers.get_mut(&kind),
            Target::Fallback => self.fallback.as_mut(),
        }?;
        let type_name = envelope.payload().type_name().to_string();

        let mut ctx = RouteContext {
            store: &mut *store,
            presence: &mut self.presence,
            self_handle: self.self_handle.as_deref(),
            config: &self.config,
            now,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&envelope, &mut ctx)));
        drop(ctx);

        let error = match result {
            Ok(Ok(outcome)) => {
                trace!(kind = %type_name, ?outcome, "Envelope handled");
                return Some(outcome);
            }
            Ok(Err(error)) => error,
            Err(payload) => ProcessingError::Panicked {
                kind: type_name.clone(),
                message: panic_message(payload.as_ref()),
            },
        };
        warn!(kind = %type_name, error = %error, "Envelope processing failed");
        store.emit(StoreEvent::ProcessingError {
            kind: type_name,
            error: error.to_string(),
        });
        None
    }

    /// Completes departures whose grace period has ended.
    pub fn tick(&mut self, store: &mut StateStore, now: Instant) {
        for handle in self.presence.expire(now) {
            let is_self = self
                .self_handle
                .as_deref()
                .is_some_and(|me| me.eq_ignore_ascii_case(&handle));
            let Some(user) = store.remove_user(&handle) else {
                continue;
            };
            if is_self {
                continue;
            }
            info!(handle = %user.handle, "User left");
            store.add_message(ChatMessage::system(
                Uuid::new_v4().to_string(),
                MessageKind::Leave,
                format!("{} left", user.handle),
                Utc::now(),
            ));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.presence.next_deadline()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

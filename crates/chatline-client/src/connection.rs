//! Connection lifecycle manager.
//!
//! Owns the single logical connection of a session: the socket, the state
//! machine, reconnection backoff and the heartbeat. It is synchronous; the
//! session loop feeds it socket events and calls [`ConnectionManager::tick`]
//! when [`ConnectionManager::next_deadline`] passes.
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Idle
//!              ^          |
//!              |          v
//!              +---- Reconnecting ----> Failed
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use chatline_core::{
    ConnectionQuality, ConnectionState, ConnectionStatus, NoticeLevel,
};
use chatline_protocol::{Envelope, EnvelopeCodec, MAX_MESSAGE_SIZE, NORMAL_CLOSE_CODE};

use crate::error::{ConnectionError, SendError};
use crate::transport::{SocketConnector, SocketEvent, SocketEventKind, SocketEventSender, SocketHandle};

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Longest reconnect delay in milliseconds.
    pub backoff_cap_ms: u64,
    /// Seconds between heartbeat pings.
    pub heartbeat_interval_secs: u64,
    /// Round trips at or above this are `poor`.
    pub poor_latency_ms: u64,
    /// Round trips at or above this are `bad`.
    pub bad_latency_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            heartbeat_interval_secs: 30,
            poor_latency_ms: 100,
            bad_latency_ms: 500,
        }
    }
}

/// Runtime configuration of a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub heartbeat_interval: Duration,
    pub poor_latency: Duration,
    pub bad_latency: Duration,
    pub max_message_size: usize,
}

impl ConnectionConfig {
    pub fn new(url: Url) -> Self {
        Self::from_settings(url, &ConnectionSettings::default())
    }

    pub fn from_settings(url: Url, settings: &ConnectionSettings) -> Self {
        Self {
            url,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_cap: Duration::from_millis(settings.backoff_cap_ms),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
            poor_latency: Duration::from_millis(settings.poor_latency_ms),
            bad_latency: Duration::from_millis(settings.bad_latency_ms),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Builder: set reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Builder: set backoff parameters.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Builder: set heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    fn classify(&self, latency: Duration) -> ConnectionQuality {
        ConnectionQuality::classify(
            latency.as_millis() as u64,
            self.poor_latency.as_millis() as u64,
            self.bad_latency.as_millis() as u64,
        )
    }
}

/// Something the session has to act on after a connection call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    /// State, attempts or quality changed.
    StatusChanged(ConnectionStatus),
    /// The socket opened; queued outbound messages can go out.
    Opened,
    /// Non-fatal, user-visible notice.
    Notice(NoticeLevel, String),
}

/// Where outgoing envelopes go. Implemented by [`ConnectionManager`].
pub trait Outlet {
    fn is_open(&self) -> bool;

    fn transmit(&mut self, envelope: &Envelope, now: Instant) -> Result<(), SendError>;
}

/// Owns the socket and drives the connection state machine.
pub struct ConnectionManager {
    config: ConnectionConfig,
    codec: EnvelopeCodec,
    connector: Box<dyn SocketConnector>,
    events: SocketEventSender,
    socket: Option<Box<dyn SocketHandle>>,
    generation: u64,
    state: ConnectionState,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    next_heartbeat_at: Option<Instant>,
    pending_ping: Option<(u64, Instant)>,
    last_ping_timestamp: u64,
    last_heartbeat_sent_at: Option<DateTime<Utc>>,
    latency: Option<Duration>,
    quality: ConnectionQuality,
    announce: Option<Envelope>,
    signals: Vec<ConnectionSignal>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url.as_str())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Box<dyn SocketConnector>,
        events: SocketEventSender,
    ) -> Self {
        Self {
            codec: EnvelopeCodec::with_max_message_size(config.max_message_size),
            config,
            connector,
            events,
            socket: None,
            generation: 0,
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            reconnect_at: None,
            next_heartbeat_at: None,
            pending_ping: None,
            last_ping_timestamp: 0,
            last_heartbeat_sent_at: None,
            latency: None,
            quality: ConnectionQuality::Good,
            announce: None,
            signals: Vec::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Generation of the current socket; events from other generations are
    /// ignored.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    pub fn last_heartbeat_sent_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_sent_at
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.next_heartbeat_at
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            latency_ms: self.latency.map(|l| l.as_millis() as u64),
            quality: self.quality,
        }
    }

    /// Sets the envelope announced on every open, typically a `user_join`
    /// for the local handle. Sent right away if already open.
    pub fn set_announce(&mut self, announce: Option<Envelope>, now: Instant) {
        self.announce = announce;
        if self.state == ConnectionState::Open {
            self.send_announce(now);
        }
    }

    /// Drains pending signals.
    pub fn take_signals(&mut self) -> Vec<ConnectionSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Earliest instant at which [`Self::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.next_heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -- transitions ------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Connection state changed");
            self.state = state;
        }
        self.signals.push(ConnectionSignal::StatusChanged(self.status()));
    }

    fn open_socket(&mut self) {
        self.generation += 1;
        self.reconnect_at = None;
        info!(
            url = %self.config.url,
            generation = self.generation,
            attempt = self.reconnect_attempts,
            "Connecting"
        );
        let socket = self
            .connector
            .open(&self.config.url, self.generation, self.events.clone());
        self.socket = Some(socket);
        self.set_state(ConnectionState::Connecting);
    }

    /// Drops the socket and bumps the generation so its late events are
    /// ignored.
    fn retire_socket(&mut self) {
        self.socket = None;
        self.generation += 1;
        self.stop_heartbeat();
    }

    fn stop_heartbeat(&mut self) {
        self.next_heartbeat_at = None;
        self.pending_ping = None;
    }

    /// Idle/Failed -> Connecting.
    pub fn connect(&mut self, _now: Instant) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Failed => {
                self.open_socket();
                Ok(())
            }
            state => Err(ConnectionError::invalid_state(state, "connect")),
        }
    }

    /// Resets the attempt counter, cancels any pending backoff and connects.
    pub fn manual_retry(&mut self, now: Instant) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Reconnecting | ConnectionState::Failed => {
                info!(attempts = self.reconnect_attempts, "Manual retry");
                self.reconnect_attempts = 0;
                self.reconnect_at = None;
                self.state = ConnectionState::Idle;
                self.connect(now)
            }
            state => Err(ConnectionError::invalid_state(state, "retry")),
        }
    }

    /// Open/Connecting -> Closing (normal close); Reconnecting -> Idle.
    pub fn disconnect(&mut self, _now: Instant) {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                self.stop_heartbeat();
                if let Some(socket) = self.socket.as_mut() {
                    socket.close(NORMAL_CLOSE_CODE, "client disconnect");
                }
                self.set_state(ConnectionState::Closing);
            }
            ConnectionState::Reconnecting => {
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.set_state(ConnectionState::Idle);
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Failed => {}
        }
    }

    /// Abnormal end of the current socket: schedule a reconnect or give up.
    fn fail(&mut self, now: Instant, error: &ConnectionError) {
        self.retire_socket();
        if self.reconnect_attempts < self.config.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            let delay = self.config.backoff_delay(self.reconnect_attempts);
            self.reconnect_at = Some(now + delay);
            warn!(
                error = %error,
                attempt = self.reconnect_attempts,
                max = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Connection lost, scheduling reconnect"
            );
            self.set_state(ConnectionState::Reconnecting);
        } else {
            self.reconnect_at = None;
            error!(
                error = %error,
                attempts = self.reconnect_attempts,
                "Reconnect attempts exhausted"
            );
            self.set_state(ConnectionState::Failed);
            self.signals.push(ConnectionSignal::Notice(
                NoticeLevel::Warning,
                format!(
                    "Connection failed after {} attempts; retry manually to reconnect",
                    self.reconnect_attempts
                ),
            ));
        }
    }

    /// Applies a socket event. Returns the decoded envelope for message
    /// events that pass validation.
    pub fn handle_event(&mut self, event: SocketEvent, now: Instant) -> Option<Envelope> {
        if event.generation != self.generation || self.socket.is_none() {
            trace!(
                generation = event.generation,
                current = self.generation,
                "Ignoring event from stale socket"
            );
            return None;
        }

        match event.kind {
            SocketEventKind::Opened => {
                if self.state != ConnectionState::Connecting {
                    debug!(state = %self.state, "Socket opened outside Connecting, ignoring");
                    return None;
                }
                self.reconnect_attempts = 0;
                self.reconnect_at = None;
                self.next_heartbeat_at = Some(now + self.config.heartbeat_interval);
                info!(url = %self.config.url, "Connected");
                self.set_state(ConnectionState::Open);
                self.signals.push(ConnectionSignal::Opened);
                self.send_announce(now);
                None
            }
            SocketEventKind::Message(bytes) => {
                if self.state != ConnectionState::Open {
                    debug!(state = %self.state, "Dropping frame received while not open");
                    return None;
                }
                match self.codec.decode(&bytes) {
                    Ok(envelope) => {
                        trace!(kind = %envelope.payload().type_name(), "Received envelope");
                        Some(envelope)
                    }
                    Err(e) => {
                        warn!(error = %e, bytes = bytes.len(), "Dropping invalid frame");
                        None
                    }
                }
            }
            SocketEventKind::Closed { code, reason } => {
                if self.state == ConnectionState::Closing || code == NORMAL_CLOSE_CODE {
                    info!(code, reason = %reason, "Connection closed");
                    self.socket = None;
                    self.stop_heartbeat();
                    self.set_state(ConnectionState::Idle);
                } else {
                    self.fail(now, &ConnectionError::AbnormalClose { code, reason });
                }
                None
            }
            SocketEventKind::Error(reason) => {
                if self.state == ConnectionState::Closing {
                    self.socket = None;
                    self.set_state(ConnectionState::Idle);
                } else {
                    self.fail(now, &ConnectionError::socket(reason));
                }
                None
            }
        }
    }

    /// Fires due reconnect and heartbeat deadlines.
    pub fn tick(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            if self.state == ConnectionState::Reconnecting {
                self.open_socket();
            }
        }
        if self.next_heartbeat_at.is_some_and(|at| at <= now) {
            self.next_heartbeat_at = None;
            if self.state == ConnectionState::Open {
                self.send_heartbeat(now);
            }
        }
    }

    fn send_heartbeat(&mut self, now: Instant) {
        let wall = Utc::now();
        let timestamp = (wall.timestamp_millis().max(0) as u64).max(self.last_ping_timestamp + 1);
        self.last_ping_timestamp = timestamp;
        self.next_heartbeat_at = Some(now + self.config.heartbeat_interval);
        match self.send(&Envelope::ping(timestamp), now) {
            Ok(()) => {
                trace!(timestamp, "Heartbeat sent");
                self.pending_ping = Some((timestamp, now));
                self.last_heartbeat_sent_at = Some(wall);
            }
            Err(e) => debug!(error = %e, "Heartbeat not sent"),
        }
    }

    fn send_announce(&mut self, now: Instant) {
        let Some(announce) = self.announce.clone() else {
            return;
        };
        if let Err(e) = self.send(&announce, now) {
            warn!(error = %e, "Failed to send announce");
        }
    }

    /// Records a pong; updates latency and quality when it answers the last
    /// heartbeat.
    pub fn record_pong(&mut self, timestamp: u64, now: Instant) {
        let Some((expected, sent_at)) = self.pending_ping else {
            trace!(timestamp, "Pong without pending heartbeat");
            return;
        };
        if expected != timestamp {
            trace!(timestamp, expected, "Pong for an older heartbeat");
            return;
        }
        self.pending_ping = None;
        let latency = now.saturating_duration_since(sent_at);
        let quality = self.config.classify(latency);
        self.latency = Some(latency);
        debug!(latency_ms = latency.as_millis() as u64, %quality, "Heartbeat round trip");
        if quality == ConnectionQuality::Bad {
            self.signals.push(ConnectionSignal::Notice(
                NoticeLevel::Warning,
                format!("Connection quality is bad ({} ms round trip)", latency.as_millis()),
            ));
        }
        self.quality = quality;
        self.signals.push(ConnectionSignal::StatusChanged(self.status()));
    }

    /// Encodes and sends one envelope.
    ///
    /// A socket failure while open is a connection error: the connection
    /// moves to `Reconnecting` and the error is returned to the caller.
    pub fn send(&mut self, envelope: &Envelope, now: Instant) -> Result<(), SendError> {
        if self.state != ConnectionState::Open {
            return Err(ConnectionError::invalid_state(self.state, "send").into());
        }
        let frame = self.codec.encode(envelope)?;
        let Some(socket) = self.socket.as_mut() else {
            return Err(ConnectionError::send("no socket").into());
        };
        if let Err(e) = socket.send(frame) {
            self.fail(now, &e);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Outlet for ConnectionManager {
    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    fn transmit(&mut self, envelope: &Envelope, now: Instant) -> Result<(), SendError> {
        self.send(envelope, now)
    }
}

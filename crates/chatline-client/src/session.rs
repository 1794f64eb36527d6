//! The session loop.
//!
//! A [`Session`] owns the store, the viewport, the connection, the outbound
//! queue and the router, and drives them from a single task. Socket events,
//! commands from a [`SessionHandle`] and component deadlines are processed
//! one at a time, so components never need locks.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use chatline_core::{
    ChatMessage, ConnectionState, ConnectionStatus, EventKind, ListenerId, NoticeLevel,
    RenderDelta, Snapshot, SnapshotStore, StateStore, StoreConfig, StoreEvent, ViewportConfig,
    ViewportWindow,
};
use chatline_protocol::Envelope;

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionSignal};
use crate::error::{ClientError, ClientResult, ConnectionError, SubmitError};
use crate::outbound::{OutboundConfig, OutboundQueue};
use crate::router::{RouteOutcome, Router, RouterConfig};
use crate::transport::{SocketConnector, SocketEvent};

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local user's handle. Required to submit messages.
    pub handle: Option<String>,
    /// Connect as soon as the loop starts.
    pub auto_connect: bool,
    pub connection: ConnectionConfig,
    pub outbound: OutboundConfig,
    pub store: StoreConfig,
    pub viewport: ViewportConfig,
    pub router: RouterConfig,
    /// Periodic snapshot interval; a snapshot is always taken on shutdown.
    pub snapshot_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            handle: None,
            auto_connect: true,
            connection: ConnectionConfig::new(url),
            outbound: OutboundConfig::default(),
            store: StoreConfig::default(),
            viewport: ViewportConfig::default(),
            router: RouterConfig::default(),
            snapshot_interval: None,
        }
    }

    /// Builder: set the local handle.
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// Builder: connect on start.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Builder: periodic snapshots.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }
}

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Submit {
        text: String,
        reply: oneshot::Sender<Result<String, SubmitError>>,
    },
    Typing {
        is_typing: bool,
    },
    Retry {
        id: String,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Connect {
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect,
    Scroll {
        top: f64,
        height: f64,
    },
    Resize {
        height: f64,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Shutdown,
}

type RenderListener = Box<dyn FnMut(&RenderDelta) + Send>;

/// One chat session over one logical connection.
pub struct Session {
    store: StateStore,
    viewport: ViewportWindow,
    connection: ConnectionManager,
    outbound: OutboundQueue,
    router: Router,
    snapshots: Option<Box<dyn SnapshotStore>>,
    snapshot_interval: Option<Duration>,
    next_snapshot_at: Option<Instant>,
    handle: Option<String>,
    auto_connect: bool,
    last_status: ConnectionStatus,
    render_listeners: Vec<RenderListener>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    command_tx: mpsc::Sender<SessionCommand>,
    command_rx: mpsc::Receiver<SessionCommand>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("connection", &self.connection)
            .field("messages", &self.store.len())
            .field("pending", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig, connector: Box<dyn SocketConnector>) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = config
            .handle
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());

        let mut connection = ConnectionManager::new(config.connection, connector, socket_tx);
        connection.set_announce(handle.as_deref().map(Envelope::user_join), Instant::now());
        let mut router = Router::new(config.router);
        router.set_self_handle(handle.clone());
        let last_status = connection.status();

        Self {
            store: StateStore::new(config.store),
            viewport: ViewportWindow::new(config.viewport),
            connection,
            outbound: OutboundQueue::new(config.outbound),
            router,
            snapshots: None,
            snapshot_interval: config.snapshot_interval,
            next_snapshot_at: None,
            handle,
            auto_connect: config.auto_connect,
            last_status,
            render_listeners: Vec::new(),
            socket_rx,
            command_tx,
            command_rx,
        }
    }

    /// Builder: restore from and save to `snapshots`.
    pub fn with_snapshot_store(mut self, snapshots: Box<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Subscribes to store events of one kind.
    pub fn on<F>(&mut self, kind: EventKind, callback: F) -> ListenerId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        self.store.on(kind, callback)
    }

    /// Subscribes to every store event.
    pub fn on_any<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        self.store.on_any(callback)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.store.off(id)
    }

    /// Subscribes to viewport changes.
    pub fn on_render<F>(&mut self, callback: F)
    where
        F: FnMut(&RenderDelta) + Send + 'static,
    {
        self.render_listeners.push(Box::new(callback));
    }

    /// Returns a handle for sending commands to the running session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn viewport(&self) -> &ViewportWindow {
        &self.viewport
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Runs the session until [`SessionHandle::shutdown`] is called.
    pub async fn run(mut self) {
        info!(
            url = %self.connection.config().url,
            handle = ?self.handle,
            "Session started"
        );
        let now = Instant::now();
        self.restore();
        if let Some(interval) = self.snapshot_interval
            && self.snapshots.is_some()
        {
            self.next_snapshot_at = Some(now + interval);
        }
        if self.auto_connect
            && let Err(e) = self.connection.connect(now)
        {
            warn!(error = %e, "Initial connect failed");
        }
        self.settle(now);

        loop {
            let deadline = self.next_deadline();
            trace!(?deadline, "Waiting for work");

            tokio::select! {
                Some(event) = self.socket_rx.recv() => {
                    self.handle_socket_event(event, Instant::now());
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown) | None => {
                            info!("Session stopping");
                            break;
                        }
                        Some(command) => self.handle_command(command, Instant::now()),
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick(Instant::now());
                }
            }

            self.settle(Instant::now());
        }

        self.shutdown(Instant::now());
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connection.next_deadline(),
            self.outbound.next_deadline(),
            self.router.next_deadline(),
            self.next_snapshot_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_socket_event(&mut self, event: SocketEvent, now: Instant) {
        if let Some(envelope) = self.connection.handle_event(event, now) {
            self.route(envelope, now);
        }
    }

    fn route(&mut self, envelope: Envelope, now: Instant) {
        let Some(outcome) = self.router.process(envelope, &mut self.store, now) else {
            return;
        };
        match outcome {
            RouteOutcome::Pong(timestamp) => self.connection.record_pong(timestamp, now),
            RouteOutcome::PingReceived(timestamp) => {
                if let Err(e) = self.connection.send(&Envelope::pong(timestamp), now) {
                    debug!(error = %e, "Pong not sent");
                }
            }
            RouteOutcome::Acked { id } => {
                if !self.outbound.acknowledge(&id, &mut self.store) {
                    trace!(id = %id, "Ack for untracked message");
                }
            }
            RouteOutcome::Duplicate { id } => {
                if self.store.message(&id).is_some_and(|m| m.is_self) {
                    self.outbound.acknowledge(&id, &mut self.store);
                }
            }
            RouteOutcome::Echo {
                handle,
                text,
                timestamp,
            } => {
                if self.outbound.acknowledge_echo(&text, &mut self.store).is_none() {
                    self.store.add_message(ChatMessage::received(
                        Uuid::new_v4().to_string(),
                        handle,
                        text,
                        timestamp,
                    ));
                }
            }
            RouteOutcome::ServerError {
                message,
                id: Some(id),
            } => {
                self.outbound.reject(&id, &message, &mut self.store);
            }
            RouteOutcome::Stored { .. }
            | RouteOutcome::Handled
            | RouteOutcome::ServerError { id: None, .. } => {}
        }
    }

    fn handle_command(&mut self, command: SessionCommand, now: Instant) {
        match command {
            SessionCommand::Submit { text, reply } => {
                let result = match self.handle.clone() {
                    Some(handle) => self.outbound.submit(
                        &text,
                        &handle,
                        &mut self.store,
                        &mut self.connection,
                        now,
                    ),
                    None => Err(SubmitError::EmptyHandle),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Typing { is_typing } => {
                if let Some(handle) = self.handle.as_deref()
                    && self.connection.state() == ConnectionState::Open
                    && let Err(e) = self
                        .connection
                        .send(&Envelope::typing(handle, is_typing), now)
                {
                    debug!(error = %e, "Typing indicator not sent");
                }
            }
            SessionCommand::Retry { id, reply } => {
                let result = self
                    .outbound
                    .retry(&id, &mut self.store, &mut self.connection, now);
                let _ = reply.send(result);
            }
            SessionCommand::Reconnect { reply } => {
                let _ = reply.send(self.connection.manual_retry(now));
            }
            SessionCommand::Connect { reply } => {
                let _ = reply.send(self.connection.connect(now));
            }
            SessionCommand::Disconnect => self.connection.disconnect(now),
            SessionCommand::Scroll { top, height } => {
                if let Some(delta) = self.viewport.on_scroll(top, height) {
                    self.render(&delta);
                }
            }
            SessionCommand::Resize { height } => {
                if let Some(delta) = self.viewport.on_resize(height) {
                    self.render(&delta);
                }
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.connection.status());
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn tick(&mut self, now: Instant) {
        self.connection.tick(now);
        self.outbound
            .tick(&mut self.store, &mut self.connection, now);
        self.router.tick(&mut self.store, now);
        if self.next_snapshot_at.is_some_and(|at| at <= now) {
            self.save_snapshot();
            self.next_snapshot_at = self.snapshot_interval.map(|interval| now + interval);
        }
    }

    /// Applies connection signals and brings the viewport up to date.
    fn settle(&mut self, now: Instant) {
        loop {
            let signals = self.connection.take_signals();
            if signals.is_empty() {
                break;
            }
            for signal in signals {
                match signal {
                    ConnectionSignal::StatusChanged(status) => {
                        if status != self.last_status {
                            self.last_status = status;
                            self.store.emit(StoreEvent::ConnectionStatusChanged(status));
                        }
                    }
                    ConnectionSignal::Opened => {
                        self.outbound
                            .resume(&mut self.store, &mut self.connection, now);
                    }
                    ConnectionSignal::Notice(level, text) => {
                        self.store.emit(StoreEvent::notice(level, text));
                    }
                }
            }
        }

        self.outbound.forget_evicted(&self.store);
        if let Some(delta) = self
            .viewport
            .sync(self.store.len(), self.store.evicted_total())
        {
            self.render(&delta);
        }
    }

    fn render(&mut self, delta: &RenderDelta) {
        for listener in &mut self.render_listeners {
            listener(delta);
        }
    }

    fn restore(&mut self) {
        let Some(snapshots) = self.snapshots.as_ref() else {
            return;
        };
        match snapshots.load_snapshot() {
            Ok(Some(snapshot)) => {
                let messages = snapshot.messages.len();
                self.store.add_messages(snapshot.messages);
                let pending = self
                    .outbound
                    .restore(snapshot.pending_outbound, &mut self.store);
                info!(messages, pending, "Session restored");
            }
            Ok(None) => debug!("No snapshot to restore"),
            Err(e) => {
                warn!(error = %e, "Failed to load snapshot");
                self.store.emit(StoreEvent::notice(
                    NoticeLevel::Warning,
                    format!("Previous session could not be restored: {e}"),
                ));
            }
        }
    }

    fn save_snapshot(&mut self) {
        let Some(snapshots) = self.snapshots.as_ref() else {
            return;
        };
        let snapshot = Snapshot::new(
            self.store.messages().cloned().collect(),
            self.outbound.pending_snapshot(),
        );
        if let Err(e) = snapshots.save_snapshot(&snapshot) {
            warn!(error = %e, "Failed to save snapshot");
        }
    }

    fn shutdown(&mut self, now: Instant) {
        if self.connection.state() == ConnectionState::Open
            && let Some(handle) = self.handle.as_deref()
            && let Err(e) = self.connection.send(&Envelope::user_leave(handle), now)
        {
            debug!(error = %e, "Leave not sent");
        }
        self.connection.disconnect(now);
        self.save_snapshot();
        info!(
            messages = self.store.len(),
            pending = self.outbound.len(),
            "Session stopped"
        );
    }
}

/// Cloneable handle for sending commands to a running [`Session`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> ClientResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| ClientError::SessionClosed)
    }

    /// Submits a chat message. Returns its id.
    pub async fn submit(&self, text: impl Into<String>) -> ClientResult<String> {
        let text = text.into();
        Ok(self
            .request(|reply| SessionCommand::Submit { text, reply })
            .await??)
    }

    pub async fn send_typing_indicator(&self, is_typing: bool) -> ClientResult<()> {
        self.send(SessionCommand::Typing { is_typing }).await
    }

    /// Retries a failed message.
    pub async fn retry_message(&self, id: impl Into<String>) -> ClientResult<()> {
        let id = id.into();
        Ok(self
            .request(|reply| SessionCommand::Retry { id, reply })
            .await??)
    }

    /// Manual reconnect with a fresh attempt budget.
    pub async fn reconnect(&self) -> ClientResult<()> {
        Ok(self
            .request(|reply| SessionCommand::Reconnect { reply })
            .await??)
    }

    pub async fn connect(&self) -> ClientResult<()> {
        Ok(self
            .request(|reply| SessionCommand::Connect { reply })
            .await??)
    }

    pub async fn disconnect(&self) -> ClientResult<()> {
        self.send(SessionCommand::Disconnect).await
    }

    pub async fn scroll(&self, top: f64, height: f64) -> ClientResult<()> {
        self.send(SessionCommand::Scroll { top, height }).await
    }

    pub async fn resize(&self, height: f64) -> ClientResult<()> {
        self.send(SessionCommand::Resize { height }).await
    }

    pub async fn status(&self) -> ClientResult<ConnectionStatus> {
        self.request(|reply| SessionCommand::Status { reply }).await
    }

    /// Stops the session loop. A snapshot is saved on the way out.
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.send(SessionCommand::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chatline_core::{ChatMessage, DeliveryStatus, MemorySnapshotStore};
    use chrono::Utc;

    use super::*;
    use crate::transport::{ABNORMAL_CLOSE_CODE, MemoryServer};

    fn config() -> SessionConfig {
        SessionConfig::new(Url::parse("ws://chat.test/ws").unwrap()).with_handle("me")
    }

    /// Lets the session task drain everything that is ready.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn frames_of_type(server: &MemoryServer, kind: &str) -> Vec<serde_json::Value> {
        server
            .sent_frames()
            .iter()
            .map(|f| serde_json::from_str::<serde_json::Value>(f).unwrap())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    fn record_statuses(session: &mut Session) -> Arc<Mutex<Vec<(String, DeliveryStatus)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        session.on_any(move |event| {
            let message = match event {
                StoreEvent::MessageAdded { message, .. } => message,
                StoreEvent::MessageUpdated { message, .. } => message,
                _ => return,
            };
            if message.is_self {
                sink.lock()
                    .unwrap()
                    .push((message.text.clone(), message.delivery_status));
            }
        });
        log
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_go_out_in_order_once_open() {
        let server = MemoryServer::new();
        server.set_auto_accept(false);
        let mut session = Session::new(config(), Box::new(server.connector()));
        let statuses = record_statuses(&mut session);
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        let first = handle.submit("one").await.unwrap();
        handle.submit("two").await.unwrap();
        settle().await;
        assert!(server.sent_frames().is_empty());

        server.accept();
        settle().await;

        let chats = frames_of_type(&server, "chat");
        let texts: Vec<&str> = chats.iter().filter_map(|c| c["text"].as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(frames_of_type(&server, "user_join").len(), 1);

        server.push(format!(r#"{{"type":"ack","id":"{first}"}}"#));
        settle().await;

        use DeliveryStatus::*;
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ("one".to_string(), Queued),
                ("two".to_string(), Queued),
                ("one".to_string(), Sending),
                ("one".to_string(), Sent),
                ("two".to_string(), Sending),
                ("two".to_string(), Sent),
                ("one".to_string(), Acked),
            ]
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn echo_of_own_message_acknowledges_it() {
        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()));
        let statuses = record_statuses(&mut session);
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;

        let id = handle.submit("hello").await.unwrap();
        server.push(format!(
            r#"{{"type":"chat","handle":"me","text":"hello","id":"{id}"}}"#
        ));
        settle().await;

        let last = statuses.lock().unwrap().last().cloned();
        assert_eq!(last, Some(("hello".to_string(), DeliveryStatus::Acked)));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_abnormal_close_and_announces_again() {
        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()));
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        session.on(EventKind::ConnectionStatusChanged, move |event| {
            if let StoreEvent::ConnectionStatusChanged(status) = event {
                sink.lock().unwrap().push(status.state);
            }
        });
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;

        server.drop_connection(ABNORMAL_CLOSE_CODE, "network");
        settle().await;
        assert_eq!(
            handle.status().await.unwrap().state,
            ConnectionState::Reconnecting
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(server.connection_count(), 2);
        assert_eq!(frames_of_type(&server, "user_join").len(), 2);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
                ConnectionState::Open,
            ]
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_sent_again_after_reconnect() {
        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()));
        let statuses = record_statuses(&mut session);
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;

        let id = handle.submit("still there?").await.unwrap();
        settle().await;
        assert_eq!(frames_of_type(&server, "chat").len(), 1);

        server.drop_connection(ABNORMAL_CLOSE_CODE, "network");
        settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;

        let chats = frames_of_type(&server, "chat");
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[1]["id"], id.as_str());
        assert_eq!(chats[1]["text"], "still there?");
        assert_eq!(
            statuses.lock().unwrap().last().cloned(),
            Some(("still there?".to_string(), DeliveryStatus::Sent))
        );

        server.push(format!(r#"{{"type":"ack","id":"{id}"}}"#));
        settle().await;
        assert_eq!(
            statuses.lock().unwrap().last().cloned(),
            Some(("still there?".to_string(), DeliveryStatus::Acked))
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn echo_without_id_acknowledges_instead_of_duplicating() {
        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()));
        let statuses = record_statuses(&mut session);
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&added);
        session.on(EventKind::MessageAdded, move |event| {
            if let StoreEvent::MessageAdded { message, .. } = event {
                sink.lock()
                    .unwrap()
                    .push((message.text.clone(), message.is_self));
            }
        });
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;

        handle.submit("hello").await.unwrap();
        settle().await;
        server.push(r#"{"type":"chat","handle":"me","text":"hello"}"#);
        settle().await;

        assert_eq!(
            statuses.lock().unwrap().last().cloned(),
            Some(("hello".to_string(), DeliveryStatus::Acked))
        );

        server.push(r#"{"type":"chat","handle":"me","text":"typed elsewhere"}"#);
        settle().await;
        assert_eq!(
            *added.lock().unwrap(),
            vec![
                ("hello".to_string(), true),
                ("typed elsewhere".to_string(), false),
            ]
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn answers_server_ping() {
        let server = MemoryServer::new();
        let session = Session::new(config(), Box::new(server.connector()));
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;

        server.push(r#"{"type":"ping","timestamp":1234}"#);
        settle().await;

        let pongs = frames_of_type(&server, "pong");
        assert_eq!(pongs.len(), 1);
        assert_eq!(pongs[0]["timestamp"], 1234);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_messages_survive_restart() {
        let server = MemoryServer::new();
        server.set_auto_accept(false);
        let snapshots = Arc::new(MemorySnapshotStore::new());

        let session = Session::new(config(), Box::new(server.connector()))
            .with_snapshot_store(Box::new(Arc::clone(&snapshots)));
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        handle.submit("offline note").await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let saved = snapshots.load_snapshot().unwrap().unwrap();
        assert_eq!(saved.pending_outbound.len(), 1);
        assert_eq!(saved.messages.len(), 1);

        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()))
            .with_snapshot_store(Box::new(Arc::clone(&snapshots)));
        let statuses = record_statuses(&mut session);
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;

        let chats = frames_of_type(&server, "chat");
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0]["text"], "offline note");
        assert_eq!(
            statuses.lock().unwrap().last().cloned(),
            Some(("offline note".to_string(), DeliveryStatus::Sent))
        );

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn viewport_follows_new_messages() {
        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()));
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        session.on_render(move |delta| sink.lock().unwrap().push((delta.start, delta.end)));
        let handle = session.handle();
        let task = tokio::spawn(session.run());
        settle().await;
        handle.resize(480.0).await.unwrap();

        for i in 0..30 {
            server.push(format!(
                r#"{{"type":"chat","handle":"bob","text":"line {i}","id":"b{i}"}}"#
            ));
        }
        settle().await;

        let last = deltas.lock().unwrap().last().copied();
        let (start, end) = last.unwrap();
        assert_eq!(end, 30);
        assert!(start > 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn submit_without_handle_is_rejected() {
        let server = MemoryServer::new();
        let config = SessionConfig::new(Url::parse("ws://chat.test/ws").unwrap());
        let session = Session::new(config, Box::new(server.connector()));
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        let err = handle.submit("hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Submit(SubmitError::EmptyHandle)));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(handle.status().await.is_err());
    }

    #[test]
    fn restore_keeps_failed_messages_failed() {
        let mut failed = ChatMessage::outgoing("f1", "me", "lost", Utc::now());
        failed.delivery_status = DeliveryStatus::Failed;
        let snapshot = Snapshot::new(vec![failed.clone()], vec![failed]);
        let server = MemoryServer::new();
        let mut session = Session::new(config(), Box::new(server.connector()))
            .with_snapshot_store(Box::new(MemorySnapshotStore::with_snapshot(snapshot)));

        session.restore();

        assert_eq!(
            session.store().message("f1").unwrap().delivery_status,
            DeliveryStatus::Failed
        );
        assert_eq!(session.outbound.len(), 1);
    }
}

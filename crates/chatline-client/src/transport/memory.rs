//! In-process loopback socket for tests and demos.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;
use url::Url;

use super::{SocketConnector, SocketEvent, SocketEventKind, SocketEventSender, SocketHandle};
use crate::error::ConnectionError;

#[derive(Debug)]
struct MemoryConnection {
    generation: u64,
    events: SocketEventSender,
    open: bool,
}

#[derive(Debug)]
struct MemoryState {
    auto_accept: bool,
    connections: Vec<MemoryConnection>,
    sent: Vec<String>,
    failing_sends: usize,
}

/// The server side of an in-process socket.
///
/// Every socket opened through [`MemoryServer::connector`] shows up here.
/// Test code drives it: accept or refuse connections, push frames, drop the
/// connection, and inspect what the client sent.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// Creates a server that accepts every connection immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                auto_accept: true,
                connections: Vec::new(),
                sent: Vec::new(),
                failing_sends: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// When false, new sockets stay connecting until [`Self::accept`] or
    /// [`Self::refuse`].
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.lock().auto_accept = auto_accept;
    }

    /// Number of sockets opened so far.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connections.last().is_some_and(|c| c.open)
    }

    /// Opens the most recent socket.
    pub fn accept(&self) -> bool {
        let mut state = self.lock();
        let Some(conn) = state.connections.last_mut() else {
            return false;
        };
        conn.open = true;
        conn.events
            .send(SocketEvent::new(conn.generation, SocketEventKind::Opened))
            .is_ok()
    }

    /// Fails the most recent socket with an error.
    pub fn refuse(&self, reason: &str) -> bool {
        let mut state = self.lock();
        let Some(conn) = state.connections.last_mut() else {
            return false;
        };
        conn.open = false;
        conn.events
            .send(SocketEvent::new(
                conn.generation,
                SocketEventKind::Error(reason.to_string()),
            ))
            .is_ok()
    }

    /// Delivers a frame to the client on the current socket.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        let state = self.lock();
        let Some(conn) = state.connections.last().filter(|c| c.open) else {
            return false;
        };
        conn.events
            .send(SocketEvent::new(
                conn.generation,
                SocketEventKind::Message(frame.into().into_bytes()),
            ))
            .is_ok()
    }

    /// Closes the current socket from the server side.
    pub fn drop_connection(&self, code: u16, reason: &str) -> bool {
        let mut state = self.lock();
        let Some(conn) = state.connections.last_mut().filter(|c| c.open) else {
            return false;
        };
        conn.open = false;
        conn.events
            .send(SocketEvent::new(
                conn.generation,
                SocketEventKind::Closed {
                    code,
                    reason: reason.to_string(),
                },
            ))
            .is_ok()
    }

    /// Makes the next `count` client sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    /// Every frame the client sent, oldest first.
    pub fn sent_frames(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Returns and clears the frames the client sent.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().sent)
    }
}

/// Connector producing sockets attached to a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl SocketConnector for MemoryConnector {
    fn open(&self, url: &Url, generation: u64, events: SocketEventSender) -> Box<dyn SocketHandle> {
        let mut state = self.server.lock();
        trace!(url = %url, generation, "Opening in-memory socket");
        let open = state.auto_accept;
        if open {
            let _ = events.send(SocketEvent::new(generation, SocketEventKind::Opened));
        }
        state.connections.push(MemoryConnection {
            generation,
            events,
            open,
        });
        Box::new(MemoryHandle {
            server: self.server.clone(),
            generation,
        })
    }
}

struct MemoryHandle {
    server: MemoryServer,
    generation: u64,
}

impl SocketHandle for MemoryHandle {
    fn send(&mut self, frame: String) -> Result<(), ConnectionError> {
        let mut state = self.server.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(ConnectionError::send("injected send failure"));
        }
        let open = state
            .connections
            .iter()
            .any(|c| c.generation == self.generation && c.open);
        if !open {
            return Err(ConnectionError::send("socket is not open"));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut state = self.server.lock();
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.generation == self.generation)
        {
            conn.open = false;
            let _ = conn.events.send(SocketEvent::new(
                self.generation,
                SocketEventKind::Closed {
                    code,
                    reason: reason.to_string(),
                },
            ));
        }
    }
}

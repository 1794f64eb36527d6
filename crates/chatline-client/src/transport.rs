//! Socket primitives used by the connection manager.
//!
//! A [`SocketConnector`] opens one socket per connection attempt and reports
//! everything that happens to it as [`SocketEvent`]s on a channel. Events
//! carry the generation they were opened with, so the connection manager
//! can ignore events from sockets it has already given up on.
//!
//! [`WsConnector`] speaks WebSocket via `tokio-tungstenite`. With the
//! `testing` feature (and in this crate's tests) `MemoryServer` provides an
//! in-process loopback.

use std::borrow::Cow;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::ConnectionError;

#[cfg(any(test, feature = "testing"))]
mod memory;
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryConnector, MemoryServer};

/// Close code reported when a socket ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// What happened to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    Opened,
    Message(Vec<u8>),
    Closed { code: u16, reason: String },
    Error(String),
}

/// A socket event tagged with the generation of the socket that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    pub generation: u64,
    pub kind: SocketEventKind,
}

impl SocketEvent {
    pub fn new(generation: u64, kind: SocketEventKind) -> Self {
        Self { generation, kind }
    }
}

/// Channel on which sockets report events.
pub type SocketEventSender = mpsc::UnboundedSender<SocketEvent>;

/// Opens sockets.
pub trait SocketConnector: Send {
    /// Starts opening a socket to `url`.
    ///
    /// The outcome arrives on `events`: `Opened` on success, `Error` or
    /// `Closed` otherwise.
    fn open(&self, url: &Url, generation: u64, events: SocketEventSender) -> Box<dyn SocketHandle>;
}

/// The sending half of an open (or opening) socket.
///
/// Dropping the handle abandons the socket without further events.
pub trait SocketHandle: Send {
    fn send(&mut self, frame: String) -> Result<(), ConnectionError>;

    /// Starts a close handshake. A `Closed` event follows.
    fn close(&mut self, code: u16, reason: &str);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

enum Outgoing {
    Frame(String),
    Close { code: u16, reason: String },
}

/// Opens WebSocket connections with `tokio-tungstenite`.
///
/// Must be used from within a Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SocketConnector for WsConnector {
    fn open(&self, url: &Url, generation: u64, events: SocketEventSender) -> Box<dyn SocketHandle> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_websocket(url.clone(), generation, out_rx, events));
        Box::new(WsHandle { out_tx })
    }
}

struct WsHandle {
    out_tx: mpsc::UnboundedSender<Outgoing>,
}

impl SocketHandle for WsHandle {
    fn send(&mut self, frame: String) -> Result<(), ConnectionError> {
        self.out_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| ConnectionError::send("socket task has stopped"))
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.out_tx.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

async fn run_websocket(
    url: Url,
    generation: u64,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: SocketEventSender,
) {
    let emit = |kind| {
        let _ = events.send(SocketEvent::new(generation, kind));
    };

    debug!(url = %url, generation, "Opening WebSocket");
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            emit(SocketEventKind::Error(format!("failed to connect to {url}: {e}")));
            return;
        }
    };
    emit(SocketEventKind::Opened);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(Outgoing::Frame(frame)) => {
                    trace!(generation, bytes = frame.len(), "Sending frame");
                    if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                        emit(SocketEventKind::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason.clone()),
                    };
                    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                        debug!(generation, error = %e, "Close frame not sent");
                    }
                    emit(SocketEventKind::Closed { code, reason });
                    break;
                }
                // Handle dropped: the connection manager moved on.
                None => break,
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => emit(SocketEventKind::Message(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => emit(SocketEventKind::Message(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((ABNORMAL_CLOSE_CODE, String::new()));
                    emit(SocketEventKind::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {} // WebSocket-level ping/pong
                Some(Err(e)) => {
                    warn!(generation, error = %e, "WebSocket error");
                    emit(SocketEventKind::Error(e.to_string()));
                    break;
                }
                None => {
                    emit(SocketEventKind::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            },
        }
    }
    debug!(generation, "WebSocket task finished");
}

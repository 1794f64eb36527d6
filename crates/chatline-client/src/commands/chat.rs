//! Interactive chat on stdin/stdout.

use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use chatline_core::{
    ConnectionState, ConnectionStatus, FileSnapshotStore, MessageKind, NoticeLevel, StoreEvent,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::session::{Session, SessionHandle};
use crate::transport::WsConnector;

const HELP: &str = "\
Commands:
  /retry <id>   resend a failed message
  /reconnect    reconnect with a fresh attempt budget
  /connect      go online
  /disconnect   go offline
  /status       show connection status
  /quit         leave the chat
Start a message with // to send a literal leading slash.";

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Retry(String),
    Reconnect,
    Connect,
    Disconnect,
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

/// Parses a line typed at the prompt.
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if let Some(escaped) = line.strip_prefix("//") {
        return Input::Message(format!("/{escaped}"));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("retry", id) if !id.is_empty() => Input::Retry(id.to_string()),
        ("reconnect", _) => Input::Reconnect,
        ("connect", _) => Input::Connect,
        ("disconnect", _) => Input::Disconnect,
        ("status", _) => Input::Status,
        ("help" | "?", _) => Input::Help,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Formats a store event for the terminal. Events a reader does not need to
/// see return `None`.
pub fn render_event(event: &StoreEvent) -> Option<String> {
    match event {
        StoreEvent::MessageAdded { message, .. } => {
            let time = message.timestamp.with_timezone(&Local).format("%H:%M");
            Some(match message.kind {
                MessageKind::Chat if message.is_self => format!(
                    "[{time}] <{}> {} ({})",
                    message.sender_handle, message.text, message.delivery_status
                ),
                MessageKind::Chat => {
                    format!("[{time}] <{}> {}", message.sender_handle, message.text)
                }
                MessageKind::System | MessageKind::Join | MessageKind::Leave => {
                    format!("[{time}] * {}", message.text)
                }
            })
        }
        StoreEvent::DeliveryFailed {
            id,
            attempts,
            reason,
        } => Some(format!(
            "!! message not delivered after {attempts} attempt(s): {reason}. Type /retry {id}"
        )),
        StoreEvent::ConnectionStatusChanged(status) => {
            Some(format!("-- {}", format_status(status)))
        }
        StoreEvent::TypingChanged {
            handle,
            is_typing: true,
        } => Some(format!("-- {handle} is typing")),
        StoreEvent::Notice {
            level: NoticeLevel::Info,
            text,
        } => Some(format!("-- {text}")),
        StoreEvent::Notice {
            level: NoticeLevel::Warning,
            text,
        } => Some(format!("!! {text}")),
        _ => None,
    }
}

/// One-line connection summary.
pub fn format_status(status: &ConnectionStatus) -> String {
    match status.state {
        ConnectionState::Reconnecting => format!(
            "reconnecting (attempt {}/{})",
            status.reconnect_attempts, status.max_reconnect_attempts
        ),
        ConnectionState::Open => match status.latency_ms {
            Some(ms) => format!("open, latency {ms}ms ({})", status.quality),
            None => "open".to_string(),
        },
        state => state.to_string(),
    }
}

/// Runs the chat until `/quit`, end of input or Ctrl-C.
pub async fn run(config: &ClientConfig) -> ClientResult<()> {
    let session_config = config.to_session_config()?;
    let Some(me) = session_config.handle.clone() else {
        return Err(ClientError::config(
            "no handle configured; set [identity] handle or pass --handle",
        ));
    };
    let url = session_config.connection.url.clone();

    let mut session = Session::new(session_config, Box::new(WsConnector::new()));
    if let Some(path) = config.snapshot_path() {
        debug!(path = %path.display(), "Using snapshot file");
        session = session.with_snapshot_store(Box::new(FileSnapshotStore::new(path)));
    }
    session.on_any(|event| {
        if let Some(line) = render_event(event) {
            println!("{line}");
        }
    });

    let handle = session.handle();
    let task = tokio::spawn(session.run());
    println!("chatline: {me} on {url}. Type /help for commands.");

    let result = input_loop(&handle).await;

    if let Err(e) = handle.shutdown().await {
        debug!(error = %e, "Session already stopped");
    }
    if let Err(e) = task.await {
        warn!(error = %e, "Session task ended abnormally");
    }
    result
}

async fn input_loop(handle: &SessionHandle) -> ClientResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let outcome = match parse_input(&line) {
            Input::Empty => Ok(()),
            Input::Quit => return Ok(()),
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Unknown(command) => {
                println!("!! unknown command {command}, type /help");
                Ok(())
            }
            Input::Message(text) => handle.submit(text).await.map(|_| ()),
            Input::Retry(id) => handle.retry_message(id).await,
            Input::Reconnect => handle.reconnect().await,
            Input::Connect => handle.connect().await,
            Input::Disconnect => handle.disconnect().await,
            Input::Status => handle.status().await.map(|status| {
                println!("-- {}", format_status(&status));
            }),
        };
        match outcome {
            Err(ClientError::SessionClosed) => return Err(ClientError::SessionClosed),
            Err(e) => println!("!! {e}"),
            Ok(()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use chatline_core::{ChatMessage, ConnectionQuality, DeliveryStatus};
    use chrono::Utc;

    use super::*;

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(parse_input("  hello  "), Input::Message("hello".into()));
        assert_eq!(parse_input("//shrug"), Input::Message("/shrug".into()));
        assert_eq!(parse_input("/retry abc-1"), Input::Retry("abc-1".into()));
        assert_eq!(parse_input("/retry"), Input::Unknown("/retry".into()));
        assert_eq!(parse_input("/reconnect"), Input::Reconnect);
        assert_eq!(parse_input("/status"), Input::Status);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input("/dance"), Input::Unknown("/dance".into()));
    }

    #[test]
    fn renders_own_message_with_status() {
        let mut message = ChatMessage::received("m1", "me", "hi", Utc::now());
        message.is_self = true;
        message.delivery_status = DeliveryStatus::Queued;
        let line = render_event(&StoreEvent::MessageAdded {
            message,
            index: 0,
            total: 1,
        })
        .unwrap();
        assert!(line.ends_with("<me> hi (queued)"), "{line}");
    }

    #[test]
    fn renders_failures_and_notices() {
        let line = render_event(&StoreEvent::DeliveryFailed {
            id: "m1".into(),
            attempts: 3,
            reason: "socket error".into(),
        })
        .unwrap();
        assert!(line.contains("/retry m1"));

        let line = render_event(&StoreEvent::notice(NoticeLevel::Warning, "slow")).unwrap();
        assert_eq!(line, "!! slow");

        assert!(
            render_event(&StoreEvent::TypingChanged {
                handle: "bob".into(),
                is_typing: false,
            })
            .is_none()
        );
    }

    #[test]
    fn status_summary() {
        let status = ConnectionStatus {
            state: ConnectionState::Reconnecting,
            reconnect_attempts: 2,
            max_reconnect_attempts: 5,
            latency_ms: None,
            quality: ConnectionQuality::Good,
        };
        assert_eq!(format_status(&status), "reconnecting (attempt 2/5)");

        let status = ConnectionStatus {
            state: ConnectionState::Open,
            latency_ms: Some(40),
            ..status
        };
        assert_eq!(format_status(&status), "open, latency 40ms (good)");
    }
}

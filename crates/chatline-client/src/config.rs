//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/chatline/config.toml` by default. Every section is optional
//! and falls back to its defaults.
//!
//! ```toml
//! [server]
//! url = "https://chat.example.com"
//!
//! [identity]
//! handle = "alice"
//!
//! [connection]
//! max_reconnect_attempts = 5
//!
//! [delivery]
//! max_retries = 3
//!
//! [snapshot]
//! interval_secs = 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use chatline_core::{StoreConfig, ViewportConfig};
use chatline_protocol::ENDPOINT_PATH;

use crate::connection::{ConnectionConfig, ConnectionSettings};
use crate::error::{ClientError, ClientResult};
use crate::outbound::OutboundConfig;
use crate::router::RouterConfig;
use crate::session::SessionConfig;

/// Default server address when neither the config file nor the command line
/// name one.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the chatline client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address.
    pub server: ServerSettings,

    /// Local user.
    pub identity: IdentitySettings,

    /// Reconnect and heartbeat tuning.
    pub connection: ConnectionSettings,

    /// Outgoing message retries.
    pub delivery: OutboundConfig,

    /// Message history limits.
    pub store: StoreConfig,

    /// Virtual scrolling.
    pub viewport: ViewportConfig,

    /// Presence grace period.
    pub presence: RouterConfig,

    /// Session restore.
    pub snapshot: SnapshotSettings,
}

/// Server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// `ws(s)://` or `http(s)://` address of the chat server.
    pub url: Option<String>,

    /// Connect as soon as the client starts.
    pub auto_connect: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: None,
            auto_connect: true,
        }
    }
}

/// Identity settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Handle announced to the server and attached to outgoing messages.
    pub handle: Option<String>,
}

/// Snapshot settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    /// Save and restore the session at all.
    pub enabled: bool,

    /// Snapshot file; defaults to `session.json` in the data directory.
    pub path: Option<PathBuf>,

    /// Seconds between periodic saves. `0` saves only on shutdown.
    pub interval_secs: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            interval_secs: 60,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parses configuration from TOML text.
    pub fn parse(content: &str) -> ClientResult<Self> {
        toml::from_str(content)
            .map_err(|e| ClientError::config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatline")
    }

    /// Returns the default data directory path.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatline")
    }

    /// Where the session snapshot is written, or `None` when disabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if !self.snapshot.enabled {
            return None;
        }
        Some(
            self.snapshot
                .path
                .clone()
                .unwrap_or_else(|| Self::default_data_dir().join("session.json")),
        )
    }

    /// Resolved WebSocket endpoint.
    pub fn endpoint_url(&self) -> ClientResult<Url> {
        endpoint_url(self.server.url.as_deref().unwrap_or(DEFAULT_SERVER_URL))
    }

    /// Builds the session configuration.
    pub fn to_session_config(&self) -> ClientResult<SessionConfig> {
        let url = self.endpoint_url()?;
        let mut config =
            SessionConfig::new(url.clone()).with_auto_connect(self.server.auto_connect);
        config.connection = ConnectionConfig::from_settings(url, &self.connection);
        config.outbound = self.delivery.clone();
        config.store = self.store.clone();
        config.viewport = self.viewport.clone();
        config.router = self.presence.clone();

        if let Some(handle) = self.identity.handle.as_deref().map(str::trim)
            && !handle.is_empty()
        {
            config = config.with_handle(handle);
        }
        if self.snapshot.enabled && self.snapshot.interval_secs > 0 {
            config =
                config.with_snapshot_interval(Duration::from_secs(self.snapshot.interval_secs));
        }
        Ok(config)
    }
}

/// Maps a server address to its WebSocket endpoint.
///
/// `http` becomes `ws` and `https` becomes `wss`. A bare host gets the
/// `/ws` path.
pub fn endpoint_url(raw: &str) -> ClientResult<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| ClientError::config(format!("invalid server url {raw:?}: {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ClientError::config(format!(
                "unsupported url scheme {other:?}, expected ws, wss, http or https"
            )));
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| ClientError::config(format!("cannot use {scheme} for {raw:?}")))?;
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(ENDPOINT_PATH);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ClientConfig::parse("").unwrap();
        assert!(config.server.url.is_none());
        assert!(config.identity.handle.is_none());
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.store.max_messages, 1000);
        assert_eq!(config.presence.leave_grace_secs, 30);
        assert!(config.snapshot.enabled);
        assert_eq!(config.endpoint_url().unwrap().as_str(), DEFAULT_SERVER_URL);
    }

    #[test]
    fn sections_override_defaults() {
        let config = ClientConfig::parse(
            r#"
[server]
url = "https://chat.example.com"

[identity]
handle = "alice"

[connection]
max_reconnect_attempts = 8
backoff_base_ms = 500

[delivery]
max_retries = 1
await_ack = false

[store]
max_messages = 200

[presence]
leave_grace_secs = 5

[snapshot]
interval_secs = 0
"#,
        )
        .unwrap();

        let session = config.to_session_config().unwrap();
        assert_eq!(session.handle.as_deref(), Some("alice"));
        assert_eq!(session.connection.url.as_str(), "wss://chat.example.com/ws");
        assert_eq!(session.connection.max_reconnect_attempts, 8);
        assert_eq!(session.connection.backoff_base, Duration::from_millis(500));
        assert_eq!(session.outbound.max_retries, 1);
        assert!(!session.outbound.await_ack);
        assert_eq!(session.store.max_messages, 200);
        assert_eq!(session.router.leave_grace_secs, 5);
        assert!(session.snapshot_interval.is_none());
    }

    #[test]
    fn blank_handle_is_ignored() {
        let config = ClientConfig::parse("[identity]\nhandle = \"  \"\n").unwrap();
        assert!(config.to_session_config().unwrap().handle.is_none());
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        let err = ClientConfig::parse("[connection]\nmax_reconnect_attempts = \"five\"\n")
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn endpoint_url_mapping() {
        assert_eq!(
            endpoint_url("http://localhost:3000").unwrap().as_str(),
            "ws://localhost:3000/ws"
        );
        assert_eq!(
            endpoint_url("https://chat.example.com/").unwrap().as_str(),
            "wss://chat.example.com/ws"
        );
        assert_eq!(
            endpoint_url("wss://chat.example.com/rooms/main").unwrap().as_str(),
            "wss://chat.example.com/rooms/main"
        );
        assert!(endpoint_url("ftp://example.com").is_err());
        assert!(endpoint_url("not a url").is_err());
    }

    #[test]
    fn snapshot_path_follows_settings() {
        let mut config = ClientConfig::default();
        assert!(config.snapshot_path().unwrap().ends_with("chatline/session.json"));

        config.snapshot.path = Some(PathBuf::from("/tmp/chat.json"));
        assert_eq!(config.snapshot_path(), Some(PathBuf::from("/tmp/chat.json")));

        config.snapshot.enabled = false;
        assert!(config.snapshot_path().is_none());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[identity]\nhandle = \"bob\"\n").unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.identity.handle.as_deref(), Some("bob"));

        let missing = dir.path().join("missing.toml");
        assert!(ClientConfig::load_from(&missing).is_err());
    }
}

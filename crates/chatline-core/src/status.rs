//! Read-only view of the connection, as published to observers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    /// Reconnect attempts exhausted; only a manual retry leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link quality derived from the last heartbeat round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Good,
    Poor,
    Bad,
}

impl ConnectionQuality {
    /// Classifies a round trip against the poor/bad thresholds.
    pub fn classify(latency_ms: u64, poor_ms: u64, bad_ms: u64) -> Self {
        if latency_ms >= bad_ms {
            Self::Bad
        } else if latency_ms >= poor_ms {
            Self::Poor
        } else {
            Self::Good
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Bad => "bad",
        };
        f.write_str(s)
    }
}

/// Snapshot of the connection published with `ConnectionStatusChanged`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub latency_ms: Option<u64>,
    pub quality: ConnectionQuality,
}

//! Best-effort session snapshots.
//!
//! A snapshot keeps the retained messages and the outgoing messages that
//! were not yet delivered, so a restarted client can show the same history
//! and resend what was pending.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SnapshotError;
use crate::model::ChatMessage;

/// Current on-disk format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    /// Own messages still waiting for delivery, oldest first.
    #[serde(default)]
    pub pending_outbound: Vec<ChatMessage>,
}

impl Snapshot {
    pub fn new(messages: Vec<ChatMessage>, pending_outbound: Vec<ChatMessage>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            messages,
            pending_outbound,
        }
    }
}

/// Durable storage for one snapshot.
pub trait SnapshotStore: Send {
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Returns `None` when nothing was saved yet.
    fn load_snapshot(&self) -> Result<Option<Snapshot>, SnapshotError>;
}

impl<S: SnapshotStore + Sync> SnapshotStore for Arc<S> {
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        (**self).save_snapshot(snapshot)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, SnapshotError> {
        (**self).load_snapshot()
    }
}

/// Snapshot kept as a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SnapshotError::io(parent, e))?;
        }

        // Write to temp file first, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string(snapshot)?;
        fs::write(&temp_path, content).map_err(|e| SnapshotError::io(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| SnapshotError::io(&self.path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&self.path, perms);
        }

        debug!(
            path = %self.path.display(),
            messages = snapshot.messages.len(),
            pending = snapshot.pending_outbound.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, SnapshotError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No snapshot file");
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| SnapshotError::io(&self.path, e))?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        info!(
            path = %self.path.display(),
            messages = snapshot.messages.len(),
            "Loaded snapshot"
        );
        Ok(Some(snapshot))
    }
}

/// In-process snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone())
    }
}

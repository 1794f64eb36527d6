//! Core types: users, messages, the state store, the viewport window and
//! snapshots

pub mod error;
pub mod events;
pub mod model;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod tracing;
pub mod viewport;

pub use error::SnapshotError;
pub use events::{BusEvent, EventBus, EventKind, ListenerId, NoticeLevel, StoreEvent};
pub use model::{
    ChatMessage, DeliveryStatus, MessageKind, Presence, User, UserId, extract_mentions,
};
pub use snapshot::{
    FileSnapshotStore, MemorySnapshotStore, SNAPSHOT_VERSION, Snapshot, SnapshotStore,
};
pub use status::{ConnectionQuality, ConnectionState, ConnectionStatus};
pub use store::{DEFAULT_MAX_MESSAGES, StateStore, StoreConfig};
pub use self::tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
pub use viewport::{RenderDelta, ViewportConfig, ViewportWindow};

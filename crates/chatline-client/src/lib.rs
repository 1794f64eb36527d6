//! Connection lifecycle, message routing, outbound delivery and the CLI
//!
//! This crate provides the `chatline` command-line client. The pieces are
//! wired together by [`Session`], which owns every component on a single
//! task and is driven through a [`SessionHandle`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod outbound;
pub mod router;
pub mod session;
pub mod transport;

pub use cli::Cli;
pub use config::ClientConfig;
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionSettings};
pub use error::{
    ClientError, ClientResult, ConnectionError, DeliveryFailure, ProcessingError, SendError,
    SubmitError,
};
pub use outbound::{OutboundConfig, OutboundQueue};
pub use router::{RouteOutcome, Router, RouterConfig};
pub use session::{Session, SessionConfig, SessionHandle};
#[cfg(feature = "testing")]
pub use transport::{MemoryConnector, MemoryServer};
pub use transport::{SocketConnector, SocketHandle, WsConnector};

//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use chatline_core::TracingOutputFormat;

use crate::config::ClientConfig;

/// chatline - a terminal chat client
#[derive(Debug, Parser)]
#[command(name = "chatline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "CHATLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Log format: compact, pretty or json
    #[arg(long, value_name = "FORMAT")]
    pub log_format: Option<TracingOutputFormat>,

    // --- Connection flags ---
    /// Chat server address (ws, wss, http or https)
    #[arg(long, short, env = "CHATLINE_URL")]
    pub url: Option<String>,

    /// Handle to chat as
    #[arg(long, env = "CHATLINE_HANDLE")]
    pub handle: Option<String>,

    /// Start disconnected; use /connect to go online
    #[arg(long)]
    pub no_connect: bool,

    /// Do not save or restore the session
    #[arg(long)]
    pub no_snapshot: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(ref url) = self.url {
            config.server.url = Some(url.clone());
        }
        if let Some(ref handle) = self.handle {
            config.identity.handle = Some(handle.clone());
        }
        if self.no_connect {
            config.server.auto_connect = false;
        }
        if self.no_snapshot {
            config.snapshot.enabled = false;
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the effective settings
    Show,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

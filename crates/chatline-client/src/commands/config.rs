//! Configuration commands.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Print the effective settings to stdout.
pub fn show(config: &ClientConfig) -> ClientResult<()> {
    let session = config.to_session_config()?;
    println!("# config.toml ({})", ClientConfig::default_path().display());
    println!("endpoint: {}", session.connection.url);
    println!(
        "handle: {}",
        session.handle.as_deref().unwrap_or("(not set)")
    );
    println!("auto_connect: {}", session.auto_connect);
    println!(
        "reconnect: {} attempts, backoff {:?}..{:?}",
        session.connection.max_reconnect_attempts,
        session.connection.backoff_base,
        session.connection.backoff_cap
    );
    println!("heartbeat: {:?}", session.connection.heartbeat_interval);
    println!(
        "delivery: {} retries, await_ack {}",
        session.outbound.max_retries, session.outbound.await_ack
    );
    println!("history: {} messages", session.store.max_messages);
    println!("leave grace: {}s", session.router.leave_grace_secs);
    match config.snapshot_path() {
        Some(path) => println!("snapshot: {}", path.display()),
        None => println!("snapshot: disabled"),
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    let session = config.to_session_config()?;
    if session.handle.is_none() {
        return Err(ClientError::config(
            "no handle configured; set [identity] handle or pass --handle",
        ));
    }
    if session.store.max_messages == 0 {
        return Err(ClientError::config("[store] max_messages must be at least 1"));
    }

    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path() -> ClientResult<()> {
    let config_path = ClientConfig::default_path();
    println!("config: {}", config_path.display());
    Ok(())
}

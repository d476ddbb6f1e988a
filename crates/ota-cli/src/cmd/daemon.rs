//! Daemon command: serve the control plane until told to stop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use ota_core::{Config, Engine};

use crate::rpc;

/// Run the update daemon.
///
/// Builds the engine (loading the trust anchor, if configured) and serves
/// the control-plane socket until SIGINT or SIGTERM arrives. The socket
/// file is removed on the way out.
///
/// # Errors
///
/// Fails if the trust anchor cannot be loaded or the socket cannot be
/// bound.
pub async fn daemon(config: &Config) -> Result<()> {
    let engine = Engine::from_config(config).context("trust anchor init failed")?;
    let socket_path = config.socket_path();

    let mut sigterm = signal(SignalKind::terminate())?;

    let result = tokio::select! {
        result = rpc::serve(Arc::new(engine), &socket_path) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        }
    };

    let _ = std::fs::remove_file(&socket_path);
    result
}

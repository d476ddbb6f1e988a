//! Control-plane socket: the local trigger boundary around the engine.
//!
//! One JSON request per line, one JSON reply per line. The daemon is the
//! layer that guarantees at most one `apply` in flight: concurrent triggers
//! are refused with a busy reply instead of racing the staging area.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use ota_core::engine::ApplyOutcome;
use ota_core::Engine;

/// A trigger request: where to get the update package.
///
/// `url` is `file://<path>` or `http(s)://<url>`; any other scheme is
/// refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Source of the update package.
    pub url: String,
}

/// The daemon's answer to a trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReply {
    /// Whether the update applied successfully.
    pub ok: bool,
    /// Human-readable result or error text.
    pub message: String,
}

/// Route a trigger URL to the matching engine entry point.
///
/// # Errors
///
/// Fails on an unsupported scheme or any [`ota_core::UpdateError`] from the
/// engine.
pub async fn dispatch_url(engine: &Engine, url: &str) -> Result<ApplyOutcome> {
    let Some((scheme, rest)) = url.split_once("://") else {
        bail!("this is not a valid update URL: {url}");
    };

    let outcome = match scheme {
        "file" => engine.apply_from_path(Path::new(rest)).await?,
        "http" | "https" => engine.apply_from_url(url).await?,
        other => bail!("unsupported URL scheme {other:?}"),
    };
    Ok(outcome)
}

/// Serve the control plane on a Unix socket until the task is cancelled.
///
/// A stale socket file from a previous run is removed before binding.
///
/// # Errors
///
/// Fails if the socket directory cannot be created or the socket cannot be
/// bound; per-connection errors are logged, not returned.
pub async fn serve(engine: Arc<Engine>, socket_path: &Path) -> Result<()> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("failed to create socket directory")?;
    }
    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!("control plane listening on {}", socket_path.display());

    // Single-flight guard: the engine has no internal mutual exclusion, so
    // serialization of update attempts happens here.
    let in_flight = Arc::new(Mutex::new(()));

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let engine = Arc::clone(&engine);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &engine, &in_flight).await {
                        error!("connection handler error: {err}");
                    }
                });
            }
            Err(err) => {
                error!("failed to accept connection: {err}");
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    engine: &Engine,
    in_flight: &Mutex<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("failed to read from socket")?;
        if bytes_read == 0 {
            break;
        }

        let reply = match serde_json::from_str::<UpdateRequest>(&line) {
            Ok(request) => handle_request(engine, in_flight, &request.url).await,
            Err(err) => {
                warn!("invalid request JSON: {err}");
                UpdateReply {
                    ok: false,
                    message: format!("invalid request: {err}"),
                }
            }
        };

        let mut payload = serde_json::to_string(&reply)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_request(engine: &Engine, in_flight: &Mutex<()>, url: &str) -> UpdateReply {
    // Refuse rather than queue: a queued trigger would re-apply a package
    // that just finished applying.
    let Ok(_guard) = in_flight.try_lock() else {
        return UpdateReply {
            ok: false,
            message: "update already in progress".to_string(),
        };
    };

    info!("update triggered: {url}");
    match dispatch_url(engine, url).await {
        Ok(outcome) => {
            let message = if outcome.reboot_required {
                format!("applied {} {} (reboot required)", outcome.name, outcome.version)
            } else {
                format!("applied {} {}", outcome.name, outcome.version)
            };
            info!("{message}");
            UpdateReply { ok: true, message }
        }
        Err(err) => {
            error!("update failed: {err:#}");
            UpdateReply {
                ok: false,
                message: err.to_string(),
            }
        }
    }
}

/// Send one trigger to a running daemon and wait for its reply.
///
/// # Errors
///
/// Fails if the daemon is not reachable on `socket_path` or the reply
/// cannot be read.
pub async fn request_update(socket_path: &Path, url: &str) -> Result<UpdateReply> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("is the daemon running on {}?", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_string(&UpdateRequest {
        url: url.to_string(),
    })?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;

    let mut reply_line = String::new();
    BufReader::new(reader)
        .read_line(&mut reply_line)
        .await
        .context("failed to read daemon reply")?;
    Ok(serde_json::from_str(&reply_line)?)
}

//! Install hook execution.
//!
//! A hook is a script staged inside the package and declared by the
//! manifest. Hooks run through a command shell, one at a time. Their output
//! is forwarded line by line as it arrives; both stream readers are joined
//! before the run returns, so a "hook finished" log can never overtake the
//! hook's own output.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Owner read+execute bits, the minimum needed to hand a staged script to
/// the shell.
const OWNER_RX: u32 = 0o500;

/// Run one hook script to completion, forwarding its output.
///
/// The script is granted owner read+execute permission if it is missing
/// (package formats don't always preserve modes). Success means exit
/// status 0; a non-zero status is returned to the caller, which decides
/// whether that aborts anything.
///
/// # Errors
///
/// Returns an I/O error if the script's permissions cannot be adjusted or
/// the shell cannot be spawned.
pub async fn run(script: &Path) -> io::Result<ExitStatus> {
    ensure_owner_rx(script)?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = tokio::spawn(forward_lines(stdout));
    let err_reader = tokio::spawn(forward_lines(stderr));

    let status = child.wait().await?;

    // Both readers terminate at end-of-stream once the child exits; join
    // them so no buffered line outlives this call.
    let _ = out_reader.await;
    let _ = err_reader.await;

    Ok(status)
}

async fn forward_lines<R>(stream: Option<R>)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "ota::hook", "{line}"),
            Ok(None) => break,
            Err(err) => {
                warn!("hook output read failed: {err}");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn ensure_owner_rx(script: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(script)?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & OWNER_RX != OWNER_RX {
        permissions.set_mode(mode | OWNER_RX);
        std::fs::set_permissions(script, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_owner_rx(_script: &Path) -> io::Result<()> {
    Ok(())
}

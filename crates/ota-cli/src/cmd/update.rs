//! Update command: hand a trigger to the daemon, or apply directly.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use ota_core::{Config, Engine};

use crate::rpc;

/// Trigger an update.
///
/// Exactly one of `url` and `file` must be given. The default path talks to
/// the daemon over its socket; `stand_alone` builds an engine in-process
/// and applies without one.
///
/// # Errors
///
/// Fails on argument misuse, an unreachable daemon, or any engine error in
/// stand-alone mode.
pub async fn update(
    config: &Config,
    url: Option<String>,
    file: Option<PathBuf>,
    stand_alone: bool,
) -> Result<()> {
    let target = match (url, file) {
        (Some(_), Some(_)) => bail!("--url and --file cannot be combined"),
        (None, None) => bail!("one of --url or --file is required"),
        (Some(url), None) => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("only http(s) URLs are supported: {url}");
            }
            url
        }
        (None, Some(file)) => {
            // The daemon resolves paths against its own working directory,
            // so hand it an absolute one.
            let file = file
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", file.display()))?;
            format!("file://{}", file.display())
        }
    };

    if stand_alone {
        let engine = Engine::from_config(config).context("trust anchor init failed")?;
        let outcome = rpc::dispatch_url(&engine, &target).await?;
        println!("applied {} {}", outcome.name, outcome.version);
        if outcome.reboot_required {
            println!("reboot required to finish this update");
        }
        return Ok(());
    }

    let reply = rpc::request_update(&config.socket_path(), &target).await?;
    if !reply.ok {
        bail!("update failed: {}", reply.message);
    }
    println!("{}", reply.message);
    Ok(())
}

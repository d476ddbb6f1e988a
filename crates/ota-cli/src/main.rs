//! ota - over-the-air software updater

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ota_cli::{Cli, Commands, cmd};
use ota_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Daemon => cmd::daemon::daemon(&config).await,
        Commands::Update {
            url,
            file,
            stand_alone,
        } => cmd::update::update(&config, url, file, stand_alone).await,
        Commands::Pack(args) => cmd::pack::pack(&args),
        Commands::Hash { files } => cmd::hash::hash(&files),
    }
}

//! ota - over-the-air software updater
//!
//! # Overview
//!
//! The `ota` binary has two halves. `ota daemon` runs resident on the host,
//! owns the trust anchor, and listens on a local Unix socket for update
//! triggers. `ota update` is the client side: it hands the daemon a URL (or
//! a local file) and reports the result. `ota pack` and `ota hash` are
//! authoring aids for building packages on the other end of the pipe.
//!
//! # Control plane
//!
//! The socket speaks newline-delimited JSON: one `{"url": ...}` request per
//! line, one `{"ok": ..., "message": ...}` reply per line. The daemon
//! serializes update attempts; a trigger that arrives while an update is in
//! flight is refused, not queued.

pub mod cmd;
pub mod rpc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for the updater.
#[derive(Debug, Parser)]
#[command(name = "ota")]
#[command(author, version, about = "ota - over-the-air software updater")]
pub struct Cli {
    /// Path to the updater configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the update daemon and its control-plane socket
    Daemon,

    /// Trigger an update through the daemon, or apply one directly
    Update {
        /// Fetch the update package from this http(s) URL
        #[arg(short, long, conflicts_with = "file")]
        url: Option<String>,

        /// Read the update package from this local file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Apply in-process instead of asking the daemon
        #[arg(long)]
        stand_alone: bool,
    },

    /// Build an update package from payload files and hook scripts
    Pack(cmd::pack::PackArgs),

    /// Print the MD5 and SHA-256 digests of the given files
    Hash {
        /// Files to digest
        files: Vec<PathBuf>,
    },
}

//! Pack command: build a signed update package.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use ota_core::PackageBuilder;
use ota_core::builder::parse_payload_spec;
use ota_core::crypto;
use ota_schema::ScriptKind;

/// Arguments for `ota pack`.
#[derive(Debug, Args)]
pub struct PackArgs {
    /// Name of the update
    #[arg(long)]
    pub name: String,

    /// Version of the update
    #[arg(long)]
    pub version: String,

    /// Human-readable description
    #[arg(long, default_value = "")]
    pub description: String,

    /// Mark the update as requiring a host reboot
    #[arg(long)]
    pub reboot: bool,

    /// Payload file as SOURCE:DEST (DEST absolute); repeatable
    #[arg(long = "file", value_name = "SOURCE:DEST")]
    pub files: Vec<String>,

    /// Pre-install hook script; repeatable
    #[arg(long, value_name = "SCRIPT")]
    pub preinstall: Vec<PathBuf>,

    /// Post-install hook script; repeatable
    #[arg(long, value_name = "SCRIPT")]
    pub postinstall: Vec<PathBuf>,

    /// PEM private key used to sign the manifest
    #[arg(long, value_name = "PEM")]
    pub key: Option<PathBuf>,

    /// Where to write the package
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Build a package from the command-line description.
///
/// # Errors
///
/// Fails on a malformed payload spec, an unreadable source or key file, or
/// any archive write failure.
pub fn pack(args: &PackArgs) -> Result<()> {
    let mut builder = PackageBuilder::new(args.name.as_str(), args.version.as_str())
        .description(args.description.as_str())
        .reboot(args.reboot);

    for spec in &args.files {
        let (source, destination) = parse_payload_spec(spec)?;
        builder = builder.payload(source, destination);
    }
    for script in &args.preinstall {
        builder = builder.script(script, ScriptKind::PreInstall);
    }
    for script in &args.postinstall {
        builder = builder.script(script, ScriptKind::PostInstall);
    }
    if let Some(key_path) = &args.key {
        let key = crypto::load_private_key(key_path)
            .with_context(|| format!("cannot load signing key {}", key_path.display()))?;
        builder = builder.signing_key(key);
    }

    builder
        .write_to(&args.output)
        .with_context(|| format!("cannot write {}", args.output.display()))?;
    println!("wrote {}", args.output.display());
    Ok(())
}

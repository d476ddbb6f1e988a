//! Hash command: print the digests the manifest format uses.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};

use ota_core::crypto;

/// Print MD5 and SHA-256 for each file.
///
/// # Errors
///
/// Fails if any file cannot be read.
pub fn hash(files: &[PathBuf]) -> Result<()> {
    for path in files {
        let open = || File::open(path).with_context(|| format!("cannot open {}", path.display()));
        let md5 = crypto::md5_hex(BufReader::new(open()?))?;
        let sha256 = crypto::sha256_hex(BufReader::new(open()?))?;
        println!("{}:", path.display());
        println!("  md5:    {md5}");
        println!("  sha256: {sha256}");
    }
    Ok(())
}

//! Archive extraction into the staging directory.
//!
//! Update packages are gzip-compressed tar streams. Extraction is fully
//! streaming: the decoder pulls from whatever `AsyncBufRead` the caller
//! supplies (local file, HTTP body), so a package is never buffered whole.
//!
//! Entry names are untrusted. Every name is sanitized before it is joined
//! to the staging root; an entry that would resolve outside the root aborts
//! the whole extraction.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_compression::tokio::bufread::GzipDecoder;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio_stream::StreamExt;
use tokio_tar::Archive;

/// Errors that can occur while unpacking an update archive.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Decompression or filesystem I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An entry name would resolve outside the staging root.
    #[error("archive entry escapes the staging root: {path}")]
    PathTraversal {
        /// The offending entry name as stored in the archive.
        path: String,
    },
}

/// Minimum permission mask applied to every extracted entry.
const MIN_READ_MASK: u32 = 0o444;

/// Validate an archive entry name and resolve it under `base`.
///
/// Rejects absolute names, drive prefixes, and any `..` component. `.`
/// components are dropped.
///
/// # Errors
///
/// Returns `ExtractError::PathTraversal` for any name that would resolve
/// outside `base`.
pub fn sanitize_entry_path(base: &Path, entry_name: &Path) -> Result<PathBuf, ExtractError> {
    let mut clean = PathBuf::new();
    for component in entry_name.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::PathTraversal {
                    path: entry_name.display().to_string(),
                });
            }
        }
    }
    Ok(base.join(clean))
}

/// Unpack a gzip-compressed tar stream into `dest`.
///
/// Each entry's file mode is restored OR'd with a minimum readability mask,
/// so digests can always be recomputed over the staged files afterwards.
/// On error, partially written content is left for the caller's scoped
/// staging cleanup.
///
/// # Errors
///
/// Returns `ExtractError::PathTraversal` for a malicious entry name, or
/// `ExtractError::Io` on any decompression or filesystem failure.
pub async fn unpack_archive<R>(reader: R, dest: &Path) -> Result<(), ExtractError>
where
    R: AsyncBufRead + Unpin,
{
    tokio::fs::create_dir_all(dest).await?;

    let decoder = GzipDecoder::new(reader);
    let mut archive = Archive::new(decoder);
    let mut entries = archive.entries()?;

    while let Some(next) = entries.next().await {
        let mut entry = next?;
        let entry_name = entry.path()?.into_owned();
        let target = sanitize_entry_path(dest, &entry_name)?;

        if entry.header().entry_type().is_dir() {
            tokio::fs::create_dir_all(&target).await?;
            continue;
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        entry.unpack(&target).await?;

        let mode = entry.header().mode().unwrap_or(0o644);
        set_mode(&target, mode | MIN_READ_MASK).await?;
    }

    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

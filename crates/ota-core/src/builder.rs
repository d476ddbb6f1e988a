//! Update package authoring.
//!
//! The inverse of the apply pipeline: collect payload files and hook
//! scripts, compute their digests, render the manifest, optionally sign
//! it, and write the gzip-compressed tar package the engine consumes.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use rsa::RsaPrivateKey;
use thiserror::Error;

use ota_schema::{
    FileEntry, MANIFEST_FILENAME, Manifest, ManifestError, SIGNATURE_FILENAME, ScriptEntry,
    ScriptKind,
};

use crate::crypto::{self, KeyError};

/// Errors that can occur while building a package.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Reading a source file or writing the archive failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The manifest could not be serialized.
    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] ManifestError),

    /// Loading or using the signing key failed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A payload spec is not of the form `SOURCE:/ABS/DEST`.
    #[error("invalid payload spec {0:?}: expected SOURCE:DEST with an absolute DEST")]
    InvalidPayloadSpec(String),
}

/// Parse a `SOURCE:DEST` payload spec as accepted on the command line.
///
/// # Errors
///
/// Returns `BuildError::InvalidPayloadSpec` if the separator is missing or
/// the destination is not absolute.
pub fn parse_payload_spec(spec: &str) -> Result<(PathBuf, String), BuildError> {
    let Some((source, dest)) = spec.split_once(':') else {
        return Err(BuildError::InvalidPayloadSpec(spec.to_string()));
    };
    if source.is_empty() || !dest.starts_with('/') {
        return Err(BuildError::InvalidPayloadSpec(spec.to_string()));
    }
    Ok((PathBuf::from(source), dest.to_string()))
}

/// Builds signed (or unsigned) update packages.
#[derive(Debug, Default)]
pub struct PackageBuilder {
    name: String,
    version: String,
    description: String,
    reboot: bool,
    files: Vec<(PathBuf, String)>,
    scripts: Vec<(PathBuf, ScriptKind)>,
    signing_key: Option<RsaPrivateKey>,
}

impl PackageBuilder {
    /// Start a package with the given name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Set the human-readable description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the update as requiring a host reboot.
    #[must_use]
    pub fn reboot(mut self, reboot: bool) -> Self {
        self.reboot = reboot;
        self
    }

    /// Add a payload file: `source` on disk, copied to absolute
    /// `destination` on the target host.
    #[must_use]
    pub fn payload(mut self, source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        self.files.push((source.into(), destination.into()));
        self
    }

    /// Add an install hook script.
    #[must_use]
    pub fn script(mut self, source: impl Into<PathBuf>, kind: ScriptKind) -> Self {
        self.scripts.push((source.into(), kind));
        self
    }

    /// Sign the manifest with this key when writing.
    #[must_use]
    pub fn signing_key(mut self, key: RsaPrivateKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Write the package archive to `output`.
    ///
    /// The manifest goes in first, then the detached signature (when a
    /// signing key is set), then payload files and scripts under their
    /// manifest-declared names. Scripts always get an executable mode.
    ///
    /// # Errors
    ///
    /// Returns `BuildError` on any read, digest, signing, or write failure.
    pub fn write_to(&self, output: &Path) -> Result<(), BuildError> {
        let manifest = self.render_manifest()?;
        let manifest_bytes = manifest.to_json_vec()?;

        let signature = match &self.signing_key {
            Some(key) => Some(crypto::sign(&manifest_bytes, key)?),
            None => None,
        };

        let encoder = GzEncoder::new(File::create(output)?, Compression::default());
        let mut archive = tar::Builder::new(encoder);

        append_bytes(&mut archive, MANIFEST_FILENAME, &manifest_bytes, 0o644)?;
        if let Some(signature) = &signature {
            append_bytes(&mut archive, SIGNATURE_FILENAME, signature.as_bytes(), 0o644)?;
        }

        for (entry, (source, _)) in manifest.files.iter().zip(&self.files) {
            let data = std::fs::read(source)?;
            append_bytes(&mut archive, &entry.filename, &data, source_mode(source, 0o644))?;
        }
        for (entry, (source, _)) in manifest.scripts.iter().zip(&self.scripts) {
            let data = std::fs::read(source)?;
            append_bytes(&mut archive, &entry.filename, &data, 0o755)?;
        }

        archive.into_inner()?.finish()?;
        Ok(())
    }

    fn render_manifest(&self) -> Result<Manifest, BuildError> {
        let mut files = Vec::with_capacity(self.files.len());
        for (source, destination) in &self.files {
            let (md5, sha256) = digests_of(source)?;
            files.push(FileEntry {
                filename: archive_name(source)?,
                path: destination.clone(),
                md5,
                sha256,
            });
        }

        let mut scripts = Vec::with_capacity(self.scripts.len());
        for (source, kind) in &self.scripts {
            let (md5, sha256) = digests_of(source)?;
            scripts.push(ScriptEntry {
                filename: archive_name(source)?,
                kind: kind.as_str().to_string(),
                md5,
                sha256,
            });
        }

        Ok(Manifest {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            reboot: self.reboot,
            files,
            scripts,
        })
    }
}

/// Name an entry carries inside the archive: the source's file name.
fn archive_name(source: &Path) -> Result<String, BuildError> {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| BuildError::InvalidPayloadSpec(source.display().to_string()))
}

fn digests_of(source: &Path) -> Result<(String, String), BuildError> {
    let md5 = crypto::md5_hex(io::BufReader::new(File::open(source)?))?;
    let sha256 = crypto::sha256_hex(io::BufReader::new(File::open(source)?))?;
    Ok((md5, sha256))
}

#[cfg(unix)]
fn source_mode(source: &Path, fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(source)
        .map(|metadata| metadata.permissions().mode() & 0o7777)
        .unwrap_or(fallback)
}

#[cfg(not(unix))]
fn source_mode(_source: &Path, fallback: u32) -> u32 {
    fallback
}

fn append_bytes<W: io::Write>(
    archive: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    archive.append_data(&mut header, name, data)
}

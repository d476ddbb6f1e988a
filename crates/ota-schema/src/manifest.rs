//! JSON manifest parsing
//!
//! The manifest declares what an update package contains. Parsing performs
//! no existence or integrity checks; those belong to the update engine.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading or parsing a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// An I/O error occurred while reading a manifest file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The JSON content could not be deserialized into a valid manifest.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// When a hook script runs relative to payload placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Runs before any payload file is copied.
    PreInstall,
    /// Runs after all payload files are in place.
    PostInstall,
}

impl ScriptKind {
    /// Wire name of this kind (`"preinstall"` / `"postinstall"`).
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::PreInstall => "preinstall",
            ScriptKind::PostInstall => "postinstall",
        }
    }
}

/// A payload file to copy out of the staged package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path of the staged source, relative to the package root.
    pub filename: String,
    /// Absolute destination path on the host.
    pub path: String,
    /// Expected MD5 digest (lowercase hex). Empty means not declared.
    #[serde(default)]
    pub md5: String,
    /// Expected SHA-256 digest (lowercase hex). Empty means not declared.
    #[serde(default)]
    pub sha256: String,
}

/// An install hook declared by the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    /// Path of the staged script, relative to the package root.
    pub filename: String,
    /// Raw hook kind as it appears on the wire.
    ///
    /// Kept as a string so an unrecognized value is a validation failure in
    /// the engine, distinct from a parse failure. Resolve with
    /// [`ScriptEntry::script_kind`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Expected MD5 digest (lowercase hex). Empty means not declared.
    #[serde(default)]
    pub md5: String,
    /// Expected SHA-256 digest (lowercase hex). Empty means not declared.
    #[serde(default)]
    pub sha256: String,
}

impl ScriptEntry {
    /// Resolve the wire `type` field, or `None` if it is unrecognized.
    pub fn script_kind(&self) -> Option<ScriptKind> {
        match self.kind.as_str() {
            "preinstall" => Some(ScriptKind::PreInstall),
            "postinstall" => Some(ScriptKind::PostInstall),
            _ => None,
        }
    }
}

/// Declarative description of one update package.
///
/// Immutable once parsed. Field names are fixed for wire compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Name of the update.
    pub name: String,
    /// Version string of the update.
    pub version: String,
    /// Human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Whether the host should reboot after a successful apply.
    #[serde(default)]
    pub reboot: bool,
    /// Payload files to copy into place.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Install hooks to run around the copy phase.
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

impl Manifest {
    /// Parse a manifest from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError::Parse` if the JSON is malformed or a required
    /// field is missing.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse a manifest from a JSON file on disk.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError::Io` if the file cannot be read, or
    /// `ManifestError::Parse` if the JSON content is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let bytes = fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Serialize this manifest to the JSON bytes that get signed and packed.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError::Parse` if serialization fails.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl std::str::FromStr for Manifest {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

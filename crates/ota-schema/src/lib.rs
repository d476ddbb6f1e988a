//! Shared types and wire format for OTA update packages.
//!
//! An update package is a gzip-compressed tar archive. At its root it carries
//! a JSON manifest describing the payload, and optionally a detached
//! signature over the raw manifest bytes. Both live under fixed names so the
//! applying side never has to guess:
//!
//! ```text
//! ota.tar.gz
//! ├── ota-description.json   # manifest (required)
//! ├── ota-description.sig    # detached hex signature (optional)
//! ├── app.bin                # payload files at their declared paths
//! └── restart.sh             # install hooks
//! ```

pub mod manifest;

pub use manifest::{FileEntry, Manifest, ManifestError, ScriptEntry, ScriptKind};

/// File name of the manifest at the package root.
pub const MANIFEST_FILENAME: &str = "ota-description.json";

/// File name of the detached manifest signature at the package root.
pub const SIGNATURE_FILENAME: &str = "ota-description.sig";

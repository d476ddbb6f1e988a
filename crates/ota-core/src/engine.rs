//! The update engine: verification and application pipeline.
//!
//! One `apply` call owns one staging directory for its whole duration. The
//! pipeline is strictly sequential: stage, verify the manifest signature,
//! parse, resolve and validate every declared entry, verify every declared
//! digest, run pre-install hooks, copy payload files, run post-install
//! hooks. Integrity is fully verified before the first side effect. There
//! is no rollback: a copy failure aborts the remaining copies but leaves
//! already-copied files in place.

use std::path::{Component, Path, PathBuf};

use futures::TryStreamExt;
use rsa::RsaPublicKey;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use ota_schema::{MANIFEST_FILENAME, Manifest, ManifestError, SIGNATURE_FILENAME, ScriptKind};

use crate::config::Config;
use crate::crypto::{self, KeyError};
use crate::extract::{self, ExtractError};
use crate::hooks;

/// Errors that can abort an `apply` call.
///
/// Hook failures are deliberately absent: a hook exiting non-zero is logged
/// and the batch continues.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Decompression, unpacking, or a hostile entry name.
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    /// The package carries no manifest.
    #[error("package does not contain {MANIFEST_FILENAME}")]
    ManifestMissing,

    /// The manifest could not be parsed.
    #[error("manifest parse failed: {0}")]
    ManifestParse(#[from] ManifestError),

    /// The package is signed but no trust anchor is configured.
    #[error("package is signed but no trust anchor is configured")]
    TrustAnchorMissing,

    /// The detached signature does not verify against the trust anchor.
    #[error("manifest signature verification failed")]
    SignatureInvalid,

    /// A declared file or script is not present in the staged package.
    #[error("declared entry missing from package: {filename}")]
    MissingPayload {
        /// The manifest-declared name of the missing entry.
        filename: String,
    },

    /// A script entry declares an unrecognized hook kind.
    #[error("unrecognized script type {kind:?} for {filename}")]
    InvalidScriptKind {
        /// The script whose kind is unrecognized.
        filename: String,
        /// The raw wire value.
        kind: String,
    },

    /// A declared digest does not match the staged file.
    #[error("{algorithm} mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The entry whose digest check failed.
        filename: String,
        /// Which digest algorithm mismatched.
        algorithm: &'static str,
        /// The digest declared by the manifest.
        expected: String,
        /// The digest recomputed over the staged bytes.
        actual: String,
    },

    /// A file entry declares a destination outside the allowed shape
    /// (absolute, no parent components).
    #[error("unsafe destination {path:?} for {filename}")]
    UnsafeDestination {
        /// The entry declaring the destination.
        filename: String,
        /// The offending destination path.
        path: String,
    },

    /// Copying a payload file to its destination failed.
    #[error("failed to install {filename}: {source}")]
    FileCopy {
        /// The entry being copied.
        filename: String,
        /// The underlying I/O failure.
        source: std::io::Error,
    },

    /// Fetching the package over HTTP failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Any other I/O failure (staging, manifest read).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a successful apply reported back, straight from the manifest.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Name of the applied update.
    pub name: String,
    /// Version of the applied update.
    pub version: String,
    /// Whether the manifest requests a host reboot.
    pub reboot_required: bool,
}

/// Applies update packages.
///
/// Holds the optional trust anchor as explicit state so tests (and
/// multi-tenant callers) can construct engines with different anchors.
/// The engine provides no mutual exclusion: the calling layer must
/// guarantee at most one `apply` in flight.
#[derive(Debug)]
pub struct Engine {
    trust_anchor: Option<RsaPublicKey>,
    staging_root: Option<PathBuf>,
    client: reqwest::Client,
}

impl Engine {
    /// Create an engine with an explicit (possibly absent) trust anchor.
    pub fn new(trust_anchor: Option<RsaPublicKey>) -> Self {
        Self {
            trust_anchor,
            staging_root: None,
            client: reqwest::Client::new(),
        }
    }

    /// Build an engine from loaded configuration, parsing the trust-anchor
    /// key file if one is configured.
    ///
    /// # Errors
    ///
    /// Returns `KeyError` if the configured key file cannot be read or is
    /// not an RSA public key.
    pub fn from_config(config: &Config) -> Result<Self, KeyError> {
        let trust_anchor = match &config.keyfile {
            Some(path) => Some(crypto::load_public_key(path)?),
            None => None,
        };
        let mut engine = Self::new(trust_anchor);
        engine.staging_root = config.staging_root.clone();
        Ok(engine)
    }

    /// Override where staging directories are created.
    #[must_use]
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Apply an update from a package file on the local filesystem.
    ///
    /// # Errors
    ///
    /// See [`Engine::apply`]; additionally fails with `UpdateError::Io` if
    /// the file cannot be opened.
    pub async fn apply_from_path(&self, path: &Path) -> Result<ApplyOutcome, UpdateError> {
        let file = tokio::fs::File::open(path).await?;
        self.apply(BufReader::new(file)).await
    }

    /// Apply an update fetched from a URL, streaming the response body.
    ///
    /// # Errors
    ///
    /// See [`Engine::apply`]; additionally fails with `UpdateError::Http`
    /// on a request or status failure.
    pub async fn apply_from_url(&self, url: &str) -> Result<ApplyOutcome, UpdateError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        self.apply(StreamReader::new(stream)).await
    }

    /// Apply an update from a gzip-compressed tar stream.
    ///
    /// The staging directory is uniquely named per call and removed on
    /// every exit path, success or failure.
    ///
    /// # Errors
    ///
    /// Any [`UpdateError`]; whichever step fails, cleanup still runs.
    pub async fn apply<R>(&self, reader: R) -> Result<ApplyOutcome, UpdateError>
    where
        R: AsyncBufRead + Unpin,
    {
        let staging = self.create_staging()?;
        info!("staging update in {}", staging.path().display());

        // TempDir removes the staging tree when dropped, which covers every
        // early return below.
        extract::unpack_archive(reader, staging.path()).await?;
        let outcome = self.apply_staged(staging.path()).await;

        let staging_path = staging.path().to_path_buf();
        if let Err(err) = staging.close() {
            warn!(
                "failed to remove staging directory {}: {err}",
                staging_path.display()
            );
        }
        outcome
    }

    fn create_staging(&self) -> std::io::Result<TempDir> {
        match &self.staging_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("ota-").tempdir_in(root)
            }
            None => tempfile::Builder::new().prefix("ota-").tempdir(),
        }
    }

    async fn apply_staged(&self, staging: &Path) -> Result<ApplyOutcome, UpdateError> {
        // The manifest is the one file that must exist.
        let manifest_bytes = match tokio::fs::read(staging.join(MANIFEST_FILENAME)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UpdateError::ManifestMissing);
            }
            Err(err) => return Err(err.into()),
        };

        // A signature artifact makes verification mandatory; its absence
        // means the manifest is accepted unsigned.
        let sig_path = staging.join(SIGNATURE_FILENAME);
        if tokio::fs::try_exists(&sig_path).await.unwrap_or(false) {
            let Some(anchor) = &self.trust_anchor else {
                return Err(UpdateError::TrustAnchorMissing);
            };
            let signature = tokio::fs::read_to_string(&sig_path).await?;
            if !crypto::verify(&manifest_bytes, &signature, anchor) {
                return Err(UpdateError::SignatureInvalid);
            }
            info!("manifest signature verified");
        }

        let manifest = Manifest::parse(&manifest_bytes)?;
        info!(
            name = %manifest.name,
            version = %manifest.version,
            "applying update"
        );

        // Resolve and validate every declared entry before any side effect.
        let mut checks = Vec::new();
        let mut preinstall = Vec::new();
        let mut postinstall = Vec::new();

        for entry in &manifest.files {
            let staged = resolve_staged(staging, &entry.filename).await?;
            validate_destination(&entry.filename, &entry.path)?;
            checks.push(DigestCheck {
                filename: entry.filename.clone(),
                staged,
                md5: entry.md5.clone(),
                sha256: entry.sha256.clone(),
            });
        }

        for script in &manifest.scripts {
            let staged = resolve_staged(staging, &script.filename).await?;
            match script.script_kind() {
                Some(ScriptKind::PreInstall) => preinstall.push(staged.clone()),
                Some(ScriptKind::PostInstall) => postinstall.push(staged.clone()),
                None => {
                    return Err(UpdateError::InvalidScriptKind {
                        filename: script.filename.clone(),
                        kind: script.kind.clone(),
                    });
                }
            }
            checks.push(DigestCheck {
                filename: script.filename.clone(),
                staged,
                md5: script.md5.clone(),
                sha256: script.sha256.clone(),
            });
        }

        // Integrity: every declared digest verified before any hook runs
        // or any file is copied.
        for check in &checks {
            check.verify().await?;
        }

        run_hooks(&preinstall).await;

        for entry in &manifest.files {
            let staged = staging.join(&entry.filename);
            copy_payload(&staged, &entry.filename, &entry.path).await?;
        }

        run_hooks(&postinstall).await;

        Ok(ApplyOutcome {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            reboot_required: manifest.reboot,
        })
    }
}

/// Resolve a manifest-declared name inside the staging root, confirming it
/// exists. Names are untrusted, so the same sanitizer the extractor uses
/// guards the join.
async fn resolve_staged(staging: &Path, filename: &str) -> Result<PathBuf, UpdateError> {
    let staged = extract::sanitize_entry_path(staging, Path::new(filename))?;
    if !tokio::fs::try_exists(&staged).await.unwrap_or(false) {
        return Err(UpdateError::MissingPayload {
            filename: filename.to_string(),
        });
    }
    Ok(staged)
}

/// Destinations come from the manifest and are untrusted: require an
/// absolute path with no parent components, so a package cannot steer a
/// copy outside the install roots it names.
fn validate_destination(filename: &str, destination: &str) -> Result<(), UpdateError> {
    let path = Path::new(destination);
    let unsafe_dest = !path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
    if unsafe_dest {
        return Err(UpdateError::UnsafeDestination {
            filename: filename.to_string(),
            path: destination.to_string(),
        });
    }
    Ok(())
}

struct DigestCheck {
    filename: String,
    staged: PathBuf,
    md5: String,
    sha256: String,
}

#[derive(Clone, Copy)]
enum DigestKind {
    Md5,
    Sha256,
}

impl DigestKind {
    fn name(self) -> &'static str {
        match self {
            DigestKind::Md5 => "md5",
            DigestKind::Sha256 => "sha256",
        }
    }
}

impl DigestCheck {
    async fn verify(&self) -> Result<(), UpdateError> {
        if !self.md5.is_empty() {
            self.verify_one(DigestKind::Md5, &self.md5).await?;
        }
        if !self.sha256.is_empty() {
            self.verify_one(DigestKind::Sha256, &self.sha256).await?;
        }
        Ok(())
    }

    async fn verify_one(&self, kind: DigestKind, expected: &str) -> Result<(), UpdateError> {
        let actual = file_digest(&self.staged, kind).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdateError::ChecksumMismatch {
                filename: self.filename.clone(),
                algorithm: kind.name(),
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
        Ok(())
    }
}

/// Streaming digest of a staged file, off the async runtime.
async fn file_digest(path: &Path, kind: DigestKind) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::io::BufReader::new(std::fs::File::open(&path)?);
        match kind {
            DigestKind::Md5 => crypto::md5_hex(file),
            DigestKind::Sha256 => crypto::sha256_hex(file),
        }
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Run a batch of hooks in declared order. Best-effort: a hook that fails
/// to spawn or exits non-zero is logged and the batch continues.
async fn run_hooks(scripts: &[PathBuf]) {
    for script in scripts {
        match hooks::run(script).await {
            Ok(status) if status.success() => {
                info!("hook {} completed", script.display());
            }
            Ok(status) => {
                warn!("hook {} exited with {status}, continuing", script.display());
            }
            Err(err) => {
                warn!("hook {} failed to start: {err}, continuing", script.display());
            }
        }
    }
}

async fn copy_payload(staged: &Path, filename: &str, destination: &str) -> Result<(), UpdateError> {
    let result = async {
        let dest = Path::new(destination);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(staged, dest).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!("installed {filename} -> {destination}");
            Ok(())
        }
        Err(source) => Err(UpdateError::FileCopy {
            filename: filename.to_string(),
            source,
        }),
    }
}

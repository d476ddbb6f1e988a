//! Digest computation and manifest signature handling.
//!
//! Packages carry per-file MD5/SHA-256 digests and an optional detached
//! RSA signature (PKCS#1 v1.5 over the SHA-256 of the raw manifest bytes,
//! hex-encoded). Everything here is a pure function over bytes or a reader;
//! policy (when to verify, what a failure aborts) lives in the engine.

use std::io::{self, Read};
use std::path::Path;

use md5::Md5;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from key loading and signing.
#[derive(Error, Debug)]
pub enum KeyError {
    /// An I/O error occurred while reading a key file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The PEM block is absent or does not encode the expected key type.
    #[error("key format error: {0}")]
    Format(String),

    /// The RSA signing operation itself failed.
    #[error("signing failed: {0}")]
    Sign(String),
}

const DIGEST_BUF_SIZE: usize = 8192;

fn digest_hex<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; DIGEST_BUF_SIZE];
    loop {
        let count = reader.read(&mut buf)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming MD5 of a reader, as lowercase hex.
///
/// # Errors
///
/// Returns any I/O error from the underlying reader.
pub fn md5_hex<R: Read>(reader: R) -> io::Result<String> {
    digest_hex::<Md5, R>(reader)
}

/// Streaming SHA-256 of a reader, as lowercase hex.
///
/// # Errors
///
/// Returns any I/O error from the underlying reader.
pub fn sha256_hex<R: Read>(reader: R) -> io::Result<String> {
    digest_hex::<Sha256, R>(reader)
}

/// Parse a PEM-encoded RSA private key (PKCS#1, falling back to PKCS#8).
///
/// # Errors
///
/// Returns `KeyError::Format` if no PEM block is present or the encoded
/// structure is not an RSA private key.
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, KeyError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| KeyError::Format(format!("not an RSA private key: {e}")))
}

/// Parse a PEM-encoded RSA public key (SPKI, falling back to PKCS#1).
///
/// # Errors
///
/// Returns `KeyError::Format` if no PEM block is present or the encoded
/// structure is not an RSA public key.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, KeyError> {
    if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(key);
    }
    RsaPublicKey::from_pkcs1_pem(pem)
        .map_err(|e| KeyError::Format(format!("not an RSA public key: {e}")))
}

/// Read and parse a PEM private key from disk.
///
/// # Errors
///
/// Returns `KeyError::Io` if the file cannot be read, or `KeyError::Format`
/// if its content is not an RSA private key.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyError> {
    let pem = std::fs::read_to_string(path)?;
    parse_private_key(&pem)
}

/// Read and parse a PEM public key from disk.
///
/// # Errors
///
/// Returns `KeyError::Io` if the file cannot be read, or `KeyError::Format`
/// if its content is not an RSA public key.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, KeyError> {
    let pem = std::fs::read_to_string(path)?;
    parse_public_key(&pem)
}

/// Sign `data` with SHA-256 / PKCS#1 v1.5, returning the hex signature.
///
/// Used by the package builder; the runtime pipeline only ever verifies.
///
/// # Errors
///
/// Returns `KeyError::Sign` if the RSA operation fails.
pub fn sign(data: &[u8], key: &RsaPrivateKey) -> Result<String, KeyError> {
    let hashed = Sha256::digest(data);
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
        .map_err(|e| KeyError::Sign(e.to_string()))?;
    Ok(hex::encode(signature))
}

/// Verify a hex-encoded SHA-256 / PKCS#1 v1.5 signature over `data`.
///
/// Total: malformed hex, a malformed signature, or a digest mismatch all
/// yield `false`, so the caller always gets a definite accept/reject.
pub fn verify(data: &[u8], hex_signature: &str, key: &RsaPublicKey) -> bool {
    let Ok(signature) = hex::decode(hex_signature.trim()) else {
        return false;
    };
    let hashed = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature)
        .is_ok()
}

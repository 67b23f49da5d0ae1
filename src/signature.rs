// src/signature.rs

//! Detached-signature verification for the update manifest
//!
//! The manifest is only trusted after its detached signature checks out
//! against key material provisioned on the device. Two interchangeable
//! implementations sit behind the [`SignatureVerifier`] seam: shelling out
//! to the system `gpg`, and a pure-Rust path using sequoia-openpgp against a
//! keyring file shipped with the OS image.

use crate::error::{Error, Result};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use sequoia_openpgp as openpgp;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Validates a detached signature over a content file.
///
/// Runs synchronously inside the check cycle; implementations must be usable
/// from the check thread.
pub trait SignatureVerifier: Send + Sync {
    /// Ok when `signature` is a valid detached signature over `content`
    /// by a trusted key.
    fn verify_detached(&self, content: &Path, signature: &Path) -> Result<()>;
}

/// Verifier shelling out to the system GPG with the device keyring.
///
/// `gpg --quiet --verify <sig> <content>`, exit status 0 means valid.
pub struct GpgProcessVerifier {
    gpg_path: PathBuf,
}

impl GpgProcessVerifier {
    pub fn new() -> Self {
        Self {
            gpg_path: PathBuf::from("/usr/bin/gpg"),
        }
    }

    pub fn with_binary(gpg_path: impl Into<PathBuf>) -> Self {
        Self {
            gpg_path: gpg_path.into(),
        }
    }
}

impl Default for GpgProcessVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureVerifier for GpgProcessVerifier {
    fn verify_detached(&self, content: &Path, signature: &Path) -> Result<()> {
        let status = Command::new(&self.gpg_path)
            .arg("--quiet")
            .arg("--verify")
            .arg(signature)
            .arg(content)
            .status()
            .map_err(|e| {
                Error::GpgVerificationFailed(format!(
                    "Failed to run {}: {e}",
                    self.gpg_path.display()
                ))
            })?;

        if !status.success() {
            warn!("gpg rejected signature {}", signature.display());
            return Err(Error::GpgVerificationFailed(format!(
                "gpg exited with {status}"
            )));
        }

        Ok(())
    }
}

/// Pure-library verifier against an OpenPGP certificate file.
///
/// The keyring is a single armored or binary certificate (the OS signing
/// key) baked into the image; no runtime key import exists on purpose.
pub struct KeyringVerifier {
    keyring: PathBuf,
    policy: StandardPolicy<'static>,
}

impl KeyringVerifier {
    pub fn new(keyring: impl Into<PathBuf>) -> Self {
        Self {
            keyring: keyring.into(),
            policy: StandardPolicy::new(),
        }
    }
}

impl SignatureVerifier for KeyringVerifier {
    fn verify_detached(&self, content: &Path, signature: &Path) -> Result<()> {
        debug!(
            "Verifying signature for {} against {}",
            content.display(),
            self.keyring.display()
        );

        let key_data = fs::read(&self.keyring)
            .map_err(|e| Error::IoError(format!("Failed to read keyring: {e}")))?;

        let cert = openpgp::Cert::from_bytes(&key_data)
            .map_err(|e| Error::ParseError(format!("Failed to parse signing key: {e}")))?;

        let message_data = fs::read(content)
            .map_err(|e| Error::IoError(format!("Failed to read file to verify: {e}")))?;

        let signature_data = fs::read(signature)
            .map_err(|e| Error::IoError(format!("Failed to read signature file: {e}")))?;

        let signature_pile = openpgp::PacketPile::from_bytes(&signature_data)
            .map_err(|e| Error::ParseError(format!("Failed to parse signature: {e}")))?;

        let mut found_valid_signature = false;
        for packet in signature_pile.descendants() {
            if let openpgp::Packet::Signature(sig) = packet {
                let mut sig = sig.clone();
                for key in cert.keys().with_policy(&self.policy, None) {
                    if key.for_signing() && sig.verify_message(key.key(), &message_data).is_ok() {
                        found_valid_signature = true;
                        break;
                    }
                }
                if found_valid_signature {
                    break;
                }
            }
        }

        if !found_valid_signature {
            return Err(Error::GpgVerificationFailed(
                "No valid signature found".to_string(),
            ));
        }

        info!("Signature on {} verified", content.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_gpg_binary_is_a_verification_failure() {
        let content = NamedTempFile::new().unwrap();
        let signature = NamedTempFile::new().unwrap();

        let verifier = GpgProcessVerifier::with_binary("/nonexistent/gpg");
        let err = verifier
            .verify_detached(content.path(), signature.path())
            .unwrap_err();
        assert!(matches!(err, Error::GpgVerificationFailed(_)));
    }

    #[test]
    fn keyring_verifier_rejects_garbage_keyring() {
        let mut keyring = NamedTempFile::new().unwrap();
        keyring.write_all(b"not a certificate").unwrap();
        let content = NamedTempFile::new().unwrap();
        let signature = NamedTempFile::new().unwrap();

        let verifier = KeyringVerifier::new(keyring.path());
        assert!(verifier
            .verify_detached(content.path(), signature.path())
            .is_err());
    }

    #[test]
    fn keyring_verifier_reports_missing_keyring() {
        let content = NamedTempFile::new().unwrap();
        let signature = NamedTempFile::new().unwrap();

        let verifier = KeyringVerifier::new("/nonexistent/keyring.asc");
        let err = verifier
            .verify_detached(content.path(), signature.path())
            .unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }
}

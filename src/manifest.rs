// src/manifest.rs

//! Update manifest parsing
//!
//! The update server publishes a JSON manifest per model and channel. All
//! fields are required; a manifest missing any of them is rejected rather
//! than silently defaulted, so a truncated or mis-published manifest fails
//! the check cycle instead of producing an update with empty URLs.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Extension appended to the delta URL prefix after the current version.
const DELTA_EXTENSION: &str = ".vcdiff";

/// Expected hex length of a SHA-512 digest string.
const SHA512_HEX_LEN: usize = 128;

/// Raw manifest as published by the update server.
///
/// `build_id` is a decimal string on the wire; everything else is either an
/// absolute URL, a URL prefix, or a hex digest.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateManifest {
    pub build_id: String,
    pub rootfs: String,
    pub rootfs_sha512: String,
    pub bootimg: String,
    pub bootimg_sha512: String,
    pub rootfs_deltas: String,
    pub bootimg_deltas: String,
    pub signature: String,
}

impl UpdateManifest {
    /// Parse manifest bytes, validating the build id and digest formats.
    pub fn parse(content: &[u8]) -> Result<Self> {
        let manifest: UpdateManifest = serde_json::from_slice(content)
            .map_err(|e| Error::ParseError(format!("Unable to parse update manifest: {e}")))?;

        manifest.build_id()?;
        validate_sha512(&manifest.rootfs_sha512, "rootfs_sha512")?;
        validate_sha512(&manifest.bootimg_sha512, "bootimg_sha512")?;

        Ok(manifest)
    }

    /// The manifest's build id as an integer.
    pub fn build_id(&self) -> Result<u64> {
        self.build_id.parse::<u64>().map_err(|_| {
            Error::ParseError(format!("Invalid build_id '{}' in manifest", self.build_id))
        })
    }
}

fn validate_sha512(digest: &str, field: &str) -> Result<()> {
    if digest.len() != SHA512_HEX_LEN || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::ParseError(format!(
            "Field '{field}' is not a SHA-512 hex digest"
        )));
    }
    Ok(())
}

/// A published build the device may install.
///
/// Produced by a successful check cycle, consumed read-only by the install
/// worker. The delta URLs are keyed by the OS version that was running when
/// the check happened, since that version's image is the delta dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub version: u64,
    pub bootimg_url: String,
    pub rootfs_url: String,
    pub bootimg_delta_url: String,
    pub rootfs_delta_url: String,
    pub bootimg_sha512: String,
    pub rootfs_sha512: String,
}

impl AvailableUpdate {
    /// The zeroed state: no update known. Never installable.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether an install may be started from this record.
    pub fn is_installable(&self) -> bool {
        self.version != 0
    }

    /// Build the record from a verified manifest and the running OS version.
    ///
    /// Digests are canonicalized to lowercase here so later comparisons can
    /// stay byte-for-byte.
    pub fn from_manifest(manifest: &UpdateManifest, current_version: u64) -> Result<Self> {
        let version = manifest.build_id()?;

        Ok(Self {
            version,
            bootimg_url: manifest.bootimg.clone(),
            rootfs_url: manifest.rootfs.clone(),
            bootimg_delta_url: format!(
                "{}{}{}",
                manifest.bootimg_deltas, current_version, DELTA_EXTENSION
            ),
            rootfs_delta_url: format!(
                "{}{}{}",
                manifest.rootfs_deltas, current_version, DELTA_EXTENSION
            ),
            bootimg_sha512: manifest.bootimg_sha512.to_lowercase(),
            rootfs_sha512: manifest.rootfs_sha512.to_lowercase(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        let digest = "ab".repeat(64);
        format!(
            r#"{{
                "build_id": "43",
                "rootfs": "https://os.nepos.io/builds/43/rootfs.img",
                "rootfs_sha512": "{digest}",
                "bootimg": "https://os.nepos.io/builds/43/boot.img",
                "bootimg_sha512": "{digest}",
                "rootfs_deltas": "https://os.nepos.io/builds/43/rootfs-from-",
                "bootimg_deltas": "https://os.nepos.io/builds/43/boot-from-",
                "signature": "https://os.nepos.io/builds/43/update.json.sig"
            }}"#
        )
    }

    #[test]
    fn parses_complete_manifest() {
        let manifest = UpdateManifest::parse(sample_json().as_bytes()).unwrap();
        assert_eq!(manifest.build_id().unwrap(), 43);
        assert_eq!(
            manifest.signature,
            "https://os.nepos.io/builds/43/update.json.sig"
        );
    }

    #[test]
    fn rejects_missing_field() {
        let json = sample_json().replace("\"signature\"", "\"sig\"");
        assert!(UpdateManifest::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_non_numeric_build_id() {
        let json = sample_json().replace("\"43\"", "\"banana\"");
        assert!(UpdateManifest::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_short_digest() {
        let json = sample_json().replacen(&"ab".repeat(64), "abcd", 1);
        assert!(UpdateManifest::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn delta_urls_are_keyed_by_current_version() {
        let manifest = UpdateManifest::parse(sample_json().as_bytes()).unwrap();
        let update = AvailableUpdate::from_manifest(&manifest, 42).unwrap();

        assert_eq!(
            update.rootfs_delta_url,
            "https://os.nepos.io/builds/43/rootfs-from-42.vcdiff"
        );
        assert_eq!(
            update.bootimg_delta_url,
            "https://os.nepos.io/builds/43/boot-from-42.vcdiff"
        );
        assert!(update.is_installable());
    }

    #[test]
    fn digests_are_canonicalized_to_lowercase() {
        let json = sample_json().replace(&"ab".repeat(64), &"AB".repeat(64));
        let manifest = UpdateManifest::parse(json.as_bytes()).unwrap();
        let update = AvailableUpdate::from_manifest(&manifest, 42).unwrap();
        assert_eq!(update.rootfs_sha512, "ab".repeat(64));
    }

    #[test]
    fn zeroed_update_is_not_installable() {
        assert!(!AvailableUpdate::none().is_installable());
    }
}

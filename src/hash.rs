// src/hash.rs

//! Image digest computation
//!
//! SHA-512 over a mapped image, fed in fixed-size chunks so progress can be
//! reported and cancellation observed between chunks. The digest is rendered
//! as lowercase hex, the manifest's canonical form.

use crate::error::{Error, Result};
use crate::fetch::CancelToken;
use sha2::{Digest, Sha512};

/// Hash input chunk size (1 MiB).
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Compute the SHA-512 of `data`, reporting `pos / len` after each chunk.
///
/// Stops at the next chunk boundary when `cancel` fires.
pub fn image_digest(
    data: &[u8],
    cancel: &CancelToken,
    mut progress: impl FnMut(f32),
) -> Result<String> {
    let mut hasher = Sha512::new();
    let total = data.len();
    let mut pos = 0;

    while pos < total {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let end = usize::min(pos + HASH_CHUNK_SIZE, total);
        hasher.update(&data[pos..end]);
        pos = end;

        progress(pos as f32 / total as f32);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare `data` against an expected SHA-512 hex digest.
///
/// The comparison is case-insensitive; lowercase is the authoritative form.
pub fn verify_digest(
    data: &[u8],
    expected: &str,
    cancel: &CancelToken,
    progress: impl FnMut(f32),
) -> Result<()> {
    let actual = image_digest(data, cancel, progress)?;

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_lowercase(),
            actual,
        });
    }

    Ok(())
}

// src/error.rs

//! Crate-wide error type
//!
//! One flat enum covering all failure domains of the updater. Most variants
//! carry a pre-formatted message; call sites build them with
//! `map_err(|e| Error::IoError(format!(...)))` so the original error text is
//! preserved without keeping the source around.

use thiserror::Error;

/// Updater errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Delta error: {0}")]
    DeltaError(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Signature verification failed: {0}")]
    GpgVerificationFailed(String),
}

impl Error {
    /// True for errors caused by an explicit cancellation rather than a
    /// genuine failure. Callers use this to pick the terminal event reason.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

// src/vcdiff/mod.rs

//! Streaming VCDIFF (RFC 3284) delta decoding
//!
//! Applies an Xdelta3-style delta stream against an in-memory dictionary —
//! the mapped seed image — and pushes the reconstructed target into an
//! [`crate::image::UpdateSink`]. Input arrives in arbitrary chunks as the
//! HTTP body streams in; complete windows are decoded as soon as they are
//! buffered, so memory use is bounded by the largest window, not the
//! target.
//!
//! Supported: the default instruction code table, `VCD_SOURCE` windows,
//! Adler-32 window checksums, application headers (skipped). Not supported,
//! and rejected on sight: secondary compression, application-defined code
//! tables, and `VCD_TARGET` windows (those would require reading back from
//! the sink, which the sink contract rules out; Xdelta3 does not emit
//! them against a source window).

mod code_table;
mod decoder;

pub use decoder::StreamingDecoder;

use thiserror::Error;

/// Default cap on the reconstructed target size.
pub const MAX_TARGET_SIZE: u64 = 512 * 1024 * 1024;

/// Delta decoding failures
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Not a VCDIFF stream")]
    InvalidMagic,

    #[error("Unsupported VCDIFF feature: {0}")]
    Unsupported(&'static str),

    #[error("Corrupt VCDIFF stream: {0}")]
    Corrupt(&'static str),

    #[error("Truncated VCDIFF stream")]
    Truncated,

    #[error("Window checksum mismatch")]
    ChecksumMismatch,

    #[error("Decoded target exceeds {limit} bytes")]
    TargetTooLarge { limit: u64 },

    #[error("Failed to write decoded data: {0}")]
    Output(#[from] std::io::Error),
}

// src/image/sink.rs

//! Streaming byte sink for image output
//!
//! The delta decoder pushes reconstructed bytes into an [`UpdateSink`], and
//! full-image downloads use the same interface so both paths share one
//! write-side implementation. The sink only ever moves forward; nothing
//! reads back from it.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Write contract for image output.
pub trait UpdateSink {
    /// Append bytes at the current position.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Append a single byte.
    fn push_byte(&mut self, byte: u8) -> io::Result<()> {
        self.append(&[byte])
    }

    /// Announce `additional` forthcoming bytes so the target can be
    /// pre-sized. No-op where pre-sizing does not apply.
    fn reserve_additional(&mut self, additional: u64) -> io::Result<()>;

    /// Reset the write position to zero, discarding written content.
    fn clear(&mut self) -> io::Result<()>;

    /// Bytes written so far (the current position).
    fn size(&self) -> u64;
}

/// Sink writing straight to a regular file or block device.
///
/// Writes are unbuffered; when the target is a block device they land on
/// the device directly. Partial output stays on disk when the sink is
/// dropped early — safe, because the target is always the inactive slot.
pub struct FileSink {
    file: File,
    path: PathBuf,
    pos: u64,
    is_block: bool,
}

impl FileSink {
    /// Open `path` for writing from position zero.
    ///
    /// Regular files are created if missing and truncated; block devices
    /// are written in place.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).create(true).open(path)?;

        let is_block = file.metadata()?.file_type().is_block_device();
        if !is_block {
            file.set_len(0)?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            pos: 0,
            is_block,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UpdateSink for FileSink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    fn reserve_additional(&mut self, additional: u64) -> io::Result<()> {
        if !self.is_block {
            self.file.set_len(self.pos + additional)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        if !self.is_block {
            self.file.set_len(0)?;
        }
        self.pos = 0;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.pos
    }
}

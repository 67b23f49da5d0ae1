// src/image/reader.rs

//! Image framing and read-only mapping
//!
//! An image's *logical* size — the byte range actually covered by its
//! content — is usually smaller than the partition that holds it. The
//! logical range is what gets hashed and what serves as the delta
//! dictionary, so both framings are parsed here: the SquashFS superblock
//! and the Android boot-image header, all fields little-endian.

use crate::error::{Error, Result};
use crate::image::ImageKind;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::warn;

/// SquashFS superblock magic ("hsqs" little-endian).
const SQUASHFS_MAGIC: u32 = 0x7371_7368;

/// SquashFS images are padded to 4 KiB device blocks.
const SQUASHFS_PAD: u64 = 4096;

/// Bytes of the SquashFS superblock up to and including `bytes_used`.
const SQUASHFS_HEADER_LEN: usize = 48;

/// Android boot-image magic words ("ANDR", "OID!").
const BOOTIMG_MAGIC_1: u32 = 0x5244_4e41;
const BOOTIMG_MAGIC_2: u32 = 0x2144_494f;

/// Bytes of the Android boot header through `dtb_size`.
const BOOTIMG_HEADER_LEN: usize = 44;

/// On-disk size of the full Android boot header, page-aligned like the
/// sections that follow it.
const BOOTIMG_HEADER_SIZE: u64 = 608;

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Read-only view of one system image.
///
/// Opening parses the framing header, computes the logical size, checks it
/// against the underlying file or device size and maps the logical range.
/// The mapping stays valid for the reader's lifetime, which must outlast any
/// delta decoding that uses it as a dictionary.
pub struct ImageReader {
    path: PathBuf,
    kind: ImageKind,
    logical_size: u64,
    map: Mmap,
}

impl ImageReader {
    /// Open `path` and parse it as `kind`.
    ///
    /// Fails on open errors, short or malformed headers, unsupported file
    /// types, and images whose logical size exceeds the underlying size.
    pub fn open(kind: ImageKind, path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| Error::ImageError(format!("Unable to open {}: {e}", path.display())))?;

        let logical_size = match kind {
            ImageKind::SquashFs => {
                let mut header = [0u8; SQUASHFS_HEADER_LEN];
                read_header(&mut file, &mut header, path)?;
                squashfs_logical_size(&header)?
            }
            ImageKind::AndroidBoot => {
                let mut header = [0u8; BOOTIMG_HEADER_LEN];
                read_header(&mut file, &mut header, path)?;
                bootimg_logical_size(&header)?
            }
        };

        if logical_size == 0 {
            return Err(Error::ImageError(format!(
                "Image {} reports empty content",
                path.display()
            )));
        }

        let underlying = underlying_size(&file, path)?;
        if logical_size > underlying {
            warn!(
                "Reported image size {} exceeds size {} of {}",
                logical_size,
                underlying,
                path.display()
            );
            return Err(Error::ImageError(format!(
                "Image {} larger than its underlying storage",
                path.display()
            )));
        }

        let map = unsafe { MmapOptions::new().len(logical_size as usize).map(&file) }
            .map_err(|e| Error::ImageError(format!("Unable to map {}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            logical_size,
            map,
        })
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical image size in bytes; always the length of [`Self::bytes`].
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    /// The image content as one contiguous read-only slice.
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }
}

fn read_header(file: &mut File, buf: &mut [u8], path: &Path) -> Result<()> {
    file.read_exact(buf).map_err(|e| {
        Error::ImageError(format!("Unable to read header of {}: {e}", path.display()))
    })
}

fn le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn le64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn align_to(n: u64, alignment: u64) -> u64 {
    n.div_ceil(alignment) * alignment
}

/// Logical size from a SquashFS superblock: `bytes_used` rounded up to the
/// 4 KiB padding the image is written with.
fn squashfs_logical_size(header: &[u8; SQUASHFS_HEADER_LEN]) -> Result<u64> {
    if le32(header, 0) != SQUASHFS_MAGIC {
        return Err(Error::ImageError(
            "Wrong superblock magic in squashfs image".to_string(),
        ));
    }

    // bytes_used sits after five u32s, six u16s and the root inode ref.
    let bytes_used = le64(header, 40);
    Ok(align_to(bytes_used, SQUASHFS_PAD))
}

/// Logical size from an Android boot header: header plus each section,
/// individually aligned to the image's page size.
fn bootimg_logical_size(header: &[u8; BOOTIMG_HEADER_LEN]) -> Result<u64> {
    if le32(header, 0) != BOOTIMG_MAGIC_1 || le32(header, 4) != BOOTIMG_MAGIC_2 {
        return Err(Error::ImageError(
            "Wrong magic in Android boot image".to_string(),
        ));
    }

    let kernel_size = le32(header, 8) as u64;
    let initrd_size = le32(header, 16) as u64;
    let second_size = le32(header, 24) as u64;
    let page_size = le32(header, 36) as u64;
    let dtb_size = le32(header, 40) as u64;

    if page_size == 0 {
        return Err(Error::ImageError(
            "Android boot image reports zero page size".to_string(),
        ));
    }

    Ok(align_to(BOOTIMG_HEADER_SIZE, page_size)
        + align_to(kernel_size, page_size)
        + align_to(initrd_size, page_size)
        + align_to(second_size, page_size)
        + align_to(dtb_size, page_size))
}

/// Size of the storage behind `file`: the length for regular files, the
/// `BLKGETSIZE64` answer for block devices. Anything else is rejected.
fn underlying_size(file: &File, path: &Path) -> Result<u64> {
    let metadata = file
        .metadata()
        .map_err(|e| Error::ImageError(format!("Unable to stat {}: {e}", path.display())))?;

    let file_type = metadata.file_type();
    if file_type.is_file() {
        Ok(metadata.len())
    } else if file_type.is_block_device() {
        let mut size: u64 = 0;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(|e| {
            Error::ImageError(format!(
                "Unable to query device size of {}: {e}",
                path.display()
            ))
        })?;
        Ok(size)
    } else {
        Err(Error::ImageError(format!(
            "Unsupported file type of {}",
            path.display()
        )))
    }
}

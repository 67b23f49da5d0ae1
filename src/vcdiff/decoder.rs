// src/vcdiff/decoder.rs

//! Incremental VCDIFF window decoder
//!
//! Input bytes are buffered until a complete window is available, the
//! window is decoded into a scratch buffer, and the result is appended to
//! the sink. Partial input at any boundary simply waits for the next
//! chunk; corruption is distinguished from incompleteness because section
//! lengths are known before a window is decoded.

use crate::image::UpdateSink;
use crate::vcdiff::code_table::{CodeTable, InstKind, COPY_MODES};
use crate::vcdiff::DecodeError;

const MAGIC: [u8; 3] = [0xd6, 0xc3, 0xc4];

/// Version bytes we accept: RFC 3284 proper and the open-vcdiff 'S' variant.
const VERSION_RFC: u8 = 0x00;
const VERSION_SDCH: u8 = b'S';

const VCD_DECOMPRESS: u8 = 0x01;
const VCD_CODETABLE: u8 = 0x02;
const VCD_APPHEADER: u8 = 0x04;

const VCD_SOURCE: u8 = 0x01;
const VCD_TARGET: u8 = 0x02;
const VCD_CHECKSUM: u8 = 0x04;

/// Near cache slots and same cache rows of the default address cache.
const NEAR_SLOTS: usize = 4;
const SAME_ROWS: usize = 3;

/// Returns from an incremental parse attempt: not enough input yet.
macro_rules! need {
    ($expr:expr) => {
        match $expr {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

/// Streaming decoder over a fixed dictionary.
///
/// Feed body chunks with [`decode_chunk`](Self::decode_chunk) as they
/// arrive, then call [`finish`](Self::finish) at end of stream. Any error
/// is terminal for the stream; callers abort the transfer.
pub struct StreamingDecoder<'d> {
    dict: &'d [u8],
    buf: Vec<u8>,
    header_done: bool,
    max_target_size: u64,
    total_out: u64,
    windows: u64,
}

impl<'d> StreamingDecoder<'d> {
    /// Create a decoder with `dict` as the copy source.
    pub fn new(dict: &'d [u8]) -> Self {
        Self {
            dict,
            buf: Vec::new(),
            header_done: false,
            max_target_size: super::MAX_TARGET_SIZE,
            total_out: 0,
            windows: 0,
        }
    }

    /// Lower (or raise) the reconstructed-target size cap.
    pub fn with_max_target_size(mut self, limit: u64) -> Self {
        self.max_target_size = limit;
        self
    }

    /// Bytes emitted to the sink so far.
    pub fn decoded_len(&self) -> u64 {
        self.total_out
    }

    /// Windows decoded so far.
    pub fn windows(&self) -> u64 {
        self.windows
    }

    /// Consume one chunk of patch bytes, emitting any completed windows.
    pub fn decode_chunk(
        &mut self,
        input: &[u8],
        sink: &mut dyn UpdateSink,
    ) -> Result<(), DecodeError> {
        self.buf.extend_from_slice(input);
        self.drain_windows(sink)
    }

    /// Signal end of stream. Fails if the stream stopped mid-header or
    /// mid-window. Returns the total number of decoded bytes.
    pub fn finish(mut self, sink: &mut dyn UpdateSink) -> Result<u64, DecodeError> {
        self.drain_windows(sink)?;

        if !self.header_done || !self.buf.is_empty() {
            return Err(DecodeError::Truncated);
        }

        Ok(self.total_out)
    }

    fn drain_windows(&mut self, sink: &mut dyn UpdateSink) -> Result<(), DecodeError> {
        let mut consumed = 0;

        loop {
            let mut reader = ByteReader::new(&self.buf[consumed..]);

            if !self.header_done {
                match parse_header(&mut reader)? {
                    None => break,
                    Some(()) => {
                        self.header_done = true;
                        consumed += reader.pos;
                        continue;
                    }
                }
            }

            match decode_window(&mut reader, self.dict, self.total_out, self.max_target_size)? {
                None => break,
                Some(window) => {
                    consumed += reader.pos;
                    self.total_out += window.len() as u64;
                    self.windows += 1;

                    sink.reserve_additional(window.len() as u64)?;
                    sink.append(&window)?;
                }
            }
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }

        Ok(())
    }
}

/// Parse the stream header. `Ok(None)` means more input is needed.
fn parse_header(reader: &mut ByteReader<'_>) -> Result<Option<()>, DecodeError> {
    for expected in MAGIC {
        let byte = need!(reader.u8());
        if byte != expected {
            return Err(DecodeError::InvalidMagic);
        }
    }

    let version = need!(reader.u8());
    if version != VERSION_RFC && version != VERSION_SDCH {
        return Err(DecodeError::Unsupported("stream version"));
    }

    let indicator = need!(reader.u8());
    if indicator & VCD_DECOMPRESS != 0 {
        return Err(DecodeError::Unsupported("secondary compression"));
    }
    if indicator & VCD_CODETABLE != 0 {
        return Err(DecodeError::Unsupported("application-defined code table"));
    }
    if indicator & VCD_APPHEADER != 0 {
        let len = need!(reader.varint()?);
        need!(reader.take(len as usize));
    }

    Ok(Some(()))
}

/// Parse and decode one window. `Ok(None)` means more input is needed;
/// errors are definitive corruption regardless of further input.
fn decode_window(
    reader: &mut ByteReader<'_>,
    dict: &[u8],
    total_out: u64,
    max_target_size: u64,
) -> Result<Option<Vec<u8>>, DecodeError> {
    let win_indicator = need!(reader.u8());

    if win_indicator & VCD_TARGET != 0 {
        return Err(DecodeError::Unsupported("copy window from target"));
    }

    let source: &[u8] = if win_indicator & VCD_SOURCE != 0 {
        let len = need!(reader.varint()?);
        let pos = need!(reader.varint()?);
        let end = pos
            .checked_add(len)
            .ok_or(DecodeError::Corrupt("source segment overflow"))?;
        if end > dict.len() as u64 {
            return Err(DecodeError::Corrupt("source segment outside dictionary"));
        }
        &dict[pos as usize..end as usize]
    } else {
        &[]
    };

    let delta_len = need!(reader.varint()?);
    let body = need!(reader.take(delta_len as usize));

    // The whole window is buffered now; from here on, running out of bytes
    // is corruption, not incompleteness.
    let mut body_reader = ByteReader::new(body);

    let target_len = body_reader
        .varint()?
        .ok_or(DecodeError::Corrupt("window header"))? as usize;

    let delta_indicator = body_reader
        .u8()
        .ok_or(DecodeError::Corrupt("window header"))?;
    if delta_indicator != 0 {
        return Err(DecodeError::Unsupported("per-section compression"));
    }

    let data_len = body_reader
        .varint()?
        .ok_or(DecodeError::Corrupt("window header"))? as usize;
    let inst_len = body_reader
        .varint()?
        .ok_or(DecodeError::Corrupt("window header"))? as usize;
    let addr_len = body_reader
        .varint()?
        .ok_or(DecodeError::Corrupt("window header"))? as usize;

    let checksum = if win_indicator & VCD_CHECKSUM != 0 {
        let bytes = body_reader
            .take(4)
            .ok_or(DecodeError::Corrupt("window checksum"))?;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    } else {
        None
    };

    let data = body_reader
        .take(data_len)
        .ok_or(DecodeError::Corrupt("data section"))?;
    let inst = body_reader
        .take(inst_len)
        .ok_or(DecodeError::Corrupt("instruction section"))?;
    let addr = body_reader
        .take(addr_len)
        .ok_or(DecodeError::Corrupt("address section"))?;

    if body_reader.remaining() != 0 {
        return Err(DecodeError::Corrupt("trailing bytes in window"));
    }

    if total_out + target_len as u64 > max_target_size {
        return Err(DecodeError::TargetTooLarge {
            limit: max_target_size,
        });
    }

    let window = run_instructions(source, target_len, data, inst, addr)?;

    if let Some(expected) = checksum {
        if adler32(&window) != expected {
            return Err(DecodeError::ChecksumMismatch);
        }
    }

    Ok(Some(window))
}

/// Execute a window's instruction stream into a fresh buffer.
fn run_instructions(
    source: &[u8],
    target_len: usize,
    data: &[u8],
    inst: &[u8],
    addr: &[u8],
) -> Result<Vec<u8>, DecodeError> {
    let table = CodeTable::default_table();
    let mut cache = AddrCache::new();

    let mut out = Vec::with_capacity(target_len);
    let mut data_reader = ByteReader::new(data);
    let mut inst_reader = ByteReader::new(inst);
    let mut addr_reader = ByteReader::new(addr);

    while let Some(code) = inst_reader.u8() {
        for half in table.get(code) {
            if half.kind == InstKind::NoOp {
                continue;
            }

            let size = if half.size == 0 {
                inst_reader
                    .varint()?
                    .ok_or(DecodeError::Corrupt("instruction size"))? as usize
            } else {
                half.size as usize
            };

            match half.kind {
                InstKind::Add => {
                    let bytes = data_reader
                        .take(size)
                        .ok_or(DecodeError::Corrupt("data section underrun"))?;
                    out.extend_from_slice(bytes);
                }
                InstKind::Run => {
                    let byte = data_reader
                        .u8()
                        .ok_or(DecodeError::Corrupt("data section underrun"))?;
                    out.resize(out.len() + size, byte);
                }
                InstKind::Copy => {
                    let here = (source.len() + out.len()) as u64;
                    let addr = cache.decode(&mut addr_reader, here, half.mode)?;

                    // The copy may run past `here` into bytes it is itself
                    // producing, so it has to go byte by byte.
                    for i in 0..size as u64 {
                        let at = (addr + i) as usize;
                        let byte = if at < source.len() {
                            source[at]
                        } else {
                            *out.get(at - source.len())
                                .ok_or(DecodeError::Corrupt("copy past produced output"))?
                        };
                        out.push(byte);
                    }
                }
                InstKind::NoOp => unreachable!(),
            }
        }
    }

    if out.len() != target_len {
        return Err(DecodeError::Corrupt("target window size mismatch"));
    }
    if data_reader.remaining() != 0 || addr_reader.remaining() != 0 {
        return Err(DecodeError::Corrupt("unconsumed section bytes"));
    }

    Ok(out)
}

/// RFC 3284 §5.3 address cache: four near slots, three same rows.
struct AddrCache {
    near: [u64; NEAR_SLOTS],
    next_near: usize,
    same: [u64; SAME_ROWS * 256],
}

impl AddrCache {
    fn new() -> Self {
        Self {
            near: [0; NEAR_SLOTS],
            next_near: 0,
            same: [0; SAME_ROWS * 256],
        }
    }

    fn decode(
        &mut self,
        addr_reader: &mut ByteReader<'_>,
        here: u64,
        mode: u8,
    ) -> Result<u64, DecodeError> {
        let addr = match mode {
            0 => addr_reader
                .varint()?
                .ok_or(DecodeError::Corrupt("address section underrun"))?,
            1 => {
                let offset = addr_reader
                    .varint()?
                    .ok_or(DecodeError::Corrupt("address section underrun"))?;
                here.checked_sub(offset)
                    .ok_or(DecodeError::Corrupt("HERE address underflow"))?
            }
            m if m < 2 + NEAR_SLOTS as u8 => {
                let offset = addr_reader
                    .varint()?
                    .ok_or(DecodeError::Corrupt("address section underrun"))?;
                self.near[(m - 2) as usize]
                    .checked_add(offset)
                    .ok_or(DecodeError::Corrupt("NEAR address overflow"))?
            }
            m if m < COPY_MODES => {
                let index = addr_reader
                    .u8()
                    .ok_or(DecodeError::Corrupt("address section underrun"))?;
                self.same[(m as usize - 2 - NEAR_SLOTS) * 256 + index as usize]
            }
            _ => return Err(DecodeError::Corrupt("invalid copy mode")),
        };

        if addr >= here {
            return Err(DecodeError::Corrupt("copy address beyond write position"));
        }

        self.update(addr);
        Ok(addr)
    }

    fn update(&mut self, addr: u64) {
        self.near[self.next_near] = addr;
        self.next_near = (self.next_near + 1) % NEAR_SLOTS;
        self.same[(addr % (SAME_ROWS as u64 * 256)) as usize] = addr;
    }
}

/// Incremental byte/varint reader over a borrowed slice. `None` from any
/// accessor means the slice ran out.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Base-128 big-endian integer, continuation bit on all but the last
    /// byte. Capped at nine bytes, which covers 63 bits; anything longer
    /// is corrupt.
    fn varint(&mut self) -> Result<Option<u64>, DecodeError> {
        let mut value: u64 = 0;

        for _ in 0..9 {
            let byte = match self.u8() {
                Some(byte) => byte,
                None => return Ok(None),
            };
            value = (value << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
        }

        Err(DecodeError::Corrupt("oversized varint"))
    }
}

/// Adler-32 as used for VCDIFF window checksums.
pub(crate) fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    // Largest chunk for which the sums cannot overflow u32 before reduction.
    const NMAX: usize = 5552;

    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }

    (b << 16) | a
}

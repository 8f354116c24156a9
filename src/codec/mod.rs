//! Frame codec for compressed runs.
//!
//! Spilled runs may be stored compressed. The codec itself is snappy's raw
//! block format; this module only owns the framing around it.
//!
//! # On-disk layout
//!
//! ```text
//! [COMPRESSED_LEN_LE u32][SNAPPY_PAYLOAD]
//! [COMPRESSED_LEN_LE u32][SNAPPY_PAYLOAD]
//! ...
//! ```
//!
//! - Every frame holds at most [`MAX_CHUNK`] bytes of uncompressed input.
//! - Frames carry no line structure: a record may straddle two frames, the
//!   reader sees one continuous byte stream.
//! - A run file ending in the middle of a frame is corrupt.


use std::io::{self, Read, Write};

use snap::raw::{Decoder, Encoder, decompress_len, max_compress_len};
use thiserror::Error;

/// Largest uncompressed chunk fed to the compressor.
pub const MAX_CHUNK: usize = 64 * 1024;

/// Size of the little-endian length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// File name suffix of compressed runs.
pub const COMPRESSED_SUFFIX: &str = ".snappy";

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors raised while compressing or inflating frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload does not decode as snappy.
    #[error("corrupt frame: {0}")]
    Snappy(#[from] snap::Error),

    /// Declared uncompressed size does not fit the destination.
    #[error("corrupt frame: {needed} bytes do not fit a {available} byte buffer")]
    Overflow { needed: usize, available: usize },

    /// The stream ended inside a frame.
    #[error("corrupt frame: truncated after {0} bytes")]
    Truncated(usize),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Block primitives
// ------------------------------------------------------------------------------------------------

/// Compresses up to [`MAX_CHUNK`] bytes of `input` as one frame appended to
/// `out`. Returns how many input bytes were consumed.
pub fn compress(input: &[u8], out: &mut Vec<u8>) -> Result<usize, CodecError> {
    let take = input.len().min(MAX_CHUNK);
    let header_at = out.len();

    out.resize(header_at + FRAME_HEADER_LEN + max_compress_len(take), 0);
    let written =
        Encoder::new().compress(&input[..take], &mut out[header_at + FRAME_HEADER_LEN..])?;
    out.truncate(header_at + FRAME_HEADER_LEN + written);
    out[header_at..header_at + FRAME_HEADER_LEN].copy_from_slice(&(written as u32).to_le_bytes());

    Ok(take)
}

/// Inflates the first complete frame of `input` into `out`.
///
/// Returns `Ok(None)` when `input` does not yet hold a whole frame, or
/// `Ok(Some((consumed, produced)))` on success.
pub fn inflate(input: &[u8], out: &mut [u8]) -> Result<Option<(usize, usize)>, CodecError> {
    if input.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut prefix = [0u8; FRAME_HEADER_LEN];
    prefix.copy_from_slice(&input[..FRAME_HEADER_LEN]);
    let len = u32::from_le_bytes(prefix) as usize;
    if input.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    let payload = &input[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
    let produced = inflate_payload(payload, out)?;
    Ok(Some((FRAME_HEADER_LEN + len, produced)))
}

fn inflate_payload(payload: &[u8], out: &mut [u8]) -> Result<usize, CodecError> {
    let needed = decompress_len(payload)?;
    if needed > out.len() {
        return Err(CodecError::Overflow {
            needed,
            available: out.len(),
        });
    }
    Ok(Decoder::new().decompress(payload, out)?)
}

// ------------------------------------------------------------------------------------------------
// FrameWriter
// ------------------------------------------------------------------------------------------------

/// Streams bytes into [`MAX_CHUNK`]-sized frames.
pub struct FrameWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
    scratch: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(MAX_CHUNK),
            scratch: Vec::with_capacity(FRAME_HEADER_LEN + max_compress_len(MAX_CHUNK)),
        }
    }

    pub fn write_all(&mut self, mut bytes: &[u8]) -> Result<(), CodecError> {
        while !bytes.is_empty() {
            let room = MAX_CHUNK - self.pending.len();
            let take = room.min(bytes.len());
            self.pending.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.pending.len() == MAX_CHUNK {
                self.emit_frame()?;
            }
        }
        Ok(())
    }

    /// Writes any partial frame and returns the inner writer.
    pub fn finish(mut self) -> Result<W, CodecError> {
        if !self.pending.is_empty() {
            self.emit_frame()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn emit_frame(&mut self) -> Result<(), CodecError> {
        self.scratch.clear();
        compress(&self.pending, &mut self.scratch)?;
        self.inner.write_all(&self.scratch)?;
        self.pending.clear();
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FrameReader
// ------------------------------------------------------------------------------------------------

/// Reads frames from a byte stream and hands out their inflated content.
pub struct FrameReader<R: Read> {
    inner: R,
    payload: Vec<u8>,
    chunk: Vec<u8>,
    pos: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            payload: Vec::new(),
            chunk: Vec::new(),
            pos: 0,
        }
    }

    /// Copies inflated bytes into `out`. Returns 0 at a clean end of stream.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, CodecError> {
        if self.pos == self.chunk.len() && !self.next_frame()? {
            return Ok(0);
        }
        let n = out.len().min(self.chunk.len() - self.pos);
        out[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn next_frame(&mut self) -> Result<bool, CodecError> {
        loop {
            let mut prefix = [0u8; FRAME_HEADER_LEN];
            let got = read_full(&mut self.inner, &mut prefix)?;
            if got == 0 {
                return Ok(false);
            }
            if got < FRAME_HEADER_LEN {
                return Err(CodecError::Truncated(got));
            }

            let len = u32::from_le_bytes(prefix) as usize;
            self.payload.resize(len, 0);
            let got = read_full(&mut self.inner, &mut self.payload)?;
            if got < len {
                return Err(CodecError::Truncated(FRAME_HEADER_LEN + got));
            }

            self.chunk.resize(MAX_CHUNK, 0);
            let produced = inflate_payload(&self.payload, &mut self.chunk)?;
            self.chunk.truncate(produced);
            self.pos = 0;
            if produced > 0 {
                return Ok(true);
            }
        }
    }
}

/// Reads until `buf` is full or the stream ends. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

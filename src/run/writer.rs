//! Run writer: streams sorted lines into a new run file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::codec::FrameWriter;

use super::{Run, RunError};

const WRITE_BUFFER: usize = 128 * 1024;

enum Sink {
    Plain(BufWriter<File>),
    Framed(FrameWriter<BufWriter<File>>),
}

/// Writes one run file, plain or snappy-framed.
///
/// The caller is responsible for writing lines in key order; the writer
/// only frames bytes.
pub struct RunWriter {
    path: PathBuf,
    sink: Sink,
    bytes: u64,
}

impl RunWriter {
    pub fn create(path: PathBuf, compressed: bool) -> Result<Self, RunError> {
        let file = File::create(&path).map_err(RunError::io(&path))?;
        let out = BufWriter::with_capacity(WRITE_BUFFER, file);
        let sink = if compressed {
            Sink::Framed(FrameWriter::new(out))
        } else {
            Sink::Plain(out)
        };
        Ok(Self {
            path,
            sink,
            bytes: 0,
        })
    }

    /// Appends raw bytes, normally whole newline-terminated lines.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), RunError> {
        match &mut self.sink {
            Sink::Plain(out) => out.write_all(bytes).map_err(RunError::io(&self.path))?,
            Sink::Framed(out) => out.write_all(bytes)?,
        }
        self.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Appends `key '\t' value '\n'`, or `key '\n'` without a value.
    pub fn write_record(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), RunError> {
        self.write_all(key)?;
        if let Some(value) = value {
            self.write_all(b"\t")?;
            self.write_all(value)?;
        }
        self.write_all(b"\n")
    }

    /// Uncompressed bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Flushes everything and returns the finished run.
    pub fn finish(self) -> Result<Run, RunError> {
        let compressed = match self.sink {
            Sink::Plain(mut out) => {
                out.flush().map_err(RunError::io(&self.path))?;
                false
            }
            Sink::Framed(out) => {
                out.finish()?;
                true
            }
        };
        Ok(Run::File {
            path: self.path,
            compressed,
        })
    }
}

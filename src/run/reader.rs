//! Run reader: streams a sorted run line by line.
//!
//! The reader keeps a window `[start, end)` of raw (already inflated) bytes.
//! Once a whole line is inside the window its key and value boundaries are
//! recorded; [`RunReader::peek_key`] then returns the same key until the line
//! is consumed with [`RunReader::consume_value`] or
//! [`RunReader::consume_line`]. Slices handed out stay valid until the next
//! call that takes `&mut self`.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::codec::FrameReader;
use crate::key::KeyOrder;

use super::RunError;

const READ_BUFFER: usize = 128 * 1024;

enum Source {
    Plain(File),
    Framed(FrameReader<File>),
    Memory { data: Arc<[u8]>, pos: usize },
}

impl Source {
    fn read(&mut self, out: &mut [u8], path: &Option<PathBuf>) -> Result<usize, RunError> {
        match self {
            Source::Plain(file) => loop {
                match file.read(out) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(source) => {
                        return Err(RunError::Io {
                            path: path.clone().unwrap_or_default(),
                            source,
                        });
                    }
                }
            },
            Source::Framed(frames) => Ok(frames.read(out)?),
            Source::Memory { data, pos } => {
                let n = out.len().min(data.len() - *pos);
                out[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Line {
    start: usize,
    key_end: usize,
    value_start: usize,
    end: usize,
}

/// Streams one run, file- or memory-backed.
pub struct RunReader {
    source: Source,
    path: Option<PathBuf>,
    remove_when_done: bool,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    scanned: usize,
    line: Option<Line>,
    eof: bool,
    exhausted: bool,
}

impl RunReader {
    /// Opens a run file. With `remove_when_done` the file is deleted once
    /// the reader reaches its end.
    pub fn open(path: PathBuf, compressed: bool, remove_when_done: bool) -> Result<Self, RunError> {
        let file = File::open(&path).map_err(RunError::io(&path))?;
        let source = if compressed {
            Source::Framed(FrameReader::new(file))
        } else {
            Source::Plain(file)
        };
        Ok(Self::with_source(source, Some(path), remove_when_done))
    }

    /// Reads a merge cache block.
    pub fn from_memory(data: Arc<[u8]>) -> Self {
        Self::with_source(Source::Memory { data, pos: 0 }, None, false)
    }

    fn with_source(source: Source, path: Option<PathBuf>, remove_when_done: bool) -> Self {
        Self {
            source,
            path,
            remove_when_done,
            buf: vec![0; READ_BUFFER],
            start: 0,
            end: 0,
            scanned: 0,
            line: None,
            eof: false,
            exhausted: false,
        }
    }

    /// Key of the next line, or `None` at the end of the run.
    pub fn peek_key(&mut self) -> Result<Option<&[u8]>, RunError> {
        if !self.load_line()? {
            return Ok(None);
        }
        Ok(self.key())
    }

    /// Key of the line already loaded by [`peek_key`](Self::peek_key).
    pub fn key(&self) -> Option<&[u8]> {
        self.line.map(|l| &self.buf[l.start..l.key_end])
    }

    /// Compares the loaded key against `other` in job order.
    pub fn compare(&self, other: &[u8], order: &KeyOrder) -> Option<Ordering> {
        self.key().map(|k| order.compare(k, other))
    }

    /// Consumes the next line and returns its value (empty for key-only lines).
    pub fn consume_value(&mut self) -> Result<&[u8], RunError> {
        let line = self.take_line()?;
        Ok(&self.buf[line.value_start..line.end])
    }

    /// Consumes the next line and returns it whole, newline included.
    pub fn consume_line(&mut self) -> Result<&[u8], RunError> {
        let line = self.take_line()?;
        Ok(&self.buf[line.start..=line.end])
    }

    /// Whether the reader has hit the end of its run.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    fn take_line(&mut self) -> Result<Line, RunError> {
        if !self.load_line()? {
            return Err(self.corrupt("read past the end of the run"));
        }
        match self.line.take() {
            Some(line) => {
                self.start = line.end + 1;
                Ok(line)
            }
            None => Err(self.corrupt("line vanished while loading")),
        }
    }

    fn load_line(&mut self) -> Result<bool, RunError> {
        if self.line.is_some() {
            return Ok(true);
        }
        if self.exhausted {
            return Ok(false);
        }

        loop {
            if let Some(pos) = self.buf[self.scanned..self.end]
                .iter()
                .position(|&b| b == b'\n')
            {
                let end = self.scanned + pos;
                let key_end = self.buf[self.start..end]
                    .iter()
                    .position(|&b| b == b'\t')
                    .map_or(end, |p| self.start + p);
                if key_end == self.start {
                    return Err(self.corrupt("line without a key"));
                }
                let value_start = if key_end < end { key_end + 1 } else { end };

                self.line = Some(Line {
                    start: self.start,
                    key_end,
                    value_start,
                    end,
                });
                self.scanned = end + 1;
                return Ok(true);
            }
            self.scanned = self.end;

            if self.eof {
                if self.start < self.end {
                    return Err(self.corrupt("run does not end with a newline"));
                }
                self.finish();
                return Ok(false);
            }
            self.refill()?;
        }
    }

    fn refill(&mut self) -> Result<(), RunError> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.scanned -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            // A single line larger than the window.
            let grown = self.buf.len() * 2;
            self.buf.resize(grown, 0);
        }

        let n = self.source.read(&mut self.buf[self.end..], &self.path)?;
        if n == 0 {
            self.eof = true;
        }
        self.end += n;
        Ok(())
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.source = Source::Memory {
            data: Arc::from(Vec::new()),
            pos: 0,
        };
        if self.remove_when_done {
            if let Some(path) = &self.path {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to remove consumed run: {e}");
                }
            }
        }
    }

    fn corrupt(&self, reason: &str) -> RunError {
        let run = match &self.path {
            Some(path) => path.display().to_string(),
            None => "<memory>".to_string(),
        };
        RunError::Corrupt {
            run,
            reason: reason.to_string(),
        }
    }
}

//! Merge outputs: the shared preferred sink and the run collector.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, TryLockError};

use crate::Error;
use crate::mapreduce::{Emit, append_record, check_record};
use crate::run::{Run, RunWriter};

/// Reduced records are handed out in chunks of about this size.
pub const EMIT_CHUNK: usize = 64 * 1024;

// ------------------------------------------------------------------------------------------------
// PreferredOutput
// ------------------------------------------------------------------------------------------------

/// A final sink shared by concurrent bucket merges.
///
/// Writers never wait for it: [`try_write`](Self::try_write) either gets
/// the sink at once and writes a whole chunk, or reports `false` and the
/// caller keeps the chunk in its own run.
pub struct PreferredOutput<'w> {
    sink: Mutex<&'w mut (dyn Write + Send)>,
    written: AtomicU64,
    declined: AtomicU64,
}

impl<'w> PreferredOutput<'w> {
    pub fn new(sink: &'w mut (dyn Write + Send)) -> Self {
        Self {
            sink: Mutex::new(sink),
            written: AtomicU64::new(0),
            declined: AtomicU64::new(0),
        }
    }

    /// Writes `bytes` if the sink is free. `Ok(false)` if another merge
    /// holds it.
    pub fn try_write(&self, bytes: &[u8]) -> Result<bool, Error> {
        let mut sink = match self.sink.try_lock() {
            Ok(sink) => sink,
            Err(TryLockError::WouldBlock) => {
                self.declined.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
            Err(TryLockError::Poisoned(_)) => {
                return Err(Error::Internal("preferred output lock poisoned".into()));
            }
        };
        sink.write_all(bytes)?;
        self.written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(true)
    }

    /// Bytes written through this sink.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Chunks that found the sink busy.
    pub fn declined(&self) -> u64 {
        self.declined.load(Ordering::Relaxed)
    }
}

// ------------------------------------------------------------------------------------------------
// RunEmit
// ------------------------------------------------------------------------------------------------

/// Collects reduced records into a run, offering full chunks to a
/// [`PreferredOutput`] first.
pub struct RunEmit<'p, 'w> {
    writer: RunWriter,
    preferred: Option<&'p PreferredOutput<'w>>,
    chunk: Vec<u8>,
    records: u64,
}

impl<'p, 'w> RunEmit<'p, 'w> {
    pub fn new(writer: RunWriter, preferred: Option<&'p PreferredOutput<'w>>) -> Self {
        Self {
            writer,
            preferred,
            chunk: Vec::with_capacity(EMIT_CHUNK),
            records: 0,
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes the last chunk and closes the run.
    pub fn finish(mut self) -> Result<Run, Error> {
        self.flush_chunk()?;
        Ok(self.writer.finish()?)
    }

    fn push(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        check_record(key, value)?;
        append_record(&mut self.chunk, key, value);
        self.records += 1;
        if self.chunk.len() >= EMIT_CHUNK {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<(), Error> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let taken = match self.preferred {
            Some(preferred) => preferred.try_write(&self.chunk)?,
            None => false,
        };
        if !taken {
            self.writer.write_all(&self.chunk)?;
        }
        self.chunk.clear();
        Ok(())
    }
}

impl Emit for RunEmit<'_, '_> {
    fn emit(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.push(key, Some(value))
    }

    fn emit_key(&mut self, key: &[u8]) -> Result<(), Error> {
        self.push(key, None)
    }
}

//! The user-facing job contract.
//!
//! A job is a type implementing [`MapReducer`]. The engine calls
//! [`MapReducer::map`] once per input line from the sort workers, and
//! [`MapReducer::reduce`] once per distinct key during the merge phase.
//! Both hand their output to an [`Emit`] collector; the engine never looks
//! inside keys or values beyond the record format rules below.
//!
//! # Record format
//!
//! - keys must be non-empty and contain neither `'\t'` nor `'\n'`;
//! - values must not contain `'\n'`.
//!
//! Violations are reported as [`Error::InvalidRecord`].
//!
//! # Ordering
//!
//! Values of one key reach `reduce` grouped, but in no particular order:
//! when several runs hold the same key the order in which they are drained
//! is unspecified.

use std::io::{self, Write};

use crate::Error;
use crate::key::{Key, KeyType};
use crate::merge::Values;

/// Collector for records produced by `map` or `reduce`.
pub trait Emit {
    /// Emits `key '\t' value`.
    fn emit(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Emits a key-only record.
    fn emit_key(&mut self, key: &[u8]) -> Result<(), Error>;
}

/// A pluggable map/reduce job.
pub trait MapReducer: Send + Sync {
    /// Interpretation of every key this job emits.
    fn key_type(&self) -> KeyType;

    /// Whether `reduce` may run on partial groups and again on its own
    /// output. Enables reduction during intermediate merges.
    fn can_combine(&self) -> bool {
        false
    }

    /// Maps one input line (without its line terminator).
    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error>;

    /// Reduces all values of `key`.
    ///
    /// Values left unread are skipped by the engine.
    fn reduce(&self, key: Key<'_>, values: &mut Values<'_>, out: &mut dyn Emit)
    -> Result<(), Error>;
}

/// Checks a record against the line format.
pub(crate) fn check_record(key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::InvalidRecord("empty key".into()));
    }
    if let Some(pos) = key.iter().position(|&b| b == b'\t' || b == b'\n') {
        return Err(Error::InvalidRecord(format!(
            "key {:?} contains a separator at byte {pos}",
            String::from_utf8_lossy(key)
        )));
    }
    if let Some(value) = value {
        if value.contains(&b'\n') {
            return Err(Error::InvalidRecord(format!(
                "value of key {:?} contains a newline",
                String::from_utf8_lossy(key)
            )));
        }
    }
    Ok(())
}

/// Writes one record line.
pub(crate) fn write_record<W: Write + ?Sized>(
    out: &mut W,
    key: &[u8],
    value: Option<&[u8]>,
) -> io::Result<()> {
    out.write_all(key)?;
    if let Some(value) = value {
        out.write_all(b"\t")?;
        out.write_all(value)?;
    }
    out.write_all(b"\n")
}

/// Appends one record line to `buf`.
pub(crate) fn append_record(buf: &mut Vec<u8>, key: &[u8], value: Option<&[u8]>) {
    buf.extend_from_slice(key);
    if let Some(value) = value {
        buf.push(b'\t');
        buf.extend_from_slice(value);
    }
    buf.push(b'\n');
}

// ------------------------------------------------------------------------------------------------
// Collectors
// ------------------------------------------------------------------------------------------------

/// Collects records into memory. Handy for unit-testing a job.
#[derive(Debug, Default)]
pub struct VecEmit {
    pub records: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl VecEmit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Emit for VecEmit {
    fn emit(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        check_record(key, Some(value))?;
        self.records.push((key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    fn emit_key(&mut self, key: &[u8]) -> Result<(), Error> {
        check_record(key, None)?;
        self.records.push((key.to_vec(), None));
        Ok(())
    }
}

/// Writes records straight to a byte sink.
pub(crate) struct WriteEmit<'w> {
    out: &'w mut dyn Write,
}

impl<'w> WriteEmit<'w> {
    pub(crate) fn new(out: &'w mut dyn Write) -> Self {
        Self { out }
    }
}

impl Emit for WriteEmit<'_> {
    fn emit(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        check_record(key, Some(value))?;
        write_record(&mut *self.out, key, Some(value))?;
        Ok(())
    }

    fn emit_key(&mut self, key: &[u8]) -> Result<(), Error> {
        check_record(key, None)?;
        write_record(&mut *self.out, key, None)?;
        Ok(())
    }
}

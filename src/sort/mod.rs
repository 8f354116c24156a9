//! Sort phase: per-bucket sort buffers that spill sorted runs.
//!
//! ## Design Overview
//!
//! Every worker owns one [`Sorter`] per bucket. A sorter accumulates mapped
//! records in a [`SortBuffer`]; when the buffer is full it sorts the index
//! and spills the records as a run, either into the worker's
//! [`MergeCache`] (a memory block) when the cache has room, or into a new
//! run file.
//!
//! The first overflow of a sorter is special: the buffer measures how many
//! record bytes each index slot actually needed, spills, and re-splits its
//! budget at that ratio. Later overflows only spill.
//!
//! ## Concurrency Model
//!
//! Sorters and caches are owned by a single worker thread and never shared.

pub mod buffer;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::debug;

use crate::Error;
use crate::run::{Run, RunSettings, RunWriter, sort_run_path};

pub use buffer::{INDEX_ENTRY_SIZE, INITIAL_RATIO, IndexEntry, SortBuffer};

// ------------------------------------------------------------------------------------------------
// MergeCache
// ------------------------------------------------------------------------------------------------

/// Per-worker byte budget for keeping spilled runs in memory.
#[derive(Debug)]
pub struct MergeCache {
    capacity: usize,
    used: usize,
}

impl MergeCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    /// A cache that never accepts anything.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Claims `bytes` of the budget if they fit.
    pub fn try_reserve(&mut self, bytes: usize) -> bool {
        if bytes == 0 || self.used + bytes > self.capacity {
            return false;
        }
        self.used += bytes;
        true
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ------------------------------------------------------------------------------------------------
// Sorter
// ------------------------------------------------------------------------------------------------

/// Sort buffer of one (worker, bucket) pair and the runs it has produced.
pub struct Sorter {
    buffer: SortBuffer,
    settings: Arc<RunSettings>,
    bucket: usize,
    worker: usize,
    seq: u64,
    runs: Vec<Run>,
    spilled: usize,
    cached: usize,
}

impl Sorter {
    /// Creates a sorter with a `budget`-byte sort buffer.
    pub fn new(
        settings: Arc<RunSettings>,
        budget: usize,
        bucket: usize,
        worker: usize,
    ) -> Result<Self, Error> {
        let buffer = SortBuffer::new(budget, INITIAL_RATIO).ok_or_else(|| {
            Error::ResourceExhausted(format!(
                "sort buffer of {budget} bytes cannot hold a single record"
            ))
        })?;
        Ok(Self {
            buffer,
            settings,
            bucket,
            worker,
            seq: 0,
            runs: Vec::new(),
            spilled: 0,
            cached: 0,
        })
    }

    /// Adds one record, spilling first if the buffer is full.
    pub fn add(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
        cache: &mut MergeCache,
    ) -> Result<(), Error> {
        let len = key.len() + value.map_or(0, |v| v.len() + 1) + 1;

        if self.buffer.would_overflow(len) {
            if !self.buffer.is_tuned() && !self.buffer.is_empty() {
                let ratio = self.buffer.ideal_ratio();
                self.flush(cache)?;
                self.buffer.tune(ratio);
                debug!(
                    bucket = self.bucket,
                    worker = self.worker,
                    ratio,
                    data_capacity = self.buffer.data_capacity(),
                    index_capacity = self.buffer.index_capacity(),
                    "sort buffer retuned"
                );
            } else {
                self.flush(cache)?;
            }

            if self.buffer.would_overflow(len) {
                return Err(Error::ResourceExhausted(format!(
                    "record of {len} bytes does not fit a {} byte sort buffer",
                    self.buffer.data_capacity()
                )));
            }
        }

        if !self.buffer.add_key_value(key, value) {
            return Err(Error::Internal(format!(
                "sort buffer refused a {len} byte record after making room"
            )));
        }
        Ok(())
    }

    /// Sorts and spills the buffered records, if any.
    pub fn flush(&mut self, cache: &mut MergeCache) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort(self.settings.order);

        let records = self.buffer.entries();
        let bytes = self.buffer.bytes_used();
        if cache.try_reserve(bytes) {
            let block: Arc<[u8]> = Arc::from(self.buffer.to_sorted_bytes());
            self.runs.push(Run::Memory(block));
            self.cached += 1;
            debug!(bucket = self.bucket, records, bytes, "sort buffer cached");
        } else {
            let path = sort_run_path(&self.settings, self.bucket, self.worker, self.seq);
            let mut writer = RunWriter::create(path, self.settings.compressed)?;
            for line in self.buffer.lines() {
                writer.write_all(line)?;
            }
            let run = writer.finish()?;
            debug!(path = ?run.path(), records, bytes, "sort buffer spilled");
            self.runs.push(run);
            self.spilled += 1;
        }

        self.seq += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Hands over every run produced so far.
    pub fn grab_runs(&mut self) -> Vec<Run> {
        std::mem::take(&mut self.runs)
    }

    pub fn buffer(&self) -> &SortBuffer {
        &self.buffer
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Runs written to disk so far.
    pub fn spilled(&self) -> usize {
        self.spilled
    }

    /// Runs kept in the merge cache so far.
    pub fn cached(&self) -> usize {
        self.cached
    }
}

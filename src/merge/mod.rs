//! Merge phase: k-way merging of sorted runs.
//!
//! ## Design Overview
//!
//! A [`Merger`] owns a queue of runs and a fan-in limit: it never opens
//! more than `fan_in` runs at once. Readers sit in a [`BinaryHeap`] keyed by
//! their next key, so the head of the heap is always the reader whose key
//! comes first in job order (ascending or descending).
//!
//! Three ways to finish a merge:
//!
//! - [`Merger::merge_to_output`]: the terminal merge. Every distinct key is
//!   handed once to [`MapReducer::reduce`] together with a [`Values`]
//!   cursor over all its values, and the output goes to the final sink.
//! - [`Merger::merge_to_single`]: everything ends up in one run. With
//!   `reduce` the final pass groups and reduces; with a
//!   [`PreferredOutput`] the reduced records may skip the run and go
//!   straight to the shared sink.
//! - [`Merger::merge_to_max_files`]: plain copy passes until at most
//!   `max_files` runs are left. Never reduces.
//!
//! ## Passes
//!
//! While more runs are queued than the target allows, runs are taken from
//! the front of the queue, merged into a new run, and the result is
//! appended to the back, so every input run is merged once before any
//! merged run is merged again. Each merge takes just enough runs to reach
//! the target, never more than `fan_in`, so the count shrinks by at least
//! one per merge. Intermediate merges only reduce when the job is a
//! combiner.
//!
//! ## Guarantees
//!
//! - All records with one key leave a merge contiguously.
//! - Records with equal keys from different runs come out in no particular
//!   order.
//! - Every consumed run file is deleted unless the job keeps temporary files.

pub mod output;

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::io::Write;

use tracing::{debug, info};

use crate::Error;
use crate::key::{Key, KeyOrder};
use crate::mapreduce::{Emit, MapReducer, WriteEmit};
use crate::run::{Run, RunReader, RunSettings, RunWriter, merge_run_path};

pub use output::{PreferredOutput, RunEmit};

// ------------------------------------------------------------------------------------------------
// Heap entry
// ------------------------------------------------------------------------------------------------

/// A reader with a loaded line, ordered by that line's key.
struct HeapEntry {
    reader: RunReader,
    order: KeyOrder,
}

impl HeapEntry {
    /// Opens `run` and loads its first line. `None` for an empty run.
    fn open(run: Run, settings: &RunSettings) -> Result<Option<Self>, Error> {
        let mut reader = run.open(settings)?;
        if reader.peek_key()?.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            reader,
            order: settings.order,
        }))
    }

    fn key(&self) -> &[u8] {
        self.reader.key().unwrap_or_default()
    }
}

impl Ord for HeapEntry {
    /// Reversed so the max-heap pops the key that comes first in job order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.compare(self.key(), other.key()).reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

fn open_heap(runs: Vec<Run>, settings: &RunSettings) -> Result<BinaryHeap<HeapEntry>, Error> {
    let mut heap = BinaryHeap::with_capacity(runs.len());
    for run in runs {
        if let Some(entry) = HeapEntry::open(run, settings)? {
            heap.push(entry);
        }
    }
    Ok(heap)
}

// ------------------------------------------------------------------------------------------------
// Values
// ------------------------------------------------------------------------------------------------

enum Head {
    Same,
    Moved,
    Exhausted,
}

/// Cursor over every value of one key, across all merged runs.
///
/// Values are handed out as borrowed slices valid until the next call.
pub struct Values<'a> {
    heap: &'a mut BinaryHeap<HeapEntry>,
    current: Option<HeapEntry>,
    key: &'a [u8],
    order: KeyOrder,
    done: bool,
}

impl<'a> Values<'a> {
    fn new(heap: &'a mut BinaryHeap<HeapEntry>, key: &'a [u8], order: KeyOrder) -> Self {
        Self {
            heap,
            current: None,
            key,
            order,
            done: false,
        }
    }

    /// Next value of the key, or `None` once all are consumed.
    pub fn next_value(&mut self) -> Result<Option<&[u8]>, Error> {
        if self.done {
            return Ok(None);
        }

        loop {
            if self.current.is_none() {
                let same = self
                    .heap
                    .peek()
                    .is_some_and(|e| self.order.same_key(e.key(), self.key));
                if !same {
                    self.done = true;
                    return Ok(None);
                }
                self.current = self.heap.pop();
            }

            let head = match self.current.as_mut() {
                None => Head::Exhausted,
                Some(entry) => match entry.reader.peek_key()? {
                    None => Head::Exhausted,
                    Some(k) if self.order.same_key(k, self.key) => Head::Same,
                    Some(_) => Head::Moved,
                },
            };

            match head {
                Head::Same => {
                    return match self.current.as_mut() {
                        Some(entry) => Ok(Some(entry.reader.consume_value()?)),
                        None => Err(Error::Internal("value cursor lost its reader".into())),
                    };
                }
                Head::Moved => {
                    if let Some(entry) = self.current.take() {
                        self.heap.push(entry);
                    }
                }
                Head::Exhausted => self.current = None,
            }
        }
    }

    /// Skips every value not consumed yet.
    pub fn drain(&mut self) -> Result<(), Error> {
        while self.next_value()?.is_some() {}
        Ok(())
    }

    /// Consumes the remaining values, counting them.
    pub fn count(&mut self) -> Result<u64, Error> {
        let mut n = 0;
        while self.next_value()?.is_some() {
            n += 1;
        }
        Ok(n)
    }
}

// ------------------------------------------------------------------------------------------------
// Merge loops
// ------------------------------------------------------------------------------------------------

/// Copies all lines in key order, keeping each key's lines together.
fn copy_sorted(heap: &mut BinaryHeap<HeapEntry>, out: &mut RunWriter) -> Result<(), Error> {
    while let Some(mut top) = heap.pop() {
        loop {
            let line = top.reader.consume_line()?;
            out.write_all(line)?;

            // Stay on this reader while it is not behind the next head.
            let next = match top.reader.peek_key()? {
                None => break,
                Some(key) => heap
                    .peek()
                    .map_or(Ordering::Less, |other| top.order.compare(key, other.key())),
            };
            if next == Ordering::Greater {
                heap.push(top);
                break;
            }
        }
    }
    Ok(())
}

/// Calls `reduce` once per distinct key. Returns the number of keys.
fn reduce_groups(
    heap: &mut BinaryHeap<HeapEntry>,
    reducer: &dyn MapReducer,
    order: KeyOrder,
    out: &mut dyn Emit,
) -> Result<u64, Error> {
    let mut key = Vec::new();
    let mut groups = 0;
    while let Some(top) = heap.peek() {
        key.clear();
        key.extend_from_slice(top.key());

        let mut values = Values::new(heap, &key, order);
        reducer.reduce(Key::new(&key, order.key_type), &mut values, out)?;
        values.drain()?;
        groups += 1;
    }
    Ok(groups)
}

// ------------------------------------------------------------------------------------------------
// Merger
// ------------------------------------------------------------------------------------------------

/// Merges a set of runs under a fan-in limit.
pub struct Merger<'a> {
    settings: &'a RunSettings,
    reducer: &'a dyn MapReducer,
    runs: VecDeque<Run>,
    fan_in: usize,
    id: usize,
    seq: u64,
    merges: usize,
}

impl<'a> Merger<'a> {
    /// `fan_in` is raised to 3, the smallest limit that still makes
    /// progress. `id` distinguishes the run files of concurrent mergers.
    pub fn new(
        settings: &'a RunSettings,
        reducer: &'a dyn MapReducer,
        runs: Vec<Run>,
        fan_in: usize,
        id: usize,
    ) -> Self {
        Self {
            settings,
            reducer,
            runs: runs.into(),
            fan_in: fan_in.max(3),
            id,
            seq: 0,
            merges: 0,
        }
    }

    /// Runs still queued.
    pub fn pending(&self) -> usize {
        self.runs.len()
    }

    /// k-way merges performed so far.
    pub fn merges(&self) -> usize {
        self.merges
    }

    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Terminal merge: reduces every key into `out`.
    pub fn merge_to_output(&mut self, out: &mut dyn Write) -> Result<(), Error> {
        self.converge(self.fan_in, self.reducer.can_combine())?;

        let runs: Vec<Run> = self.runs.drain(..).collect();
        self.log_merge(runs.len());
        let mut heap = open_heap(runs, self.settings)?;
        let mut emit = WriteEmit::new(out);
        let keys = reduce_groups(&mut heap, self.reducer, self.settings.order, &mut emit)?;
        self.merges += 1;
        debug!(merger = self.id, keys, "merged to output");
        Ok(())
    }

    /// Merges everything into one run.
    ///
    /// With `reduce`, the last pass calls the reducer once per key and, if
    /// `preferred` is given, tries to hand each reduced chunk to it before
    /// falling back to the run. Returns `None` when there was nothing to
    /// merge.
    pub fn merge_to_single(
        &mut self,
        reduce: bool,
        preferred: Option<&PreferredOutput<'_>>,
    ) -> Result<Option<Run>, Error> {
        if self.runs.is_empty() {
            return Ok(None);
        }
        if self.runs.len() == 1 && !reduce {
            return Ok(self.runs.pop_front());
        }

        self.converge(self.fan_in, reduce && self.reducer.can_combine())?;
        let runs: Vec<Run> = self.runs.drain(..).collect();
        let run = self.merge_batch(runs, reduce, preferred)?;
        Ok(Some(run))
    }

    /// Copy passes until at most `max_files` runs remain.
    pub fn merge_to_max_files(&mut self, max_files: usize) -> Result<Vec<Run>, Error> {
        self.converge(max_files.max(1), false)?;
        Ok(self.runs.drain(..).collect())
    }

    /// Merges batches from the front of the queue until `target` runs remain.
    fn converge(&mut self, target: usize, reduce: bool) -> Result<(), Error> {
        while self.runs.len() > target {
            let take = self.fan_in.min(self.runs.len() - target + 1);
            let batch: Vec<Run> = self.runs.drain(..take).collect();
            let run = self.merge_batch(batch, reduce, None)?;
            self.runs.push_back(run);
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        runs: Vec<Run>,
        reduce: bool,
        preferred: Option<&PreferredOutput<'_>>,
    ) -> Result<Run, Error> {
        self.log_merge(runs.len());

        let path = merge_run_path(self.settings, self.id, self.seq);
        self.seq += 1;
        let mut heap = open_heap(runs, self.settings)?;
        let writer = RunWriter::create(path, self.settings.compressed)?;

        let run = if reduce {
            let mut emit = RunEmit::new(writer, preferred);
            reduce_groups(&mut heap, self.reducer, self.settings.order, &mut emit)?;
            emit.finish()?
        } else {
            let mut writer = writer;
            copy_sorted(&mut heap, &mut writer)?;
            writer.finish()?
        };

        self.merges += 1;
        Ok(run)
    }

    fn log_merge(&self, batch: usize) {
        let left = self.runs.len();
        if self.settings.verbose {
            info!(merger = self.id, "merging {batch} runs, {left} left");
        } else {
            debug!(merger = self.id, "merging {batch} runs, {left} left");
        }
    }
}

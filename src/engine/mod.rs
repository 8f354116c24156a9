//! # Job engine
//!
//! Drives one map-reduce job from raw input to the final sink.
//!
//! ## Design Overview
//!
//! ```text
//! input ─▶ RecordBuffer ─▶ BufferExchange ─▶ worker × N ─▶ Sorter × N per worker
//!                                                             │ spilled runs
//!                                     bucket b: runs of every worker ◀┘
//!                                                             │
//!                                      Merger per bucket ─▶ (final Merger) ─▶ sink
//! ```
//!
//! The number of buckets equals the number of workers. Each worker owns one
//! [`Sorter`](crate::sort::Sorter) per bucket and routes every mapped record
//! by [`bucket_of`](crate::key::bucket_of), so all records of one key end up
//! in runs of the same bucket.
//!
//! ## Lifecycle
//!
//! ```text
//! Unprepared ─prepare_input─▶ Prepared ─provide_input_data─▶ Active
//!     │                                                       │ complete_input
//!     │ (reduce-only) reduce                                  ▼
//!     └──────────────────────────────────────────────────▶ Reducing ─reduce─▶ Done
//! ```
//!
//! Calling an operation in the wrong state fails with
//! [`Error::InvalidState`]. Any failure moves the engine to `Done`.
//!
//! ## Reduce phase
//!
//! - one non-empty bucket: a single terminal merge into the sink;
//! - sorted output: each bucket is merged concurrently (to one run for a
//!   combiner, else down to its share of the open-file budget) and one
//!   final merge orders everything into the sink;
//! - grouped output: each bucket is merged and reduced concurrently into a
//!   single run, handing chunks to a shared [`PreferredOutput`] when it is
//!   free; leftover runs are appended to the sink in bucket order.
//!
//! ## Concurrency Model
//!
//! Workers and the producer only share the exchange. Bucket merges run on
//! scoped threads pulling jobs from a channel; results are collected after
//! all of them finished and the first error, by bucket, is returned.
//!
//! ## Guarantees
//!
//! - No input line is split across two workers.
//! - The job directory is removed after the job or on failure, unless the
//!   job keeps temporary files or is map-only.

mod worker;

#[cfg(test)]
mod tests;

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel;
use tracing::{debug, info, warn};

use crate::buffer::RecordBuffer;
use crate::exchange::BufferExchange;
use crate::key::KeyOrder;
use crate::mapreduce::MapReducer;
use crate::merge::{Merger, PreferredOutput};
use crate::run::{Run, RunSettings, parse_sort_run_bucket};
use crate::sort::{INITIAL_RATIO, SortBuffer};
use crate::{Error, JobConfig};

use worker::{Worker, WorkerOutput};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unprepared,
    Prepared,
    Active,
    Reducing,
    Done,
}

/// Counters collected over a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    /// Input bytes handed to workers.
    pub input_bytes: u64,

    /// Records emitted by `map`.
    pub records_mapped: u64,

    /// Sort buffers spilled to run files.
    pub spilled_runs: usize,

    /// Sort buffers kept in the merge cache.
    pub cached_runs: usize,

    /// k-way merges performed.
    pub merge_passes: usize,
}

/// Runs one map-reduce job.
pub struct Engine {
    config: JobConfig,
    reducer: Arc<dyn MapReducer>,
    settings: Arc<RunSettings>,
    state: EngineState,
    exchange: Option<Arc<BufferExchange>>,
    workers: Vec<JoinHandle<Result<WorkerOutput, Error>>>,
    spare: Option<RecordBuffer>,
    buckets: Vec<Vec<Run>>,
    stats: JobStats,
    cleaned: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("dir", &self.settings.dir)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates `config` and creates the job directory.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for out-of-range settings, or a reduce-only
    /// job whose directory does not exist.
    pub fn new(config: JobConfig, reducer: Arc<dyn MapReducer>) -> Result<Self, Error> {
        config.validate()?;

        let dir = match &config.subdir {
            Some(subdir) => config.work_dir.join(subdir),
            None => config.work_dir.join(unique_job_name()),
        };
        if config.reduce_only {
            if !dir.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "reduce-only job directory {} does not exist",
                    dir.display()
                )));
            }
        } else {
            fs::create_dir_all(&dir)?;
        }

        let settings = Arc::new(RunSettings {
            dir,
            order: KeyOrder::new(reducer.key_type(), config.reverse_sort),
            compressed: config.compressed,
            keep_tmpfiles: config.keep_tmpfiles,
            verbose: config.verbose,
        });

        info!(
            dir = %settings.dir.display(),
            parallel = config.parallel,
            key_type = %reducer.key_type(),
            sorted = config.sort_output,
            "job started"
        );

        Ok(Self {
            config,
            reducer,
            settings,
            state: EngineState::Unprepared,
            exchange: None,
            workers: Vec::new(),
            spare: None,
            buckets: Vec::new(),
            stats: JobStats::default(),
            cleaned: false,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> JobStats {
        self.stats
    }

    /// Directory holding this job's runs.
    pub fn job_dir(&self) -> &Path {
        &self.settings.dir
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    // --------------------------------------------------------------------------------------------
    // Whole job
    // --------------------------------------------------------------------------------------------

    /// Runs the whole job: reads `input` to the end, maps it, and reduces
    /// into `sink` (skipped for map-only jobs; reduce-only jobs ignore
    /// `input`). A leading UTF-8 byte order mark is dropped.
    pub fn run(
        &mut self,
        input: &mut dyn Read,
        sink: &mut (dyn Write + Send),
    ) -> Result<JobStats, Error> {
        if self.config.reduce_only {
            self.reduce(sink)?;
            return Ok(self.stats);
        }

        let mut buffer = self.prepare_input()?;
        let mut bom_pending = true;
        loop {
            let n = match input.read(buffer.spare_mut()) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e.into())),
            };
            if n == 0 {
                break;
            }
            buffer.advance_end(n);

            if bom_pending {
                let data = buffer.data();
                if data.len() >= UTF8_BOM.len() {
                    if data.starts_with(UTF8_BOM) {
                        buffer.consume(UTF8_BOM.len());
                    }
                    bom_pending = false;
                } else if !UTF8_BOM.starts_with(data) {
                    bom_pending = false;
                }
            }

            if buffer.is_full() {
                // A full buffer without newline is fine only as the last line.
                if !buffer.data().contains(&b'\n') && self.input_ended(input)? {
                    break;
                }
                buffer = self.provide_input_data(buffer)?;
            }
        }

        self.complete_input(buffer)?;
        if !self.config.map_only {
            self.reduce(sink)?;
        }
        Ok(self.stats)
    }

    /// Reads one byte to tell whether `input` is exhausted. The byte is
    /// lost, so only call this when the job cannot go on otherwise.
    fn input_ended(&mut self, input: &mut dyn Read) -> Result<bool, Error> {
        let mut byte = [0u8; 1];
        loop {
            match input.read(&mut byte) {
                Ok(n) => return Ok(n == 0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e.into())),
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Input phase
    // --------------------------------------------------------------------------------------------

    /// Starts the workers and returns the first buffer to fill.
    pub fn prepare_input(&mut self) -> Result<RecordBuffer, Error> {
        self.expect_state(&[EngineState::Unprepared], "prepare_input")?;
        if self.config.reduce_only {
            return Err(Error::InvalidState(
                "reduce-only job takes no input".into(),
            ));
        }

        let parallel = self.config.parallel;
        let sorter_budget = self.config.buffer_size / (parallel * parallel);
        if SortBuffer::new(sorter_budget, INITIAL_RATIO).is_none() {
            return Err(Error::ResourceExhausted(format!(
                "buffer_size {} leaves {sorter_budget} bytes per sort buffer",
                self.config.buffer_size
            )));
        }
        let cache_size = if self.config.map_only {
            0
        } else {
            self.config.merge_cache_size
        };

        let exchange = Arc::new(BufferExchange::new(self.config.input_buffer_size, parallel));
        self.exchange = Some(exchange.clone());

        for id in 0..parallel {
            let worker = Worker {
                id,
                exchange: exchange.clone(),
                reducer: self.reducer.clone(),
                settings: self.settings.clone(),
                buckets: parallel,
                sorter_budget,
                cache_size,
            };
            let spawned = thread::Builder::new()
                .name(format!("sortreduce-worker-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => return Err(self.fail(e.into())),
            }
        }

        let buffers = exchange
            .producer_get()
            .and_then(|first| Ok((first, exchange.producer_get()?)));
        let (first, spare) = match buffers {
            Ok(buffers) => buffers,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.spare = Some(spare);
        self.state = EngineState::Prepared;
        debug!(workers = parallel, sorter_budget, cache_size, "input prepared");
        Ok(first)
    }

    /// Hands the complete lines of `buffer` to the workers and returns the
    /// next buffer to fill, which starts with the trailing partial line.
    ///
    /// A buffer without any newline is returned as is unless it is full,
    /// which fails with [`Error::ResourceExhausted`].
    pub fn provide_input_data(&mut self, mut buffer: RecordBuffer) -> Result<RecordBuffer, Error> {
        self.expect_state(
            &[EngineState::Prepared, EngineState::Active],
            "provide_input_data",
        )?;
        self.state = EngineState::Active;

        let Some(last_newline) = buffer.data().iter().rposition(|&b| b == b'\n') else {
            if buffer.is_full() {
                let err = Error::ResourceExhausted(format!(
                    "input line longer than the {} byte input buffer",
                    buffer.capacity()
                ));
                return Err(self.fail(err));
            }
            return Ok(buffer);
        };

        let Some(mut next) = self.spare.take() else {
            return Err(self.fail(Error::Internal("no spare input buffer".into())));
        };
        next.clear();
        let complete = last_newline + 1;
        next.extend_from_slice(&buffer.data()[complete..]);
        buffer.truncate(complete);

        match self.swap(buffer) {
            Some(empty) => {
                self.spare = Some(empty);
                Ok(next)
            }
            None => Err(self.abort_input()),
        }
    }

    /// Hands over the last buffer, waits for the workers and collects
    /// their runs per bucket. A final line without newline is mapped too.
    pub fn complete_input(&mut self, buffer: RecordBuffer) -> Result<(), Error> {
        self.expect_state(
            &[EngineState::Prepared, EngineState::Active],
            "complete_input",
        )?;

        if !buffer.is_empty() && self.swap(buffer).is_none() {
            return Err(self.abort_input());
        }

        let outputs = match self.finish_workers() {
            Ok(outputs) => outputs,
            Err(e) => return Err(self.fail(e)),
        };

        let mut buckets: Vec<Vec<Run>> = vec![Vec::new(); self.config.parallel];
        for output in outputs {
            self.stats.input_bytes += output.bytes;
            self.stats.records_mapped += output.records;
            self.stats.spilled_runs += output.spilled;
            self.stats.cached_runs += output.cached;
            for (bucket, runs) in output.runs.into_iter().enumerate() {
                buckets[bucket].extend(runs);
            }
        }
        self.buckets = buckets;
        self.spare = None;

        info!(
            bytes = self.stats.input_bytes,
            records = self.stats.records_mapped,
            spilled = self.stats.spilled_runs,
            cached = self.stats.cached_runs,
            "input complete"
        );

        self.state = if self.config.map_only {
            EngineState::Done
        } else {
            EngineState::Reducing
        };
        Ok(())
    }

    fn swap(&mut self, buffer: RecordBuffer) -> Option<RecordBuffer> {
        let exchange = self.exchange.as_ref()?;
        let bytes = buffer.len();
        let empty = exchange.producer_swap(buffer)?;
        debug!(bytes, "input chunk handed over");
        Some(empty)
    }

    /// Ends the stream, joins every worker and returns their outputs, or
    /// the first worker error.
    fn finish_workers(&mut self) -> Result<Vec<WorkerOutput>, Error> {
        if let Some(exchange) = &self.exchange {
            exchange.producer_finish();
        }

        let mut outputs = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for handle in self.workers.drain(..) {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(Error::Internal("worker thread panicked".into())));
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.exchange = None;

        match first_error {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    /// A worker poisoned the exchange: stop and surface its error.
    fn abort_input(&mut self) -> Error {
        let err = match self.finish_workers() {
            Err(e) => e,
            Ok(_) => Error::Internal("input stopped without a worker error".into()),
        };
        self.fail(err)
    }

    // --------------------------------------------------------------------------------------------
    // Reduce phase
    // --------------------------------------------------------------------------------------------

    /// Merges every bucket and writes the result to `sink`.
    pub fn reduce(&mut self, sink: &mut (dyn Write + Send)) -> Result<(), Error> {
        if self.config.map_only {
            return Err(Error::InvalidState("map-only job has no reduce phase".into()));
        }
        if self.config.reduce_only {
            self.expect_state(&[EngineState::Unprepared], "reduce")?;
            // Leaves the directory alone when it does not hold a map-only job.
            self.buckets = self.scan_runs()?;
        } else {
            self.expect_state(&[EngineState::Reducing], "reduce")?;
        }
        self.state = EngineState::Reducing;

        let result = self.reduce_buckets(sink).and_then(|()| Ok(sink.flush()?));
        match result {
            Ok(()) => {
                info!(merges = self.stats.merge_passes, "reduce finished");
                self.state = EngineState::Done;
                self.cleanup();
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn reduce_buckets(&mut self, sink: &mut (dyn Write + Send)) -> Result<(), Error> {
        let jobs: Vec<(usize, Vec<Run>)> = std::mem::take(&mut self.buckets)
            .into_iter()
            .enumerate()
            .filter(|(_, runs)| !runs.is_empty())
            .collect();
        let total: usize = jobs.iter().map(|(_, runs)| runs.len()).sum();
        info!(buckets = jobs.len(), runs = total, "reduce started");

        let max_open = self.config.max_open_files;
        let settings = &*self.settings;
        let reducer = &*self.reducer;

        if jobs.len() <= 1 {
            let runs = jobs.into_iter().flat_map(|(_, runs)| runs).collect();
            let mut merger = Merger::new(settings, reducer, runs, max_open, 0);
            merger.merge_to_output(sink)?;
            self.stats.merge_passes += merger.merges();
            return Ok(());
        }

        let concurrency = self.config.parallel.min(jobs.len());
        let fan_in = (max_open / concurrency).max(3);
        let buckets = jobs.len();

        if self.config.sort_output {
            let share = (max_open / buckets).max(1);
            let combine = reducer.can_combine();
            let results = run_concurrently(jobs, concurrency, |bucket, runs| {
                if runs.len() == 1 {
                    return Ok((runs, 0));
                }
                let mut merger = Merger::new(settings, reducer, runs, fan_in, bucket);
                let runs = if combine {
                    merger.merge_to_single(true, None)?.into_iter().collect()
                } else {
                    merger.merge_to_max_files(share)?
                };
                Ok((runs, merger.merges()))
            })?;

            let mut runs = Vec::new();
            for (_, (bucket_runs, merges)) in results {
                runs.extend(bucket_runs);
                self.stats.merge_passes += merges;
            }
            let mut merger = Merger::new(settings, reducer, runs, max_open, self.config.parallel);
            merger.merge_to_output(sink)?;
            self.stats.merge_passes += merger.merges();
        } else {
            let preferred = PreferredOutput::new(&mut *sink);
            let results = run_concurrently(jobs, concurrency, |bucket, runs| {
                let mut merger = Merger::new(settings, reducer, runs, fan_in, bucket);
                let run = merger.merge_to_single(true, Some(&preferred))?;
                Ok((run, merger.merges()))
            });
            debug!(
                direct = preferred.bytes_written(),
                declined = preferred.declined(),
                "bucket merges finished"
            );
            drop(preferred);

            let mut leftovers = Vec::new();
            for (_, (run, merges)) in results? {
                leftovers.extend(run);
                self.stats.merge_passes += merges;
            }
            for run in leftovers {
                let mut reader = run.open(settings)?;
                while reader.peek_key()?.is_some() {
                    sink.write_all(reader.consume_line()?)?;
                }
            }
        }
        Ok(())
    }

    /// Collects the sort runs a map-only job left in the job directory.
    fn scan_runs(&self) -> Result<Vec<Vec<Run>>, Error> {
        let parallel = self.config.parallel;
        let mut buckets: Vec<Vec<Run>> = vec![Vec::new(); parallel];
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.settings.dir)? {
            paths.push(entry?.path());
        }
        paths.sort();

        for path in paths {
            let bucket = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_sort_run_bucket)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "{} is not a sort run of a map-only job",
                        path.display()
                    ))
                })?;
            buckets[bucket % parallel].push(Run::from_path(path));
        }
        Ok(buckets)
    }

    // --------------------------------------------------------------------------------------------
    // State and cleanup
    // --------------------------------------------------------------------------------------------

    fn expect_state(&self, allowed: &[EngineState], op: &str) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::InvalidState(format!(
            "{op} called in state {:?}",
            self.state
        )))
    }

    /// Moves to `Done`, releases workers and files, and passes `err` on.
    fn fail(&mut self, err: Error) -> Error {
        if !self.workers.is_empty() {
            let _ = self.finish_workers();
        }
        self.state = EngineState::Done;
        self.spare = None;
        self.buckets.clear();
        self.cleanup();
        err
    }

    fn cleanup(&mut self) {
        if self.cleaned || self.config.keep_tmpfiles || self.config.map_only {
            return;
        }
        self.cleaned = true;
        match fs::remove_dir_all(&self.settings.dir) {
            Ok(()) => info!(dir = %self.settings.dir.display(), "work directory removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.settings.dir.display(), "failed to remove work directory: {e}"),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.finish_workers();
        }
        // An untouched reduce-only job must not delete its input runs.
        let untouched = self.config.reduce_only && self.state == EngineState::Unprepared;
        if self.state != EngineState::Done && !untouched {
            self.buckets.clear();
            self.cleanup();
        }
    }
}

/// Runs `merge` for every bucket on up to `concurrency` scoped threads and
/// returns the results in bucket order, or the first error by bucket.
fn run_concurrently<T, F>(
    jobs: Vec<(usize, Vec<Run>)>,
    concurrency: usize,
    merge: F,
) -> Result<Vec<(usize, T)>, Error>
where
    T: Send,
    F: Fn(usize, Vec<Run>) -> Result<T, Error> + Sync,
{
    let (job_tx, job_rx) = channel::unbounded();
    for job in jobs {
        let _ = job_tx.send(job);
    }
    drop(job_tx);
    let (result_tx, result_rx) = channel::unbounded();

    let scoped = crossbeam::scope(|s| -> Result<(), Error> {
        for id in 0..concurrency {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let merge = &merge;
            s.builder()
                .name(format!("sortreduce-merge-{id}"))
                .spawn(move |_| {
                    while let Ok((bucket, runs)) = job_rx.recv() {
                        let _ = result_tx.send((bucket, merge(bucket, runs)));
                    }
                })?;
        }
        Ok(())
    });
    drop(result_tx);

    match scoped {
        Ok(spawned) => spawned?,
        Err(_) => return Err(Error::Internal("merge thread panicked".into())),
    }

    let mut results: Vec<(usize, Result<T, Error>)> = result_rx.into_iter().collect();
    results.sort_by_key(|(bucket, _)| *bucket);
    results
        .into_iter()
        .map(|(bucket, result)| result.map(|value| (bucket, value)))
        .collect()
}

fn unique_job_name() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = NEXT.fetch_add(1, AtomicOrdering::Relaxed);
    format!("job-{}-{nanos}-{seq}", std::process::id())
}

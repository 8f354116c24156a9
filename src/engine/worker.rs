//! Sort worker: maps input lines and feeds the per-bucket sorters.

use std::sync::Arc;

use tracing::{debug, error};

use crate::Error;
use crate::exchange::BufferExchange;
use crate::key::bucket_of;
use crate::mapreduce::{Emit, MapReducer, check_record};
use crate::run::{Run, RunSettings};
use crate::sort::{MergeCache, Sorter};

/// Everything one worker produced.
#[derive(Debug, Default)]
pub(crate) struct WorkerOutput {
    /// Runs per bucket.
    pub runs: Vec<Vec<Run>>,
    pub bytes: u64,
    pub records: u64,
    pub spilled: usize,
    pub cached: usize,
}

/// One consumer slot of the exchange.
pub(crate) struct Worker {
    pub id: usize,
    pub exchange: Arc<BufferExchange>,
    pub reducer: Arc<dyn MapReducer>,
    pub settings: Arc<RunSettings>,
    pub buckets: usize,
    pub sorter_budget: usize,
    pub cache_size: usize,
}

impl Worker {
    /// Thread body. Poisons the exchange on failure.
    pub(crate) fn run(self) -> Result<WorkerOutput, Error> {
        let _guard = PanicGuard {
            exchange: &self.exchange,
            id: self.id,
        };
        match self.process() {
            Ok(output) => {
                debug!(
                    worker = self.id,
                    records = output.records,
                    spilled = output.spilled,
                    cached = output.cached,
                    "worker finished"
                );
                Ok(output)
            }
            Err(e) => {
                error!(worker = self.id, "worker failed: {e}");
                self.exchange.consumer_fail(self.id);
                Err(e)
            }
        }
    }

    fn process(&self) -> Result<WorkerOutput, Error> {
        let mut sorters = (0..self.buckets)
            .map(|bucket| {
                Sorter::new(self.settings.clone(), self.sorter_budget, bucket, self.id)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut cache = MergeCache::new(self.cache_size);
        let mut output = WorkerOutput::default();

        let mut next = self.exchange.consumer_get(self.id);
        while let Some(buffer) = next {
            output.bytes += buffer.len() as u64;
            let mut router = Router {
                sorters: &mut sorters,
                cache: &mut cache,
                records: 0,
            };
            for line in split_lines(buffer.data()) {
                self.reducer.map(line, &mut router)?;
            }
            output.records += router.records;
            next = self.exchange.consumer_swap(buffer, self.id);
        }

        for sorter in &mut sorters {
            sorter.flush(&mut cache)?;
            output.spilled += sorter.spilled();
            output.cached += sorter.cached();
            output.runs.push(sorter.grab_runs());
        }
        Ok(output)
    }
}

/// Poisons the exchange if a mapper panics, so the producer stops waiting.
struct PanicGuard<'a> {
    exchange: &'a BufferExchange,
    id: usize,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.exchange.consumer_fail(self.id);
        }
    }
}

/// Lines of an input chunk without terminators. A trailing `'\r'` is
/// dropped; a last line without `'\n'` still counts.
pub(crate) fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let empty = data.is_empty();
    let body = data.strip_suffix(b"\n").unwrap_or(data);
    body.split(|&b| b == b'\n')
        .filter(move |_| !empty)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// Routes mapped records to the sorter of their bucket.
struct Router<'a> {
    sorters: &'a mut [Sorter],
    cache: &'a mut MergeCache,
    records: u64,
}

impl Router<'_> {
    fn route(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        check_record(key, value)?;
        let bucket = bucket_of(key, self.sorters.len());
        self.sorters[bucket].add(key, value, self.cache)?;
        self.records += 1;
        Ok(())
    }
}

impl Emit for Router<'_> {
    fn emit(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.route(key, Some(value))
    }

    fn emit_key(&mut self, key: &[u8]) -> Result<(), Error> {
        self.route(key, None)
    }
}

use crate::Error;
use crate::key::{Key, KeyOrder, KeyType, parse_i64};
use crate::mapreduce::{Emit, MapReducer};
use crate::merge::Values;
use crate::run::{Run, RunSettings, RunWriter};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub type Record = (String, String);

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn settings(dir: &TempDir, key_type: KeyType, reverse: bool, compressed: bool) -> RunSettings {
    init_tracing();
    RunSettings {
        dir: dir.path().to_path_buf(),
        order: KeyOrder::new(key_type, reverse),
        compressed,
        keep_tmpfiles: false,
        verbose: true,
    }
}

/// Sorts `records` in job order and writes them as run `name`.
pub fn write_run(settings: &RunSettings, name: &str, mut records: Vec<Record>) -> Run {
    records.sort_by(|a, b| settings.order.compare(a.0.as_bytes(), b.0.as_bytes()));
    let suffix = if settings.compressed { ".snappy" } else { "" };
    let path = settings.dir.join(format!("{name}{suffix}"));
    let mut writer = RunWriter::create(path, settings.compressed).unwrap();
    for (k, v) in &records {
        writer.write_record(k.as_bytes(), Some(v.as_bytes())).unwrap();
    }
    writer.finish().unwrap()
}

/// Reads a run back as `(key, value)` pairs.
pub fn read_run(run: Run, settings: &RunSettings) -> Vec<Record> {
    let mut reader = run.open(settings).unwrap();
    let mut out = Vec::new();
    while let Some(key) = reader.peek_key().unwrap() {
        let key = String::from_utf8(key.to_vec()).unwrap();
        let value = String::from_utf8(reader.consume_value().unwrap().to_vec()).unwrap();
        out.push((key, value));
    }
    out
}

/// Splits sink bytes into `(key, value)` pairs.
pub fn parse_lines(bytes: &[u8]) -> Vec<Record> {
    std::str::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| match line.split_once('\t') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

pub fn assert_ordered(records: &[Record], order: KeyOrder) {
    for pair in records.windows(2) {
        assert_ne!(
            order.compare(pair[0].0.as_bytes(), pair[1].0.as_bytes()),
            std::cmp::Ordering::Greater,
            "{:?} before {:?}",
            pair[0],
            pair[1]
        );
    }
}

pub fn files_in(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

// ------------------------------------------------------------------------------------------------
// Reducers
// ------------------------------------------------------------------------------------------------

/// Re-emits every value unchanged.
pub struct Passthrough(pub KeyType);

impl MapReducer for Passthrough {
    fn key_type(&self) -> KeyType {
        self.0
    }

    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
        out.emit_key(line)
    }

    fn reduce(&self, key: Key<'_>, values: &mut Values<'_>, out: &mut dyn Emit) -> Result<(), Error> {
        while let Some(value) = values.next_value()? {
            out.emit(key.as_bytes(), value)?;
        }
        Ok(())
    }
}

/// Sums integer values per key and counts its own invocations.
pub struct Sum {
    pub combine: bool,
    pub calls: AtomicUsize,
}

impl Sum {
    pub fn new(combine: bool) -> Self {
        Self {
            combine,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl MapReducer for Sum {
    fn key_type(&self) -> KeyType {
        KeyType::String
    }

    fn can_combine(&self) -> bool {
        self.combine
    }

    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
        out.emit(line, b"1")
    }

    fn reduce(&self, key: Key<'_>, values: &mut Values<'_>, out: &mut dyn Emit) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut total = 0i64;
        while let Some(value) = values.next_value()? {
            total += parse_i64(value);
        }
        out.emit(key.as_bytes(), total.to_string().as_bytes())
    }
}

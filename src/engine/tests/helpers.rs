use crate::Error;
use crate::engine::{Engine, JobStats};
use crate::key::{Key, KeyType};
use crate::mapreduce::{Emit, MapReducer};
use crate::merge::Values;
use crate::JobConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small buffers so that modest inputs spill and merge.
pub fn small_config(dir: &TempDir, parallel: usize) -> JobConfig {
    init_tracing();
    JobConfig {
        work_dir: dir.path().to_path_buf(),
        buffer_size: 32 * 1024,
        input_buffer_size: 1024,
        verbose: true,
        ..JobConfig::default().with_parallel(parallel)
    }
}

/// Runs a whole job over `input` and returns the sink bytes.
pub fn run_job(
    config: JobConfig,
    reducer: Arc<dyn MapReducer>,
    input: &[u8],
) -> Result<(Vec<u8>, JobStats), Error> {
    let mut engine = Engine::new(config, reducer)?;
    let mut reader = input;
    let mut sink = Vec::new();
    let stats = engine.run(&mut reader, &mut sink)?;
    Ok((sink, stats))
}

pub fn lines(bytes: &[u8]) -> Vec<String> {
    std::str::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// `word '\t' count` lines in key order.
pub fn reference_counts(text: &str) -> Vec<String> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for word in text
        .split(|c: char| c.is_ascii_whitespace() || c.is_ascii_punctuation())
        .filter(|w| !w.is_empty())
    {
        *counts.entry(word.to_ascii_lowercase()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(word, n)| format!("{word}\t{n}"))
        .collect()
}

/// Seeded text of `lines` lines drawn from a `vocabulary`-word vocabulary.
pub fn random_text(seed: u64, lines: usize, vocabulary: usize) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::new();
    for _ in 0..lines {
        let words = rng.random_range(0..12);
        for i in 0..words {
            if i > 0 {
                text.push(if rng.random_bool(0.1) { ',' } else { ' ' });
            }
            let w = rng.random_range(0..vocabulary);
            if rng.random_bool(0.2) {
                text.push_str(&format!("Word{w}"));
            } else {
                text.push_str(&format!("word{w}"));
            }
        }
        text.push('\n');
    }
    text
}

pub fn entries_in(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

/// Hands out at most `step` bytes per read.
pub struct Trickle<'a> {
    pub data: &'a [u8],
    pub step: usize,
}

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.step.min(buf.len()).min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Ok(n)
    }
}

// ------------------------------------------------------------------------------------------------
// Jobs
// ------------------------------------------------------------------------------------------------

/// Emits every line as a key-only record and the keys once per value.
pub struct Lines(pub KeyType);

impl MapReducer for Lines {
    fn key_type(&self) -> KeyType {
        self.0
    }

    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
        if line.is_empty() {
            return out.emit_key(b"<empty>");
        }
        out.emit_key(line)
    }

    fn reduce(&self, key: Key<'_>, values: &mut Values<'_>, out: &mut dyn Emit) -> Result<(), Error> {
        for _ in 0..values.count()? {
            out.emit_key(key.as_bytes())?;
        }
        Ok(())
    }
}

/// Fails or panics when a line equals its trigger.
pub struct Faulty {
    pub trigger: &'static str,
    pub panic: bool,
}

impl MapReducer for Faulty {
    fn key_type(&self) -> KeyType {
        KeyType::String
    }

    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
        if line == self.trigger.as_bytes() {
            if self.panic {
                panic!("mapper panicked on {}", self.trigger);
            }
            return Err(Error::task(format!("cannot map {}", self.trigger)));
        }
        out.emit_key(line)
    }

    fn reduce(&self, key: Key<'_>, _values: &mut Values<'_>, out: &mut dyn Emit) -> Result<(), Error> {
        out.emit_key(key.as_bytes())
    }
}

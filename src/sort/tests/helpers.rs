use crate::key::{KeyOrder, KeyType};
use crate::run::{Run, RunSettings};
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

pub fn settings(dir: &TempDir, key_type: KeyType, reverse: bool, compressed: bool) -> Arc<RunSettings> {
    init_tracing();
    Arc::new(RunSettings {
        dir: dir.path().to_path_buf(),
        order: KeyOrder::new(key_type, reverse),
        compressed,
        keep_tmpfiles: false,
        verbose: false,
    })
}

/// Reads every run back as `(key, value)` pairs, one vector per run.
pub fn read_runs(runs: Vec<Run>, settings: &RunSettings) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
    runs.into_iter()
        .map(|run| {
            let mut reader = run.open(settings).unwrap();
            let mut out = Vec::new();
            while let Some(key) = reader.peek_key().unwrap() {
                let key = key.to_vec();
                out.push((key, reader.consume_value().unwrap().to_vec()));
            }
            out
        })
        .collect()
}

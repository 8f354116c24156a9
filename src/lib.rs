//! # sortreduce
//!
//! A single-machine map-reduce engine over line-oriented text. Input is
//! streamed through a pool of worker threads that map every line into
//! tab-separated key/value records, sort them in adaptive in-memory buffers,
//! spill sorted runs to disk (optionally snappy-compressed), and finally
//! k-way merge the runs so every distinct key is reduced exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sortreduce::{Engine, JobConfig, jobs::WordCount};
//!
//! let config = JobConfig {
//!     sort_output: true,
//!     ..JobConfig::default()
//! };
//! let mut engine = Engine::new(config, Arc::new(WordCount)).unwrap();
//!
//! let mut input = &b"the quick brown fox\njumps over the lazy dog\n"[..];
//! let mut output = Vec::new();
//! let stats = engine.run(&mut input, &mut output).unwrap();
//!
//! assert_eq!(stats.records_mapped, 9);
//! assert!(output.starts_with(b"brown\t1\n"));
//! ```
//!
//! ## Features
//!
//! - **Parallel map**: input chunks are handed to N workers through a
//!   lock-step buffer exchange, never splitting a line.
//! - **Adaptive sort buffers**: the split between record data and the sort
//!   index follows the observed record size.
//! - **Bounded merges**: never more than `max_open_files` runs open at once.
//! - **Combiners**: associative reducers are applied between merge passes.
//! - **Sorted or grouped output**: a total order over all keys, or
//!   per-key groups written as soon as a bucket is ready.
//! - **Map-only / reduce-only** jobs sharing a named work directory.

pub mod buffer;
pub mod codec;
pub mod engine;
pub mod exchange;
pub mod jobs;
pub mod key;
pub mod mapreduce;
pub mod merge;
pub mod run;
pub mod sort;

use std::path::PathBuf;
use std::thread;

use thiserror::Error;

pub use buffer::RecordBuffer;
pub use codec::CodecError;
pub use engine::{Engine, EngineState, JobStats};
pub use exchange::ExchangeError;
pub use key::{Key, KeyOrder, KeyType};
pub use mapreduce::{Emit, MapReducer, VecEmit};
pub use merge::Values;
pub use run::RunError;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Settings of one job. Read once by [`Engine::new`].
///
/// # Example
///
/// ```rust
/// use sortreduce::JobConfig;
///
/// let config = JobConfig {
///     buffer_size: 64 * 1024 * 1024,
///     reverse_sort: true,
///     ..JobConfig::default().with_parallel(4)
/// };
/// assert_eq!(config.max_open_files, 80);
/// ```
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Directory under which the job directory is created.
    ///
    /// Default: the system temporary directory. Must exist.
    pub work_dir: PathBuf,

    /// Name of the job directory below `work_dir`. A unique name is
    /// generated when absent. Required for map-only and reduce-only jobs.
    pub subdir: Option<String>,

    /// Number of workers, and of buckets.
    ///
    /// Default: available parallelism. Must be ≥ 1.
    pub parallel: usize,

    /// Total sort memory in bytes, shared by `parallel * parallel` sort
    /// buffers.
    ///
    /// Default: 10 MiB.
    pub buffer_size: usize,

    /// Capacity of each input buffer handed to workers. Bounds the length
    /// of one input line.
    ///
    /// Default: 1 MiB. Must be ≥ 64.
    pub input_buffer_size: usize,

    /// Per-worker bytes of sorted runs kept in memory instead of spilled.
    ///
    /// Default: 0 (disabled).
    pub merge_cache_size: usize,

    /// Most runs open at once in any merge.
    ///
    /// Default: `20 * parallel`. Must be ≥ 3.
    pub max_open_files: usize,

    /// Snappy-frame run files. Default: true.
    pub compressed: bool,

    /// Keep run files and the job directory after the job.
    pub keep_tmpfiles: bool,

    /// Totally ordered output instead of grouped output.
    pub sort_output: bool,

    /// Descending key order.
    pub reverse_sort: bool,

    /// Log every merge pass at info level.
    pub verbose: bool,

    /// Stop after the map phase, leaving sorted runs in the job directory.
    pub map_only: bool,

    /// Skip the map phase and reduce the runs of an earlier map-only job.
    pub reduce_only: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        let parallel = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            work_dir: std::env::temp_dir(),
            subdir: None,
            parallel,
            buffer_size: 10 * 1024 * 1024,
            input_buffer_size: 1024 * 1024,
            merge_cache_size: 0,
            max_open_files: 20 * parallel,
            compressed: true,
            keep_tmpfiles: false,
            sort_output: false,
            reverse_sort: false,
            verbose: false,
            map_only: false,
            reduce_only: false,
        }
    }
}

impl JobConfig {
    /// Sets `parallel` and scales `max_open_files` with it.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self.max_open_files = 20 * parallel.max(1);
        self
    }

    /// Checks every setting.
    pub fn validate(&self) -> Result<(), Error> {
        if self.parallel < 1 {
            return Err(Error::InvalidConfig("parallel must be >= 1".into()));
        }
        if self.input_buffer_size < 64 {
            return Err(Error::InvalidConfig(
                "input_buffer_size must be >= 64".into(),
            ));
        }
        if self.max_open_files < 3 {
            return Err(Error::InvalidConfig("max_open_files must be >= 3".into()));
        }
        if !self.work_dir.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "work_dir {} must be an existing directory",
                self.work_dir.display()
            )));
        }
        if self.map_only && self.reduce_only {
            return Err(Error::InvalidConfig(
                "map_only and reduce_only are mutually exclusive".into(),
            ));
        }
        if (self.map_only || self.reduce_only) && self.subdir.is_none() {
            return Err(Error::InvalidConfig(
                "map_only and reduce_only require subdir".into(),
            ));
        }
        if let Some(subdir) = &self.subdir {
            if subdir.is_empty() || subdir.contains(['/', '\\']) || subdir == ".." {
                return Err(Error::InvalidConfig(
                    "subdir must be a plain directory name".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Parses a byte size such as `512`, `64k` or `10M` (powers of 1024,
/// suffixes `k M G T P E` in either case).
pub fn parse_size(text: &str) -> Result<usize, Error> {
    let text = text.trim();
    let invalid = || Error::InvalidConfig(format!("invalid size {text:?}"));

    let (digits, shift) = match text.char_indices().last() {
        None => return Err(invalid()),
        Some((at, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                'P' => 50,
                'E' => 60,
                _ => return Err(invalid()),
            };
            (&text[..at], shift)
        }
        Some(_) => (text, 0),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let bytes = value.checked_mul(1u64 << shift).ok_or_else(invalid)?;
    usize::try_from(bytes).map_err(|_| invalid())
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by job operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A memory bound cannot hold what it must.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A mapper or reducer emitted a malformed record.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Engine operation called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run file error.
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// Frame codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Buffer exchange error.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Failure raised by user map or reduce code.
    #[error("task failed: {0}")]
    Task(Box<dyn std::error::Error + Send + Sync>),

    /// Internal error (poisoned lock, panicked thread).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps an error raised by map or reduce code.
    pub fn task(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Task(err.into())
    }
}

//! Sorted runs: the unit of data between the sort and merge phases.
//!
//! ## Design Overview
//!
//! A run is a key-sorted sequence of `key '\t' value '\n'` lines (key-only
//! lines have no tab). It lives either in a file in the job directory,
//! optionally snappy-framed (see [`codec`](crate::codec)), or in a shared
//! memory block produced by the merge cache.
//!
//! - [`RunWriter`] streams lines into a new run file.
//! - [`RunReader`] streams lines back, exposing the next key without
//!   consuming it, so a merge can order readers by their head key.
//!
//! # File names
//!
//! ```text
//! <dir>/sort_<thread>.h<bucket>.w<worker>.n<seq>[.snappy]   sort phase
//! <dir>/merge_<thread>.w<merger>.<seq>[.snappy]             merge passes
//! ```
//!
//! # Guarantees
//!
//! - A file-backed reader removes its file once it has been read to the
//!   end, unless the job keeps temporary files.
//! - A run that ends without a newline, or holds a line with an empty key,
//!   is reported as [`RunError::Corrupt`].

pub mod reader;
pub mod writer;


use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::codec::{COMPRESSED_SUFFIX, CodecError};
use crate::key::KeyOrder;

pub use reader::RunReader;
pub use writer::RunWriter;

/// Errors raised while writing or reading runs.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run violates the line format.
    #[error("corrupt run {run}: {reason}")]
    Corrupt { run: String, reason: String },

    /// Compressed framing is broken.
    #[error("{0}")]
    Codec(#[from] CodecError),

    /// Underlying I/O error on a run file.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RunError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> RunError + '_ {
        move |source| RunError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RunSettings
// ------------------------------------------------------------------------------------------------

/// Job-wide settings every run producer and consumer reads.
///
/// Built once per job from [`JobConfig`](crate::JobConfig) and never changed
/// afterwards, so all components agree on ordering and file retention.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Directory holding every run file of the job.
    pub dir: PathBuf,

    /// Key type and direction.
    pub order: KeyOrder,

    /// Write new runs snappy-framed.
    pub compressed: bool,

    /// Leave consumed run files on disk.
    pub keep_tmpfiles: bool,

    /// Log per-pass merge progress at info level.
    pub verbose: bool,
}

// ------------------------------------------------------------------------------------------------
// Run
// ------------------------------------------------------------------------------------------------

/// A finished sorted run.
#[derive(Clone)]
pub enum Run {
    /// A run file.
    File { path: PathBuf, compressed: bool },

    /// A merge cache block holding sorted lines.
    Memory(Arc<[u8]>),
}

impl Run {
    /// Wraps an existing file, detecting compression from its name.
    pub fn from_path(path: PathBuf) -> Self {
        let compressed = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(COMPRESSED_SUFFIX));
        Run::File { path, compressed }
    }

    /// Opens a reader. With `keep_file == false` a file-backed run is
    /// deleted once read to the end.
    pub fn open(self, settings: &RunSettings) -> Result<RunReader, RunError> {
        match self {
            Run::File { path, compressed } => {
                RunReader::open(path, compressed, !settings.keep_tmpfiles)
            }
            Run::Memory(data) => Ok(RunReader::from_memory(data)),
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Run::Memory(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Run::File { path, .. } => Some(path),
            Run::Memory(_) => None,
        }
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Run::File { path, compressed } => f
                .debug_struct("File")
                .field("path", path)
                .field("compressed", compressed)
                .finish(),
            Run::Memory(data) => f.debug_tuple("Memory").field(&data.len()).finish(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Naming
// ------------------------------------------------------------------------------------------------

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique number of the calling thread, for file names. Fixed for
/// the thread's lifetime.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

fn suffix(compressed: bool) -> &'static str {
    if compressed { COMPRESSED_SUFFIX } else { "" }
}

/// Path of a sort-phase run.
pub fn sort_run_path(
    settings: &RunSettings,
    bucket: usize,
    worker: usize,
    seq: u64,
) -> PathBuf {
    settings.dir.join(format!(
        "sort_{}.h{bucket}.w{worker}.n{seq}{}",
        thread_token(),
        suffix(settings.compressed)
    ))
}

/// Path of a merge-pass run.
pub fn merge_run_path(settings: &RunSettings, merger: usize, seq: u64) -> PathBuf {
    settings.dir.join(format!(
        "merge_{}.w{merger}.{seq}{}",
        thread_token(),
        suffix(settings.compressed)
    ))
}

/// Extracts the bucket from a sort-phase run file name.
pub fn parse_sort_run_bucket(file_name: &str) -> Option<usize> {
    let rest = file_name.strip_prefix("sort_")?;
    let mut parts = rest.split('.');
    parts.next()?;
    parts.next()?.strip_prefix('h')?.parse().ok()
}

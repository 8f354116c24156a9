use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use sortreduce::jobs::{WordCount, WordSort};
use sortreduce::{Engine, Error, JobConfig, MapReducer, parse_size};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Job {
    /// Count words: `word<TAB>count` per distinct word
    Wordcount,
    /// Re-key `word<TAB>count` lines by count
    Wordsort,
}

/// Map-reduce over stdin, results on stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Job to run
    #[arg(value_enum)]
    job: Job,

    /// Named job directory below the work directory
    #[arg(short = 's', long)]
    subdir: Option<String>,

    /// Directory for temporary run files
    #[arg(short = 'd', long, default_value_os_t = std::env::temp_dir())]
    work_dir: PathBuf,

    /// Total sort memory, e.g. 64M
    #[arg(short = 'b', long, default_value = "10M", value_parser = parse_size_arg)]
    buffer_size: usize,

    /// Worker threads (default: available parallelism)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Most run files open at once (default: 20 per thread)
    #[arg(short = 'f', long)]
    max_open_files: Option<usize>,

    /// Per-worker in-memory merge cache, e.g. 256M
    #[arg(long, default_value = "0", value_parser = parse_size_arg)]
    merge_cache: usize,

    /// Totally ordered output
    #[arg(long)]
    sort: bool,

    /// Descending key order
    #[arg(long)]
    reverse: bool,

    /// Write run files uncompressed
    #[arg(long)]
    no_compression: bool,

    /// Keep run files after the job
    #[arg(long)]
    keep_tmpfiles: bool,

    /// Stop after the map phase (requires --subdir)
    #[arg(long, conflicts_with = "reduce_only")]
    map_only: bool,

    /// Reduce the runs of an earlier --map-only job (requires --subdir)
    #[arg(long)]
    reduce_only: bool,

    /// Log merge progress
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn parse_size_arg(text: &str) -> Result<usize, String> {
    parse_size(text).map_err(|e| e.to_string())
}

impl Args {
    fn config(&self) -> JobConfig {
        let base = JobConfig::default();
        let base = match self.threads {
            Some(threads) => base.with_parallel(threads),
            None => base,
        };
        JobConfig {
            work_dir: self.work_dir.clone(),
            subdir: self.subdir.clone(),
            buffer_size: self.buffer_size,
            merge_cache_size: self.merge_cache,
            max_open_files: self.max_open_files.unwrap_or(base.max_open_files),
            compressed: !self.no_compression,
            keep_tmpfiles: self.keep_tmpfiles,
            sort_output: self.sort,
            reverse_sort: self.reverse,
            verbose: self.verbose,
            map_only: self.map_only,
            reduce_only: self.reduce_only,
            ..base
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let reducer: Arc<dyn MapReducer> = match args.job {
        Job::Wordcount => Arc::new(WordCount),
        Job::Wordsort => Arc::new(WordSort),
    };
    let mut engine = Engine::new(args.config(), reducer)?;

    let mut input = io::stdin().lock();
    let mut output = BufWriter::new(io::stdout());
    let stats = engine.run(&mut input, &mut output)?;
    output.flush()?;

    info!(
        input_bytes = stats.input_bytes,
        records = stats.records_mapped,
        spilled = stats.spilled_runs,
        merges = stats.merge_passes,
        "done"
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

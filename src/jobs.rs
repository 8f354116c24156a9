//! Built-in jobs.
//!
//! - [`WordCount`]: counts words, output `word '\t' count`.
//! - [`WordSort`]: turns word counts into `count`-keyed records, so a
//!   sorted (usually reversed) job lists the most frequent words first.

use crate::Error;
use crate::key::{Key, KeyType, parse_i64};
use crate::mapreduce::{Emit, MapReducer};
use crate::merge::Values;

/// Counts words: lower-cased tokens split on ASCII whitespace and
/// punctuation. Reduces between merge passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

fn is_separator(b: u8) -> bool {
    b.is_ascii_whitespace() || b.is_ascii_punctuation()
}

impl MapReducer for WordCount {
    fn key_type(&self) -> KeyType {
        KeyType::String
    }

    fn can_combine(&self) -> bool {
        true
    }

    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
        let mut word = Vec::new();
        for token in line.split(|&b| is_separator(b)).filter(|t| !t.is_empty()) {
            word.clear();
            word.extend(token.iter().map(u8::to_ascii_lowercase));
            out.emit_key(&word)?;
        }
        Ok(())
    }

    fn reduce(
        &self,
        key: Key<'_>,
        values: &mut Values<'_>,
        out: &mut dyn Emit,
    ) -> Result<(), Error> {
        let mut count: i64 = 0;
        while let Some(value) = values.next_value()? {
            // A key-only record is one occurrence, a combined one carries its count.
            let n = if value.is_empty() { 1 } else { parse_i64(value) };
            count = count.saturating_add(n);
        }
        out.emit(key.as_bytes(), count.to_string().as_bytes())
    }
}

/// Re-keys `word '\t' count` lines by count. A line without a tab fails
/// the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordSort;

impl MapReducer for WordSort {
    fn key_type(&self) -> KeyType {
        KeyType::Int64
    }

    fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
        let Some(tab) = line.iter().position(|&b| b == b'\t') else {
            return Err(Error::task("no tab in input data"));
        };
        let count = parse_i64(&line[tab + 1..]);
        out.emit(count.to_string().as_bytes(), &line[..tab])
    }

    fn reduce(
        &self,
        key: Key<'_>,
        values: &mut Values<'_>,
        out: &mut dyn Emit,
    ) -> Result<(), Error> {
        while let Some(word) = values.next_value()? {
            out.emit(word, key.as_bytes())?;
        }
        Ok(())
    }
}

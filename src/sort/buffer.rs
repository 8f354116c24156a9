//! Adaptive sort buffer.
//!
//! A byte budget `B` is split between a record region of `r` bytes and an
//! index of `n` [`IndexEntry`] slots so that `r / (n * size_of::<IndexEntry>())`
//! equals the current ratio. The first guess is [`INITIAL_RATIO`]; after the
//! first overflow the owner measures [`SortBuffer::ideal_ratio`] and calls
//! [`SortBuffer::tune`] once, which resizes both regions for the rest of the
//! buffer's life.

use std::cmp::Reverse;
use std::mem::size_of;

use crate::key::{KeyOrder, KeyType};

/// Starting record/index split.
pub const INITIAL_RATIO: f64 = 3.0;

pub const MIN_RATIO: f64 = 0.01;
pub const MAX_RATIO: f64 = 100.0;

/// Position of one record inside the record region.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    offset: u32,
    key_len: u32,
    len: u32,
}

/// Size of one index slot in bytes.
pub const INDEX_ENTRY_SIZE: usize = size_of::<IndexEntry>();

impl IndexEntry {
    fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        &data[start..start + self.key_len as usize]
    }

    /// Record bytes including the trailing newline.
    fn line<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        &data[start..start + self.len as usize + 1]
    }
}

/// Record region plus index region with a one-shot adaptive split.
pub struct SortBuffer {
    budget: usize,
    ratio: f64,
    data: Vec<u8>,
    data_capacity: usize,
    index: Vec<IndexEntry>,
    index_capacity: usize,
    retunes: u32,
}

fn split(budget: usize, ratio: f64) -> (usize, usize) {
    let share = budget as f64 / (ratio + 1.0);
    let data = ((share * ratio) as usize).min(u32::MAX as usize);
    let index = (share / INDEX_ENTRY_SIZE as f64) as usize;
    (data, index)
}

impl SortBuffer {
    /// Splits `budget` bytes at `ratio`. Returns `None` when the budget
    /// cannot hold a single index entry.
    pub fn new(budget: usize, ratio: f64) -> Option<Self> {
        let ratio = ratio.clamp(MIN_RATIO, MAX_RATIO);
        let (data_capacity, index_capacity) = split(budget, ratio);
        if index_capacity < 1 || data_capacity < 2 {
            return None;
        }
        Some(Self {
            budget,
            ratio,
            data: Vec::with_capacity(data_capacity),
            data_capacity,
            index: Vec::with_capacity(index_capacity),
            index_capacity,
            retunes: 0,
        })
    }

    /// Whether a record of `bytes` (newline included) would not fit.
    pub fn would_overflow(&self, bytes: usize) -> bool {
        self.index.len() >= self.index_capacity || self.data.len() + bytes > self.data_capacity
    }

    /// Appends `record` (without newline) whose first `key_len` bytes are
    /// the key. Returns `false` if it does not fit.
    pub fn add(&mut self, record: &[u8], key_len: usize) -> bool {
        let len = record.len();
        if key_len > len || self.would_overflow(len + 1) {
            return false;
        }
        let offset = self.data.len();
        self.data.extend_from_slice(record);
        self.data.push(b'\n');
        self.index.push(IndexEntry {
            offset: offset as u32,
            key_len: key_len as u32,
            len: len as u32,
        });
        true
    }

    /// Appends `key '\t' value`, or just `key` without a value.
    pub fn add_key_value(&mut self, key: &[u8], value: Option<&[u8]>) -> bool {
        let len = key.len() + value.map_or(0, |v| v.len() + 1);
        if self.would_overflow(len + 1) {
            return false;
        }
        let offset = self.data.len();
        self.data.extend_from_slice(key);
        if let Some(value) = value {
            self.data.push(b'\t');
            self.data.extend_from_slice(value);
        }
        self.data.push(b'\n');
        self.index.push(IndexEntry {
            offset: offset as u32,
            key_len: key.len() as u32,
            len: len as u32,
        });
        true
    }

    /// Observed bytes-per-index-slot ratio, clamped to `[0.01, 100]`.
    pub fn ideal_ratio(&self) -> f64 {
        if self.index.is_empty() {
            return self.ratio;
        }
        let ideal = self.data.len() as f64 / (self.index.len() * INDEX_ENTRY_SIZE) as f64;
        ideal.clamp(MIN_RATIO, MAX_RATIO)
    }

    /// Re-splits the budget at `ratio`. Content is discarded, so flush first.
    pub fn tune(&mut self, ratio: f64) {
        let ratio = ratio.clamp(MIN_RATIO, MAX_RATIO);
        let (data_capacity, index_capacity) = split(self.budget, ratio);
        self.ratio = ratio;
        self.data_capacity = data_capacity.max(2);
        self.index_capacity = index_capacity.max(1);
        self.data = Vec::with_capacity(self.data_capacity);
        self.index = Vec::with_capacity(self.index_capacity);
        self.retunes += 1;
    }

    /// Sorts the index by key; record bytes stay in place.
    pub fn sort(&mut self, order: KeyOrder) {
        let data = &self.data;
        match order.key_type {
            KeyType::String => {
                if order.reverse {
                    self.index
                        .sort_unstable_by(|a, b| b.key(data).cmp(a.key(data)));
                } else {
                    self.index
                        .sort_unstable_by(|a, b| a.key(data).cmp(b.key(data)));
                }
            }
            numeric => {
                if order.reverse {
                    self.index
                        .sort_by_cached_key(|e| Reverse(numeric.numeric_sort_key(e.key(data))));
                } else {
                    self.index
                        .sort_by_cached_key(|e| numeric.numeric_sort_key(e.key(data)));
                }
            }
        }
    }

    /// Lines in index order, newline included.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.index.iter().map(|e| e.line(&self.data))
    }

    /// Keys in index order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.index.iter().map(|e| e.key(&self.data))
    }

    /// Copies all lines, in index order, into one contiguous block.
    pub fn to_sorted_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        for line in self.lines() {
            out.extend_from_slice(line);
        }
        out
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.index.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn entries(&self) -> usize {
        self.index.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.data.len()
    }

    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    pub fn index_capacity(&self) -> usize {
        self.index_capacity
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn is_tuned(&self) -> bool {
        self.retunes > 0
    }

    pub fn retunes(&self) -> u32 {
        self.retunes
    }
}

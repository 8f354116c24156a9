//! Key handling shared by the sort, run, and merge layers.
//!
//! Every job has exactly one [`KeyType`], fixed for its whole lifetime.
//! Keys travel through the pipeline as raw bytes; they are only parsed
//! when two keys are compared, so a run file stays a plain text file no
//! matter how its keys are ordered.

use std::cmp::Ordering;
use std::fmt;

/// Seed of the bucket hash accumulator.
pub const BUCKET_HASH_SEED: u32 = 0x5555_5555;

// ------------------------------------------------------------------------------------------------
// KeyType
// ------------------------------------------------------------------------------------------------

/// The interpretation of key bytes used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Raw bytes, compared lexicographically (a strict prefix sorts first).
    String,

    /// Signed 64-bit integer, parsed like C `atoll`.
    Int64,

    /// Double precision float, parsed like C `atof`.
    Double,
}

/// A key parsed according to its [`KeyType`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedKey<'a> {
    String(&'a [u8]),
    Int64(i64),
    Double(f64),
}

impl KeyType {
    /// Parses raw key bytes.
    pub fn parse(self, raw: &[u8]) -> ParsedKey<'_> {
        match self {
            KeyType::String => ParsedKey::String(raw),
            KeyType::Int64 => ParsedKey::Int64(parse_i64(raw)),
            KeyType::Double => ParsedKey::Double(parse_f64(raw)),
        }
    }

    /// Compares two raw keys in ascending order.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyType::String => a.cmp(b),
            KeyType::Int64 => parse_i64(a).cmp(&parse_i64(b)),
            KeyType::Double => parse_f64(a).total_cmp(&parse_f64(b)),
        }
    }

    /// Renders raw key bytes in canonical form: numbers are normalised,
    /// strings are returned lossily decoded.
    pub fn format(self, raw: &[u8]) -> String {
        match self.parse(raw) {
            ParsedKey::String(s) => String::from_utf8_lossy(s).into_owned(),
            ParsedKey::Int64(v) => v.to_string(),
            ParsedKey::Double(v) => v.to_string(),
        }
    }

    /// Returns a value whose natural integer order matches [`compare`](Self::compare)
    /// for numeric key types. Used to sort large batches without re-parsing
    /// both sides of every comparison.
    pub(crate) fn numeric_sort_key(self, raw: &[u8]) -> i64 {
        match self {
            KeyType::String => 0,
            KeyType::Int64 => parse_i64(raw),
            KeyType::Double => {
                let bits = parse_f64(raw).to_bits() as i64;
                bits ^ ((((bits >> 63) as u64) >> 1) as i64)
            }
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::String => "string",
            KeyType::Int64 => "int64",
            KeyType::Double => "double",
        };
        f.write_str(name)
    }
}

// ------------------------------------------------------------------------------------------------
// KeyOrder
// ------------------------------------------------------------------------------------------------

/// Job-wide ordering: a key type plus a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOrder {
    pub key_type: KeyType,
    pub reverse: bool,
}

impl KeyOrder {
    pub fn new(key_type: KeyType, reverse: bool) -> Self {
        Self { key_type, reverse }
    }

    /// Compares two raw keys in output order.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let ord = self.key_type.compare(a, b);
        if self.reverse { ord.reverse() } else { ord }
    }

    /// Whether two raw keys belong to the same group.
    pub fn same_key(&self, a: &[u8], b: &[u8]) -> bool {
        self.key_type.compare(a, b) == Ordering::Equal
    }
}

// ------------------------------------------------------------------------------------------------
// Key
// ------------------------------------------------------------------------------------------------

/// A borrowed key handed to [`MapReducer::reduce`](crate::MapReducer::reduce).
#[derive(Clone, Copy)]
pub struct Key<'a> {
    raw: &'a [u8],
    key_type: KeyType,
}

impl<'a> Key<'a> {
    pub fn new(raw: &'a [u8], key_type: KeyType) -> Self {
        Self { raw, key_type }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }

    pub fn as_str(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.raw)
    }

    pub fn as_i64(&self) -> i64 {
        parse_i64(self.raw)
    }

    pub fn as_f64(&self) -> f64 {
        parse_f64(self.raw)
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn parsed(&self) -> ParsedKey<'a> {
        self.key_type.parse(self.raw)
    }
}

impl fmt::Debug for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("raw", &String::from_utf8_lossy(self.raw))
            .field("key_type", &self.key_type)
            .finish()
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.raw))
    }
}

// ------------------------------------------------------------------------------------------------
// Numeric parsing
// ------------------------------------------------------------------------------------------------

/// `atoll`: skips leading whitespace, accepts one sign, reads digits until
/// the first non-digit. Saturates instead of overflowing; 0 when no digits.
pub fn parse_i64(raw: &[u8]) -> i64 {
    let mut i = 0;
    while i < raw.len() && raw[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut negative = false;
    if i < raw.len() && (raw[i] == b'-' || raw[i] == b'+') {
        negative = raw[i] == b'-';
        i += 1;
    }

    let mut value: i64 = 0;
    while i < raw.len() && raw[i].is_ascii_digit() {
        let digit = i64::from(raw[i] - b'0');
        value = if negative {
            value.saturating_mul(10).saturating_sub(digit)
        } else {
            value.saturating_mul(10).saturating_add(digit)
        };
        i += 1;
    }
    value
}

/// `atof`: parses the longest prefix that forms a decimal floating point
/// literal (optional exponent), or `inf`/`infinity`/`nan`. 0.0 otherwise.
pub fn parse_f64(raw: &[u8]) -> f64 {
    let mut start = 0;
    while start < raw.len() && raw[start].is_ascii_whitespace() {
        start += 1;
    }
    let s = &raw[start..];

    let mut i = 0;
    if i < s.len() && (s[i] == b'-' || s[i] == b'+') {
        i += 1;
    }

    let rest = &s[i..];
    for word in [&b"infinity"[..], b"inf", b"nan"] {
        if rest.len() >= word.len() && rest[..word.len()].eq_ignore_ascii_case(word) {
            return std::str::from_utf8(&s[..i + word.len()])
                .ok()
                .and_then(|t| t.parse::<f64>().ok())
                .unwrap_or(0.0);
        }
    }

    let mut digits = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        i += 1;
        digits += 1;
    }
    if i < s.len() && s[i] == b'.' {
        i += 1;
        while i < s.len() && s[i].is_ascii_digit() {
            i += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return 0.0;
    }

    // Exponent only counts when at least one digit follows it.
    if i < s.len() && (s[i] == b'e' || s[i] == b'E') {
        let mut j = i + 1;
        if j < s.len() && (s[j] == b'-' || s[j] == b'+') {
            j += 1;
        }
        let exp_start = j;
        while j < s.len() && s[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }

    std::str::from_utf8(&s[..i])
        .ok()
        .and_then(|t| t.parse::<f64>().ok())
        .unwrap_or(0.0)
}

// ------------------------------------------------------------------------------------------------
// Bucket routing
// ------------------------------------------------------------------------------------------------

/// Rotate/xor hash over the key bytes up to the first tab or NUL.
pub fn key_hash(key: &[u8]) -> u32 {
    let mut h = BUCKET_HASH_SEED;
    for &byte in key {
        if byte == b'\t' || byte == 0 {
            break;
        }
        h ^= u32::from(byte);
        h = h.rotate_left(5);
    }
    h
}

/// Bucket a key is routed to. Every component uses this one function so
/// equal keys from different workers always meet in the same bucket.
pub fn bucket_of(key: &[u8], buckets: usize) -> usize {
    if buckets <= 1 {
        return 0;
    }
    key_hash(key) as usize % buckets
}

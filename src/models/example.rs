//! Dataset examples and per-function dataset bookkeeping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One observed or asserted (input, output) pair for a function.
///
/// Alignment examples are asserted by the caller as ground truth. Patch
/// examples are captured from live traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExample {
    /// Positional arguments
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,

    /// Function output
    pub output: Value,
}

impl FunctionExample {
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>, output: Value) -> Self {
        Self {
            args,
            kwargs,
            output,
        }
    }

    /// Serialize as a single dataset line (without trailing newline).
    pub fn to_record(&self) -> String {
        // Value maps are BTreeMaps, so the encoding is canonical.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Structural identity used to collapse duplicates when building prompts.
    pub fn identity(&self) -> String {
        self.to_record()
    }
}

/// The four datasets kept for every function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Caller-asserted examples for symbolic functions
    SymbolicAlignment,
    /// Pairs that should embed close together
    PositiveEmbedding,
    /// Pairs that should embed far apart
    NegativeEmbedding,
    /// Examples captured from production calls
    Patch,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 4] = [
        DatasetKind::SymbolicAlignment,
        DatasetKind::PositiveEmbedding,
        DatasetKind::NegativeEmbedding,
        DatasetKind::Patch,
    ];

    /// File extension of this dataset in the log root.
    pub fn extension(self) -> &'static str {
        match self {
            DatasetKind::SymbolicAlignment => "alignments",
            DatasetKind::PositiveEmbedding => "positive",
            DatasetKind::NegativeEmbedding => "negative",
            DatasetKind::Patch => "patches",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// In-memory record counts per (dataset kind, function hash).
///
/// A missing entry means the size has not been read from storage yet.
#[derive(Debug, Clone, Default)]
pub struct DatasetSizeIndex {
    sizes: HashMap<DatasetKind, HashMap<String, usize>>,
}

impl DatasetSizeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known size, or `None` if it has not been loaded.
    pub fn get(&self, kind: DatasetKind, func_hash: &str) -> Option<usize> {
        self.sizes.get(&kind)?.get(func_hash).copied()
    }

    pub fn set(&mut self, kind: DatasetKind, func_hash: &str, size: usize) {
        self.sizes
            .entry(kind)
            .or_default()
            .insert(func_hash.to_string(), size);
    }

    /// Increment a known size. Unknown sizes stay unknown and must be loaded first.
    pub fn increment(&mut self, kind: DatasetKind, func_hash: &str) -> Option<usize> {
        let size = self.sizes.get_mut(&kind)?.get_mut(func_hash)?;
        *size += 1;
        Some(*size)
    }

    /// All function hashes with at least one known dataset.
    pub fn functions(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .sizes
            .values()
            .flat_map(|by_hash| by_hash.keys().cloned())
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }
}

/// Approximate the token count of a piece of text.
///
/// Words count as 1.333 tokens each (rounded up over the whole text), and every
/// character that is neither alphanumeric nor whitespace (`_` included)
/// counts as one more.
pub fn approximate_token_count(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let punctuation = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    (words as f64 * 1.333).ceil() as usize + punctuation
}

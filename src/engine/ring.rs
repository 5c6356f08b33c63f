//! Recent examples kept in memory for prompting.
//!
//! Each (dataset kind, function) gets a byte-bounded buffer of
//! newline-delimited records. When full, the oldest bytes are dropped, which
//! can leave a truncated first record; readers skip it.

use crate::models::{approximate_token_count, DatasetKind, FunctionExample};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug)]
pub struct ExampleRing {
    capacity: usize,
    buffers: HashMap<(DatasetKind, String), String>,
}

impl ExampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: HashMap::new(),
        }
    }

    pub fn push(&mut self, kind: DatasetKind, func_hash: &str, example: &FunctionExample) {
        let buffer = self
            .buffers
            .entry((kind, func_hash.to_string()))
            .or_default();
        buffer.push_str(&example.to_record());
        buffer.push('\n');

        if buffer.len() > self.capacity {
            let mut start = buffer.len() - self.capacity;
            while !buffer.is_char_boundary(start) {
                start += 1;
            }
            buffer.drain(..start);
        }
    }

    /// Distinct examples, oldest first, within `max` items and `token_budget`.
    pub fn examples(
        &self,
        kind: DatasetKind,
        func_hash: &str,
        max: usize,
        token_budget: usize,
    ) -> Vec<FunctionExample> {
        let Some(buffer) = self.buffers.get(&(kind, func_hash.to_string())) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        let mut tokens_used = 0;

        for line in buffer.split('\n').filter(|line| !line.trim().is_empty()) {
            if selected.len() >= max {
                break;
            }
            let example: FunctionExample = match serde_json::from_str(line) {
                Ok(example) => example,
                Err(e) => {
                    debug!(func_hash = %func_hash, error = %e, "Skipping malformed buffered example");
                    continue;
                }
            };
            if !seen.insert(example.identity()) {
                continue;
            }
            let tokens = approximate_token_count(line);
            if tokens_used + tokens > token_budget {
                break;
            }
            tokens_used += tokens;
            selected.push(example);
        }

        selected
    }
}

//! Buffered, deduplicated append-only dataset logs.
//!
//! One newline-delimited file per (dataset kind, function hash). Alignments
//! are appended immediately; patches are buffered per key and flushed with a
//! geometrically growing threshold, plus a global force-flush every
//! `WRITE_LIMIT` writes.

use super::bloom::MembershipFilter;
use crate::models::{DatasetKind, DistilleryError, FunctionExample, Result};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound on a single key's buffered bytes before it is flushed.
pub const MAX_BUFFER_BYTES: usize = 4096;

/// Writes across all keys after which every buffer is flushed.
pub const WRITE_LIMIT: usize = 1000;

/// Result of logging one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOutcome {
    /// The example reached durable storage
    pub saved: bool,
    /// The example had not been seen before
    pub is_new: bool,
}

impl LogOutcome {
    pub const DUPLICATE: LogOutcome = LogOutcome {
        saved: false,
        is_new: false,
    };
}

type BufferKey = (DatasetKind, String);

#[derive(Debug, Default)]
struct PatchBuffer {
    bytes: Vec<u8>,
    records: usize,
}

/// Append-only dataset logs rooted at one directory.
#[derive(Debug)]
pub struct AppendLog {
    dir: PathBuf,
    filter: MembershipFilter,
    buffers: HashMap<BufferKey, PatchBuffer>,
    flush_limits: HashMap<BufferKey, usize>,
    write_count: usize,
}

impl AppendLog {
    /// Open the log root, loading the persisted membership filter.
    pub fn open(dir: &Path, mut filter: MembershipFilter) -> Result<Self> {
        filter.load()?;
        Ok(Self {
            dir: dir.to_path_buf(),
            filter,
            buffers: HashMap::new(),
            flush_limits: HashMap::new(),
            write_count: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one dataset file.
    pub fn dataset_path(&self, kind: DatasetKind, func_hash: &str) -> PathBuf {
        self.dir.join(format!("{func_hash}.{}", kind.extension()))
    }

    fn ensure_dir(&self) -> bool {
        match fs::create_dir_all(&self.dir) {
            Ok(()) => true,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot create log root");
                false
            }
        }
    }

    /// Check-and-mark in one step so two writers can never both see "new".
    fn mark_seen(&mut self, func_hash: &str, record: &str) -> bool {
        let key = format!("{func_hash}{record}");
        if self.filter.lookup(&key) {
            return false;
        }
        self.filter.add(&key);
        true
    }

    fn persist_filter(&self) {
        if let Err(e) = self.filter.save() {
            warn!(error = %e, "Failed to persist membership filter");
        }
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DistilleryError::io("opening dataset", e))?;
        file.write_all(bytes)
            .map_err(|e| DistilleryError::io("appending to dataset", e))?;
        Ok(())
    }

    /// Log an alignment example directly to disk.
    pub fn log_alignment(
        &mut self,
        func_hash: &str,
        example: &FunctionExample,
        kind: DatasetKind,
    ) -> LogOutcome {
        let record = example.to_record();
        if self.filter.lookup(&format!("{func_hash}{record}")) {
            return LogOutcome::DUPLICATE;
        }
        if !self.ensure_dir() {
            return LogOutcome::DUPLICATE;
        }

        self.mark_seen(func_hash, &record);
        self.persist_filter();

        let path = self.dataset_path(kind, func_hash);
        let line = format!("{record}\n");
        match self.append(&path, line.as_bytes()) {
            Ok(()) => {
                debug!(func_hash = %func_hash, kind = %kind, "Alignment logged");
                LogOutcome {
                    saved: true,
                    is_new: true,
                }
            }
            Err(e) => {
                warn!(func_hash = %func_hash, kind = %kind, error = %e, "Failed to log alignment");
                LogOutcome {
                    saved: false,
                    is_new: true,
                }
            }
        }
    }

    /// Log a patch example into its key's buffer, flushing as thresholds allow.
    pub fn log_patch(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome {
        let record = example.to_record();
        if self.filter.lookup(&format!("{func_hash}{record}")) {
            return LogOutcome::DUPLICATE;
        }
        if !self.ensure_dir() {
            return LogOutcome::DUPLICATE;
        }
        self.mark_seen(func_hash, &record);

        let key: BufferKey = (DatasetKind::Patch, func_hash.to_string());
        let buffer = self.buffers.entry(key.clone()).or_default();
        buffer.bytes.extend_from_slice(record.as_bytes());
        buffer.bytes.push(b'\n');
        buffer.records += 1;
        let buffered = buffer.bytes.len();
        self.write_count += 1;

        let limit = *self.flush_limits.entry(key.clone()).or_insert(1);
        let mut saved = false;
        if buffered >= limit.min(MAX_BUFFER_BYTES) {
            saved = self.flush_key(&key).is_some();
            self.flush_limits.insert(key, limit.saturating_mul(2));
        }

        if self.write_count >= WRITE_LIMIT {
            let flushed = self.flush();
            saved = saved || flushed.contains_key(func_hash);
            self.write_count = 0;
        }

        LogOutcome {
            saved,
            is_new: true,
        }
    }

    /// Write one key's buffer. Returns the number of records written.
    fn flush_key(&mut self, key: &BufferKey) -> Option<usize> {
        let buffer = self.buffers.get(key)?;
        if buffer.bytes.is_empty() {
            return Some(0);
        }

        let path = self.dataset_path(key.0, &key.1);
        if let Err(e) = self.append(&path, &buffer.bytes) {
            warn!(func_hash = %key.1, error = %e, "Failed to flush dataset buffer");
            return None;
        }

        let written = buffer.records;
        self.buffers.remove(key);
        self.persist_filter();
        debug!(func_hash = %key.1, records = written, "Dataset buffer flushed");
        Some(written)
    }

    /// Force-write every non-empty buffer.
    ///
    /// Returns records written per function hash; failed keys keep their buffer.
    pub fn flush(&mut self) -> HashMap<String, usize> {
        let keys: Vec<BufferKey> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.bytes.is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        let mut written = HashMap::new();
        for key in keys {
            if let Some(count) = self.flush_key(&key) {
                *written.entry(key.1.clone()).or_insert(0) += count;
            }
        }
        written
    }

    /// Records still waiting in memory for one dataset.
    pub fn buffered_records(&self, kind: DatasetKind, func_hash: &str) -> Vec<String> {
        self.buffers
            .get(&(kind, func_hash.to_string()))
            .map(|buffer| {
                String::from_utf8_lossy(&buffer.bytes)
                    .lines()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current flush threshold of a key (1 until its first flush).
    pub fn flush_limit(&self, kind: DatasetKind, func_hash: &str) -> usize {
        self.flush_limits
            .get(&(kind, func_hash.to_string()))
            .copied()
            .unwrap_or(1)
    }
}

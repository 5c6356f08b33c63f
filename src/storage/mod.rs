//! Storage module: dataset logs, function configs and the membership filter.
//!
//! Provides:
//! - `MembershipFilter`: persistent Bloom filter for example deduplication
//! - `AppendLog`: buffered append-only dataset files
//! - `ConfigStore`: atomic per-function config records
//! - `PersistenceAdapter`: the boundary the engine talks to, with a
//!   filesystem implementation

mod append_log;
mod bloom;
mod config_store;

pub use append_log::*;
pub use bloom::*;
pub use config_store::*;

use crate::models::{
    DatasetKind, DatasetSizeIndex, DistilleryError, FunctionConfig, FunctionExample, Result,
    StorageConfig,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// What `load_dataset` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Length,
    Dataset,
    Both,
}

/// A dataset read back from storage.
#[derive(Debug, Clone, Default)]
pub struct LoadedDataset {
    /// Number of records, when requested
    pub length: Option<usize>,
    /// Parsed records, when requested; malformed lines are skipped
    pub records: Option<Vec<FunctionExample>>,
}

/// Storage boundary used by the distillation engine.
pub trait PersistenceAdapter: Send {
    /// Sizes of every dataset already in storage.
    fn load_existing_datasets(&mut self) -> Result<DatasetSizeIndex>;

    fn log_symbolic_align(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome;

    fn log_embeddable_align(
        &mut self,
        func_hash: &str,
        example: &FunctionExample,
        positive: bool,
    ) -> LogOutcome;

    fn log_symbolic_patch(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome;

    /// Force-write buffered examples; records written per function hash.
    fn flush(&mut self) -> HashMap<String, usize>;

    /// Persisted config, or `default` (persisted immediately) and `true`.
    fn load_function_config(
        &mut self,
        func_hash: &str,
        default: &FunctionConfig,
    ) -> (FunctionConfig, bool);

    fn update_function_config(&mut self, func_hash: &str, config: &FunctionConfig) -> Result<()>;

    fn load_dataset(&self, kind: DatasetKind, func_hash: &str, mode: LoadMode) -> Result<LoadedDataset>;
}

/// Filesystem layout: one directory holding every dataset, config and the filter.
#[derive(Debug)]
pub struct FilesystemAdapter {
    log: AppendLog,
    configs: ConfigStore,
}

impl FilesystemAdapter {
    /// Open the log root described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let filter = MembershipFilter::with_capacity(
            config.bloom_expected_items,
            config.bloom_false_positive_rate,
            Box::new(FileFilterStore::new(&config.dir)),
        )?;
        let log = AppendLog::open(&config.dir, filter)?;
        info!(dir = %config.dir.display(), "Opened dataset storage");
        Ok(Self {
            log,
            configs: ConfigStore::new(&config.dir),
        })
    }

    pub fn dir(&self) -> &Path {
        self.log.dir()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.configs
    }

    fn read_lines(&self, kind: DatasetKind, func_hash: &str) -> Result<Vec<String>> {
        let path = self.log.dataset_path(kind, func_hash);
        let mut lines = match File::open(&path) {
            Ok(file) => read_records(file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DistilleryError::io("opening dataset", e)),
        };
        lines.extend(self.log.buffered_records(kind, func_hash));
        Ok(lines)
    }
}

fn read_records(file: File) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| DistilleryError::io("reading dataset", e))?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Parse dataset lines, skipping malformed ones.
pub fn parse_records<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<FunctionExample> {
    lines
        .into_iter()
        .filter_map(|line| match serde_json::from_str::<FunctionExample>(line) {
            Ok(example) => Some(example),
            Err(e) => {
                debug!(error = %e, "Skipping malformed dataset record");
                None
            }
        })
        .collect()
}

impl PersistenceAdapter for FilesystemAdapter {
    fn load_existing_datasets(&mut self) -> Result<DatasetSizeIndex> {
        let mut index = DatasetSizeIndex::new();

        for kind in DatasetKind::ALL {
            let pattern = self.dir().join(format!("*.{}", kind.extension()));
            let paths: Vec<_> = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| DistilleryError::Internal(format!("Invalid glob pattern: {e}")))?
                .filter_map(|r| r.ok())
                .collect();

            for path in paths {
                let Some(stem) = path.file_stem() else {
                    continue;
                };
                let func_hash = stem.to_string_lossy();
                let length = self.read_lines(kind, &func_hash)?.len();
                index.set(kind, &func_hash, length);
            }
        }

        debug!(functions = index.functions().len(), "Scanned existing datasets");
        Ok(index)
    }

    fn log_symbolic_align(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome {
        self.log
            .log_alignment(func_hash, example, DatasetKind::SymbolicAlignment)
    }

    fn log_embeddable_align(
        &mut self,
        func_hash: &str,
        example: &FunctionExample,
        positive: bool,
    ) -> LogOutcome {
        let kind = if positive {
            DatasetKind::PositiveEmbedding
        } else {
            DatasetKind::NegativeEmbedding
        };
        self.log.log_alignment(func_hash, example, kind)
    }

    fn log_symbolic_patch(&mut self, func_hash: &str, example: &FunctionExample) -> LogOutcome {
        self.log.log_patch(func_hash, example)
    }

    fn flush(&mut self) -> HashMap<String, usize> {
        self.log.flush()
    }

    fn load_function_config(
        &mut self,
        func_hash: &str,
        default: &FunctionConfig,
    ) -> (FunctionConfig, bool) {
        self.configs.load_or_default(func_hash, default)
    }

    fn update_function_config(&mut self, func_hash: &str, config: &FunctionConfig) -> Result<()> {
        self.configs.write(func_hash, config)
    }

    fn load_dataset(&self, kind: DatasetKind, func_hash: &str, mode: LoadMode) -> Result<LoadedDataset> {
        let lines = self.read_lines(kind, func_hash)?;
        let mut loaded = LoadedDataset::default();
        if matches!(mode, LoadMode::Length | LoadMode::Both) {
            loaded.length = Some(lines.len());
        }
        if matches!(mode, LoadMode::Dataset | LoadMode::Both) {
            loaded.records = Some(parse_records(lines.iter().map(String::as_str)));
        }
        Ok(loaded)
    }
}

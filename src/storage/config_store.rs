//! Durable per-function config records.
//!
//! One `<hash>.json` file per function, always replaced whole via
//! write-then-rename so readers never observe a partially written record.

use crate::models::{DistilleryError, FunctionConfig, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Function config records under one log root.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Path of a function's config record.
    pub fn path(&self, func_hash: &str) -> PathBuf {
        self.dir.join(format!("{func_hash}.json"))
    }

    /// Check if a record exists.
    pub fn exists(&self, func_hash: &str) -> bool {
        self.path(func_hash).exists()
    }

    /// Read a record; `Ok(None)` if there is none.
    pub fn read(&self, func_hash: &str) -> Result<Option<FunctionConfig>> {
        let file = match File::open(self.path(func_hash)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DistilleryError::io("opening function config", e)),
        };
        let reader = BufReader::new(file);
        let config: FunctionConfig = serde_json::from_reader(reader).map_err(|e| {
            DistilleryError::ParseError(format!("Invalid function config {func_hash}: {e}"))
        })?;
        Ok(Some(config))
    }

    /// Replace a record atomically.
    pub fn write(&self, func_hash: &str, config: &FunctionConfig) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| DistilleryError::io("creating log root", e))?;

        let temp_path = self.dir.join(format!("{func_hash}.json.tmp"));
        {
            let file = File::create(&temp_path)
                .map_err(|e| DistilleryError::io("creating temp function config", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, config).map_err(|e| {
                DistilleryError::Internal(format!("Serializing function config: {e}"))
            })?;
            writer
                .flush()
                .map_err(|e| DistilleryError::io("flushing function config", e))?;
        }

        fs::rename(&temp_path, self.path(func_hash))
            .map_err(|e| DistilleryError::io("renaming function config", e))?;

        debug!(func_hash = %func_hash, "Function config saved");
        Ok(())
    }

    /// Read a record, materializing and persisting `default` when there is none.
    ///
    /// Returns the config and whether the default was used. Unreadable records
    /// also fall back to the default, which is then not written over them.
    pub fn load_or_default(
        &self,
        func_hash: &str,
        default: &FunctionConfig,
    ) -> (FunctionConfig, bool) {
        match self.read(func_hash) {
            Ok(Some(config)) => (config, false),
            Ok(None) => {
                if let Err(e) = self.write(func_hash, default) {
                    warn!(func_hash = %func_hash, error = %e, "Failed to persist default function config");
                } else {
                    info!(func_hash = %func_hash, "Created default function config");
                }
                (default.clone(), true)
            }
            Err(e) => {
                warn!(func_hash = %func_hash, error = %e, "Unreadable function config, using defaults");
                (default.clone(), true)
            }
        }
    }

    /// Hashes of all functions with a record.
    pub fn list(&self) -> Result<Vec<String>> {
        let pattern = self.dir.join("*.json");
        let mut hashes: Vec<String> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| DistilleryError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        hashes.sort();
        Ok(hashes)
    }
}

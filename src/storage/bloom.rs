//! Persistent membership filter (Bloom filter) used to deduplicate examples.
//!
//! Guarantees:
//! - No false negatives for items added to the same instance
//! - False positive rate bounded by the sizing parameters
//! - State round-trips through an injected `FilterStore` as a packed bit vector

use crate::models::{ConfigError, DistilleryError, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the shared filter blob inside the log root.
pub const FILTER_FILE_NAME: &str = "bloom_filter_state.bin";

/// Persistence port for the packed filter state.
pub trait FilterStore: Send {
    /// Overwrite the stored blob.
    fn save(&self, bytes: &[u8]) -> Result<()>;

    /// Read the stored blob. A missing blob is an `Io` error of kind `NotFound`.
    fn load(&self) -> Result<Vec<u8>>;
}

/// Filter blob stored as a file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileFilterStore {
    path: PathBuf,
}

impl FileFilterStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(FILTER_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FilterStore for FileFilterStore {
    fn save(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| DistilleryError::io("creating log root", e))?;
        }
        let temp_path = self.path.with_extension("bin.tmp");
        fs::write(&temp_path, bytes).map_err(|e| DistilleryError::io("writing filter state", e))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| DistilleryError::io("renaming filter state", e))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| DistilleryError::io("reading filter state", e))
    }
}

/// Optimal (bits, probes) for `expected_items` at `false_positive_rate`.
///
/// m = ⌈-n·ln(p) / ln(2)²⌉, k = ⌈(m/n)·ln(2)⌉
pub fn optimal_params(expected_items: usize, false_positive_rate: f64) -> (usize, usize) {
    let n = expected_items.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;
    let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil().max(1.0);
    let k = ((m / n) * ln2).ceil().max(1.0);
    (m as usize, k as usize)
}

/// Fixed-size Bloom filter with double hashing over two digests.
pub struct MembershipFilter {
    size: usize,
    hash_count: usize,
    /// Bit `j` of byte `i` is logical bit `8i + j`
    bits: Vec<u8>,
    store: Box<dyn FilterStore>,
}

impl MembershipFilter {
    /// Create an empty filter with explicit geometry.
    pub fn new(size: usize, hash_count: usize, store: Box<dyn FilterStore>) -> Self {
        let size = size.max(1);
        Self {
            size,
            hash_count: hash_count.max(1),
            bits: vec![0; size.div_ceil(8)],
            store,
        }
    }

    /// Create an empty filter sized for `expected_items` at `false_positive_rate`.
    ///
    /// # Errors
    ///
    /// Returns a config error unless `0 < false_positive_rate < 1`.
    pub fn with_capacity(
        expected_items: usize,
        false_positive_rate: f64,
        store: Box<dyn FilterStore>,
    ) -> Result<Self> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "bloom false positive rate {false_positive_rate} must be in (0, 1)"
            ))
            .into());
        }
        let (size, hash_count) = optimal_params(expected_items, false_positive_rate);
        Ok(Self::new(size, hash_count, store))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn hash_count(&self) -> usize {
        self.hash_count
    }

    fn digests(item: &str) -> (u64, u64) {
        let first = Sha256::digest(item.as_bytes());
        let second = Sha512::digest(item.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&first[..8]);
        h2.copy_from_slice(&second[..8]);
        (u64::from_be_bytes(h1), u64::from_be_bytes(h2))
    }

    fn indices(&self, item: &str) -> impl Iterator<Item = usize> + '_ {
        let (h1, h2) = Self::digests(item);
        let m = self.size as u128;
        (0..self.hash_count as u128).map(move |seed| ((h1 as u128 + seed * h2 as u128) % m) as usize)
    }

    /// Mark `item` as seen.
    pub fn add(&mut self, item: &str) {
        let indices: Vec<usize> = self.indices(item).collect();
        for index in indices {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// True if `item` may have been added; false means it definitely was not.
    pub fn lookup(&self, item: &str) -> bool {
        self.indices(item)
            .all(|index| self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Persist the packed bit vector.
    pub fn save(&self) -> Result<()> {
        self.store.save(&self.bits)?;
        debug!(bits = self.size, "Membership filter saved");
        Ok(())
    }

    /// Replace in-memory state with the persisted one.
    ///
    /// A missing blob leaves the filter empty; other errors propagate.
    pub fn load(&mut self) -> Result<()> {
        let bytes = match self.store.load() {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                info!("No persisted membership filter, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if bytes.len() != self.bits.len() {
            warn!(
                expected = self.bits.len(),
                found = bytes.len(),
                "Persisted membership filter has a different size, starting empty"
            );
            return Ok(());
        }

        self.bits = bytes;
        debug!(set_bits = self.count_ones(), "Membership filter loaded");
        Ok(())
    }
}

impl std::fmt::Debug for MembershipFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipFilter")
            .field("size", &self.size)
            .field("hash_count", &self.hash_count)
            .field("set_bits", &self.count_ones())
            .finish()
    }
}

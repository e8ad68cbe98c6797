//! Result stores keyed by image name.
//!
//! The predictor streams one finished image at a time into a store, so
//! whole-slide-sized outputs never need to reside in memory together. The
//! chunked-array persistence used in production deployments sits behind the
//! same [`ResultStore`] trait; the [`DirectoryStore`] here is a simple
//! one-file-per-map implementation for local runs and tests.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TeselaError};
use crate::predict::EnsembleResult;
use crate::primitives::Tensor;

/// Persistent container for per-image reconstruction results.
pub trait ResultStore {
    /// Store `result` under `name`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be persisted.
    fn put(&mut self, name: &str, result: &EnsembleResult) -> Result<()>;

    /// Retrieve the result stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownImage` if nothing is stored under `name`.
    fn get(&self, name: &str) -> Result<EnsembleResult>;

    /// True when a result is stored under `name`.
    fn contains(&self, name: &str) -> bool;

    /// All stored image names, sorted.
    fn names(&self) -> Vec<String>;
}

/// In-memory store, mainly for tests and small batches.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, EnsembleResult>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryStore {
    fn put(&mut self, name: &str, result: &EnsembleResult) -> Result<()> {
        self.entries.insert(name.to_string(), result.clone());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<EnsembleResult> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| TeselaError::UnknownImage {
                name: name.to_string(),
            })
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

const MAGIC: &[u8; 4] = b"TSL1";

/// Disk-backed store writing one binary file per map.
///
/// Files are named `<image>.smx`, `<image>.std` and `<image>.energy`; each
/// holds a magic tag, the shape, and raw little-endian f32 data.
///
/// # Examples
///
/// ```no_run
/// use tesela::store::{DirectoryStore, ResultStore};
///
/// let mut store = DirectoryStore::create("predictions")?;
/// assert!(store.names().is_empty());
/// # Ok::<(), tesela::error::TeselaError>(())
/// ```
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created.
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn map_path(&self, name: &str, suffix: &str) -> PathBuf {
        self.root.join(format!("{name}.{suffix}"))
    }

    fn write_map(&self, path: &Path, map: &Tensor) -> Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(MAGIC)?;
        file.write_all(&(map.ndim() as u32).to_le_bytes())?;
        for &dim in map.shape() {
            file.write_all(&(dim as u64).to_le_bytes())?;
        }
        for &value in map.data() {
            file.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    fn read_map(&self, path: &Path) -> Result<Tensor> {
        let mut file = fs::File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(TeselaError::Serialization(format!(
                "bad magic in {}",
                path.display()
            )));
        }
        let mut buf4 = [0u8; 4];
        file.read_exact(&mut buf4)?;
        let ndim = u32::from_le_bytes(buf4) as usize;

        let mut shape = Vec::with_capacity(ndim);
        let mut buf8 = [0u8; 8];
        for _ in 0..ndim {
            file.read_exact(&mut buf8)?;
            shape.push(u64::from_le_bytes(buf8) as usize);
        }

        let numel: usize = shape.iter().product();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() != numel * 4 {
            return Err(TeselaError::Serialization(format!(
                "truncated map in {}: expected {} bytes, got {}",
                path.display(),
                numel * 4,
                bytes.len()
            )));
        }
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Tensor::from_vec(data, &shape))
    }
}

impl ResultStore for DirectoryStore {
    fn put(&mut self, name: &str, result: &EnsembleResult) -> Result<()> {
        self.write_map(&self.map_path(name, "smx"), result.softmax())?;
        if let Some(uncertainty) = result.uncertainty() {
            self.write_map(&self.map_path(name, "std"), uncertainty)?;
        }
        if let Some(energy) = result.energy() {
            self.write_map(&self.map_path(name, "energy"), energy)?;
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Result<EnsembleResult> {
        let smx_path = self.map_path(name, "smx");
        if !smx_path.exists() {
            return Err(TeselaError::UnknownImage {
                name: name.to_string(),
            });
        }
        let softmax = self.read_map(&smx_path)?;
        let std_path = self.map_path(name, "std");
        let uncertainty = if std_path.exists() {
            Some(self.read_map(&std_path)?)
        } else {
            None
        };
        let energy_path = self.map_path(name, "energy");
        let energy = if energy_path.exists() {
            Some(self.read_map(&energy_path)?)
        } else {
            None
        };
        EnsembleResult::from_maps(softmax, uncertainty, energy)
    }

    fn contains(&self, name: &str) -> bool {
        self.map_path(name, "smx").exists()
    }

    fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("smx") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }
}
